use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong inside a peer. Transport and timeout
/// failures mean "that peer is not live for this call", nothing more.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport: {0}")]
    Transport(String),

    #[error("rpc timed out after {0:?}")]
    Timeout(Duration),

    #[error("lookup exceeded {0} hops")]
    LookupExceeded(usize),

    #[error("ring parameter mismatch: peer has m={peer_bits} r={peer_successors}, local m={local_bits} r={local_successors}")]
    ParameterMismatch {
        peer_bits: u32,
        peer_successors: usize,
        local_bits: u32,
        local_successors: usize,
    },

    #[error("storage: {0}")]
    Storage(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("config: {0}")]
    Config(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("ring collapsed: no successor is live")]
    RingCollapsed,
}

impl Error {
    /// Transport, timeout and protocol errors all count as "the peer did
    /// not answer properly"; callers treat them alike.
    pub fn peer_unreachable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Timeout(_) | Error::Protocol(_)
        )
    }
}
