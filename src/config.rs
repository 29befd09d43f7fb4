use crate::error::{Error, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Bootstrap a new ring
    Create,
    /// Join an existing ring through a seed peer
    Join,
}

/// Peer configuration. All peers in one ring must agree on the
/// identifier bits, the successor-list length and the hash function.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Host other peers use to reach this node
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on
    #[arg(long)]
    pub port: u16,

    /// Create a new ring or join an existing one
    #[arg(long, value_enum, default_value = "create")]
    pub mode: Mode,

    /// Seed host, required when joining
    #[arg(long)]
    pub join_host: Option<String>,

    /// Seed port, required when joining
    #[arg(long)]
    pub join_port: Option<u16>,

    /// Identifier bits m; the ring has 2^m positions
    #[arg(short = 'm', long, default_value_t = 32)]
    pub identifier_bits: u32,

    /// Successor-list length r; each peer keeps r replica stores
    #[arg(short = 'r', long, default_value_t = 3)]
    pub successors: usize,

    /// Stabilize period in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub stabilize_ms: u64,

    /// Fix-fingers period in milliseconds
    #[arg(long, default_value_t = 500)]
    pub fix_fingers_ms: u64,

    /// Check-predecessor period in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub check_predecessor_ms: u64,

    /// Outbound RPC timeout in milliseconds, defaults to the stabilize period
    #[arg(long)]
    pub rpc_timeout_ms: Option<u64>,

    /// Root directory for the primary store and the r backup stores
    #[arg(long)]
    pub storage_dir: PathBuf,

    /// PEM certificate for mutual TLS; give all three TLS flags or none
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for mutual TLS
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// PEM CA bundle both sides verify against
    #[arg(long)]
    pub tls_ca: Option<PathBuf>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if !(1..=64).contains(&self.identifier_bits) {
            return Err(Error::Config(format!(
                "identifier bits must be in 1..=64, got {}",
                self.identifier_bits
            )));
        }
        if self.successors == 0 {
            return Err(Error::Config("successor-list length must be at least 1".into()));
        }
        if self.stabilize_ms == 0 || self.fix_fingers_ms == 0 || self.check_predecessor_ms == 0 {
            return Err(Error::Config("periods must be positive milliseconds".into()));
        }
        if self.rpc_timeout_ms == Some(0) {
            return Err(Error::Config("rpc timeout must be positive".into()));
        }
        if self.mode == Mode::Join && (self.join_host.is_none() || self.join_port.is_none()) {
            return Err(Error::Config(
                "join mode requires --join-host and --join-port".into(),
            ));
        }
        let tls_given = [&self.tls_cert, &self.tls_key, &self.tls_ca]
            .iter()
            .filter(|p| p.is_some())
            .count();
        if tls_given != 0 && tls_given != 3 {
            return Err(Error::Config(
                "tls needs --tls-cert, --tls-key and --tls-ca together".into(),
            ));
        }
        Ok(())
    }

    pub fn stabilize_period(&self) -> Duration {
        Duration::from_millis(self.stabilize_ms)
    }

    pub fn fix_fingers_period(&self) -> Duration {
        Duration::from_millis(self.fix_fingers_ms)
    }

    pub fn check_predecessor_period(&self) -> Duration {
        Duration::from_millis(self.check_predecessor_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms.unwrap_or(self.stabilize_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            host: "127.0.0.1".into(),
            port: 4000,
            mode: Mode::Create,
            join_host: None,
            join_port: None,
            identifier_bits: 32,
            successors: 3,
            stabilize_ms: 1000,
            fix_fingers_ms: 500,
            check_predecessor_ms: 1000,
            rpc_timeout_ms: None,
            storage_dir: PathBuf::from("/tmp/chordfs"),
            tls_cert: None,
            tls_key: None,
            tls_ca: None,
        }
    }

    #[test]
    fn accepts_sane_config() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn rejects_bad_ring_parameters() {
        let mut config = base();
        config.identifier_bits = 0;
        assert!(config.validate().is_err());
        config.identifier_bits = 65;
        assert!(config.validate().is_err());

        let mut config = base();
        config.successors = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_periods() {
        let mut config = base();
        config.stabilize_ms = 0;
        assert!(config.validate().is_err());

        let mut config = base();
        config.rpc_timeout_ms = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn join_needs_a_seed() {
        let mut config = base();
        config.mode = Mode::Join;
        assert!(config.validate().is_err());
        config.join_host = Some("127.0.0.1".into());
        config.join_port = Some(4001);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn tls_is_all_or_nothing() {
        let mut config = base();
        config.tls_cert = Some(PathBuf::from("cert.pem"));
        assert!(config.validate().is_err());
        config.tls_key = Some(PathBuf::from("key.pem"));
        config.tls_ca = Some(PathBuf::from("ca.pem"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rpc_timeout_defaults_to_stabilize_period() {
        let config = base();
        assert_eq!(config.rpc_timeout(), config.stabilize_period());
        let mut config = base();
        config.rpc_timeout_ms = Some(250);
        assert_eq!(config.rpc_timeout(), Duration::from_millis(250));
    }
}
