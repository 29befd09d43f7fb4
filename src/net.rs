use crate::error::{Error, Result};
use crate::messages::{Reply, Request};
use crate::node::Node;
use crate::ring::{Id, NodeInfo};
use crate::storage::FileEntry;
use serde::{de::DeserializeOwned, Serialize};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

// replication batches carry whole stores
const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

// Handles serialization of the raw message
pub(crate) async fn send_msg<M, W>(stream: &mut W, msg: &M) -> Result<()>
where
    M: Serialize,
    W: AsyncWriteExt + Unpin,
{
    let encoded =
        bincode::serialize(msg).map_err(|e| Error::Protocol(format!("encoding message: {e}")))?;
    let len = encoded.len() as u32;
    stream
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;
    stream
        .write_all(&encoded)
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;
    Ok(())
}

// handles deserialization of the raw message
pub(crate) async fn recv_msg<M, R>(stream: &mut R) -> Result<M>
where
    M: DeserializeOwned,
    R: AsyncReadExt + Unpin,
{
    let mut len_bytes = [0u8; 4];
    stream
        .read_exact(&mut len_bytes)
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(Error::Protocol(format!("message of {len} bytes too large")));
    }
    let mut buffer = vec![0u8; len];
    stream
        .read_exact(&mut buffer)
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;
    bincode::deserialize(&buffer).map_err(|e| Error::Protocol(format!("decoding message: {e}")))
}

/// Mutually-authenticated TLS material: both sides present a certificate
/// and verify the other against the shared CA bundle.
pub struct TlsContext {
    connector: TlsConnector,
    acceptor: TlsAcceptor,
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Config(format!("opening {}: {e}", path.display())))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::Config(format!("reading certificates from {}: {e}", path.display())))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Config(format!("opening {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::Config(format!("reading key from {}: {e}", path.display())))?
        .ok_or_else(|| Error::Config(format!("no private key in {}", path.display())))
}

impl TlsContext {
    pub fn from_files(cert: &Path, key: &Path, ca: &Path) -> Result<Self> {
        let certs = load_certs(cert)?;
        let key = load_key(key)?;

        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca)? {
            roots
                .add(cert)
                .map_err(|e| Error::Config(format!("bad CA certificate: {e}")))?;
        }
        let roots = Arc::new(roots);

        let verifier = WebPkiClientVerifier::builder(roots.clone())
            .build()
            .map_err(|e| Error::Config(format!("building client verifier: {e}")))?;
        let server = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs.clone(), key.clone_key())
            .map_err(|e| Error::Config(format!("bad server certificate: {e}")))?;

        let client = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|e| Error::Config(format!("bad client certificate: {e}")))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(client)),
            acceptor: TlsAcceptor::from(Arc::new(server)),
        })
    }
}

/// RPC client. Every call opens a fresh connection, exchanges one
/// request and one reply, and closes; there is no pooling. The whole
/// exchange runs under one bounded timeout, and a timeout is treated
/// exactly like a transport error.
pub struct Rpc {
    tls: Option<Arc<TlsContext>>,
    timeout: Duration,
    successors_len: usize,
}

impl Rpc {
    pub fn new(tls: Option<Arc<TlsContext>>, timeout: Duration, successors_len: usize) -> Self {
        Self {
            tls,
            timeout,
            successors_len,
        }
    }

    pub async fn call(&self, target: &NodeInfo, request: &Request) -> Result<Reply> {
        if target.is_empty() {
            return Err(Error::Transport("no peer to call".into()));
        }
        tokio::time::timeout(self.timeout, self.exchange(target, request))
            .await
            .map_err(|_| Error::Timeout(self.timeout))?
    }

    async fn exchange(&self, target: &NodeInfo, request: &Request) -> Result<Reply> {
        let stream = TcpStream::connect(target.address())
            .await
            .map_err(|e| Error::Transport(format!("connecting {}: {e}", target.address())))?;
        let _ = stream.set_nodelay(true);
        match &self.tls {
            Some(tls) => {
                let name = ServerName::try_from(target.host.clone())
                    .map_err(|_| Error::Transport(format!("bad server name {}", target.host)))?;
                let mut stream = tls
                    .connector
                    .connect(name, stream)
                    .await
                    .map_err(|e| Error::Transport(format!("tls handshake: {e}")))?;
                send_msg(&mut stream, request).await?;
                recv_msg(&mut stream).await
            }
            None => {
                let mut stream = stream;
                send_msg(&mut stream, request).await?;
                recv_msg(&mut stream).await
            }
        }
    }

    fn unexpected(method: &str, reply: &Reply) -> Error {
        Error::Protocol(format!("unexpected reply to {method}: {reply:?}"))
    }

    pub async fn find_successor(&self, target: &NodeInfo, identifier: Id) -> Result<(bool, NodeInfo)> {
        match self
            .call(target, &Request::FindSuccessor { identifier })
            .await?
        {
            Reply::FindSuccessor { found, node } => Ok((found, node)),
            other => Err(Self::unexpected("FindSuccessor", &other)),
        }
    }

    pub async fn get_predecessor(&self, target: &NodeInfo) -> Result<NodeInfo> {
        match self.call(target, &Request::GetPredecessor).await? {
            Reply::Predecessor { node } => Ok(node),
            other => Err(Self::unexpected("GetPredecessor", &other)),
        }
    }

    /// The peer's successor list; anything but exactly r entries is a
    /// protocol violation.
    pub async fn get_successors(&self, target: &NodeInfo) -> Result<Vec<NodeInfo>> {
        match self.call(target, &Request::GetSuccessors).await? {
            Reply::Successors { nodes } => {
                if nodes.len() != self.successors_len {
                    return Err(Error::Protocol(format!(
                        "peer returned {} successors, expected {}",
                        nodes.len(),
                        self.successors_len
                    )));
                }
                Ok(nodes)
            }
            other => Err(Self::unexpected("GetSuccessors", &other)),
        }
    }

    pub async fn get_node_info(&self, target: &NodeInfo) -> Result<NodeInfo> {
        match self.call(target, &Request::GetNodeInfo).await? {
            Reply::NodeInfo { node } => Ok(node),
            other => Err(Self::unexpected("GetNodeInfo", &other)),
        }
    }

    pub async fn get_length(&self, target: &NodeInfo) -> Result<(u32, usize)> {
        match self.call(target, &Request::GetLength).await? {
            Reply::Length {
                identifier_bits,
                successors,
            } => Ok((identifier_bits, successors)),
            other => Err(Self::unexpected("GetLength", &other)),
        }
    }

    /// One round trip; any failure means "not live" for this call only.
    pub async fn live_check(&self, target: &NodeInfo) -> bool {
        if target.is_empty() {
            return false;
        }
        matches!(self.call(target, &Request::LiveCheck).await, Ok(Reply::Ack))
    }

    pub async fn notify(&self, target: &NodeInfo, candidate: &NodeInfo) -> Result<()> {
        match self
            .call(
                target,
                &Request::Notify {
                    candidate: candidate.clone(),
                },
            )
            .await?
        {
            Reply::Ack => Ok(()),
            other => Err(Self::unexpected("Notify", &other)),
        }
    }

    pub async fn notify_successor_leave(&self, target: &NodeInfo) -> Result<()> {
        match self.call(target, &Request::NotifySuccessorLeave).await? {
            Reply::Ack => Ok(()),
            other => Err(Self::unexpected("NotifySuccessorLeave", &other)),
        }
    }

    pub async fn notify_predecessor_leave(
        &self,
        target: &NodeInfo,
        predecessor: &NodeInfo,
    ) -> Result<()> {
        match self
            .call(
                target,
                &Request::NotifyPredecessorLeave {
                    predecessor: predecessor.clone(),
                },
            )
            .await?
        {
            Reply::Ack => Ok(()),
            other => Err(Self::unexpected("NotifyPredecessorLeave", &other)),
        }
    }

    pub async fn store_file(&self, target: &NodeInfo, file: FileEntry) -> Result<bool> {
        match self.call(target, &Request::StoreFile { file }).await? {
            Reply::Store { success } => Ok(success),
            other => Err(Self::unexpected("StoreFile", &other)),
        }
    }

    pub async fn get_file(&self, target: &NodeInfo, name: &str) -> Result<(bool, Option<Vec<u8>>)> {
        match self
            .call(
                target,
                &Request::GetFile {
                    name: name.to_string(),
                },
            )
            .await?
        {
            Reply::File { success, body } => Ok((success, body)),
            other => Err(Self::unexpected("GetFile", &other)),
        }
    }

    pub async fn store_files(&self, target: &NodeInfo, files: &[FileEntry]) -> Result<bool> {
        match self
            .call(
                target,
                &Request::StoreFiles {
                    files: files.to_vec(),
                },
            )
            .await?
        {
            Reply::Store { success } => Ok(success),
            other => Err(Self::unexpected("StoreFiles", &other)),
        }
    }

    pub async fn get_all_files(&self, target: &NodeInfo) -> Result<Vec<FileEntry>> {
        match self.call(target, &Request::GetAllFiles).await? {
            Reply::Files { success: true, files } => Ok(files),
            Reply::Files { success: false, .. } => Err(Error::Storage(format!(
                "peer {target} could not list its files"
            ))),
            other => Err(Self::unexpected("GetAllFiles", &other)),
        }
    }

    pub async fn get_all_backup_files(&self, target: &NodeInfo) -> Result<Vec<Vec<FileEntry>>> {
        match self.call(target, &Request::GetAllBackupFiles).await? {
            Reply::BackupFiles { success: true, lists } => {
                if lists.len() != self.successors_len {
                    return Err(Error::Protocol(format!(
                        "peer returned {} backup lists, expected {}",
                        lists.len(),
                        self.successors_len
                    )));
                }
                Ok(lists)
            }
            Reply::BackupFiles { success: false, .. } => Err(Error::Storage(format!(
                "peer {target} could not list its backup files"
            ))),
            other => Err(Self::unexpected("GetAllBackupFiles", &other)),
        }
    }
}

pub async fn bind(port: u16) -> Result<TcpListener> {
    let addr = format!("0.0.0.0:{port}");
    TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Bind { addr, source: e })
}

/// Accept loop. Observes the shutdown signal at the top of each
/// iteration and drops the listener on the way out; in-flight
/// connections finish naturally on their own tasks.
pub fn serve(node: Arc<Node>, listener: TcpListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown = node.shutdown_signal();
        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let node = node.clone();
                        tokio::spawn(async move {
                            handle_connection(node, stream).await;
                        });
                    }
                    Err(e) => debug!("accept failed: {e}"),
                },
            }
        }
    })
}

async fn handle_connection(node: Arc<Node>, stream: TcpStream) {
    let _ = stream.set_nodelay(true);
    let tls = node.tls().cloned();
    match tls {
        Some(tls) => match tls.acceptor.accept(stream).await {
            Ok(mut stream) => serve_one(node, &mut stream).await,
            Err(e) => debug!("tls accept failed: {e}"),
        },
        None => {
            let mut stream = stream;
            serve_one(node, &mut stream).await;
        }
    }
}

// one request, one reply, then the connection is done
async fn serve_one<S>(node: Arc<Node>, stream: &mut S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request: Request = match recv_msg(stream).await {
        Ok(request) => request,
        Err(e) => {
            debug!("bad request: {e}");
            return;
        }
    };
    let reply = node.handle_request(request).await;
    if let Err(e) = send_msg(stream, &reply).await {
        debug!("sending reply: {e}");
    }
}
