mod config;
mod error;
mod messages;
mod net;
mod node;
mod ring;
mod routing;
mod storage;

pub use config::{Config, Mode};
pub use error::{Error, Result};
pub use messages::{Reply, Request};
pub use net::{bind, Rpc, TlsContext};
pub use node::{Node, NodeState};
pub use ring::{Id, NodeInfo, Ring};
pub use storage::{FileEntry, FileStore};
