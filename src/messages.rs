use crate::ring::{Id, NodeInfo};
use crate::storage::FileEntry;
use serde::{Deserialize, Serialize};

/// Every RPC a peer can receive. One request and one reply per
/// connection; the reply shape is fixed per method.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    // routing
    FindSuccessor { identifier: Id },
    GetPredecessor,
    GetSuccessors,
    GetNodeInfo,
    GetLength,
    LiveCheck,
    // membership, handled on a background task
    Notify { candidate: NodeInfo },
    NotifySuccessorLeave,
    NotifyPredecessorLeave { predecessor: NodeInfo },
    // files
    StoreFile { file: FileEntry },
    GetFile { name: String },
    StoreFiles { files: Vec<FileEntry> },
    GetAllFiles,
    GetAllBackupFiles,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Reply {
    FindSuccessor { found: bool, node: NodeInfo },
    Predecessor { node: NodeInfo },
    Successors { nodes: Vec<NodeInfo> },
    NodeInfo { node: NodeInfo },
    // the ring parameters every peer must agree on
    Length { identifier_bits: u32, successors: usize },
    // LiveCheck and the notify family only acknowledge
    Ack,
    Store { success: bool },
    File { success: bool, body: Option<Vec<u8>> },
    Files { success: bool, files: Vec<FileEntry> },
    BackupFiles { success: bool, lists: Vec<Vec<FileEntry>> },
}
