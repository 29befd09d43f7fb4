use crate::config::Config;
use crate::error::{Error, Result};
use crate::messages::{Reply, Request};
use crate::net::{self, Rpc, TlsContext};
use crate::ring::{Id, NodeInfo, Ring};
use crate::routing::RoutingTable;
use crate::storage::{FileEntry, FileStore};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

// hard cap on lookup hops, a safety net against corrupted routing state
const MAX_LOOKUP_STEPS: usize = 10;

/// One peer on the ring: routing state, a primary store for the keys it
/// owns, and r backup stores mirroring its successors' primaries.
pub struct Node {
    info: NodeInfo,
    ring: Ring,
    successors_len: usize,
    routing: RoutingTable,
    finger_index: Vec<Id>,
    // rotating fix-fingers cursor, touched only by that loop
    next_finger: AtomicUsize,
    primary: FileStore,
    backups: Vec<FileStore>,
    rpc: Rpc,
    tls: Option<Arc<TlsContext>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    stabilize_period: Duration,
    fix_fingers_period: Duration,
    check_predecessor_period: Duration,
}

impl Node {
    pub async fn new(config: &Config) -> Result<Arc<Self>> {
        config.validate()?;

        let ring = Ring::new(config.identifier_bits);
        let info = NodeInfo::new(ring, &config.host, config.port);
        let finger_index = (0..config.identifier_bits)
            .map(|i| ring.finger_offset(info.identifier, i))
            .collect();

        let primary = FileStore::open(config.storage_dir.join("primary")).await?;
        let mut backups = Vec::with_capacity(config.successors);
        for i in 0..config.successors {
            backups.push(FileStore::open(config.storage_dir.join(format!("backup{i}"))).await?);
        }

        let tls = match (&config.tls_cert, &config.tls_key, &config.tls_ca) {
            (Some(cert), Some(key), Some(ca)) => {
                Some(Arc::new(TlsContext::from_files(cert, key, ca)?))
            }
            _ => None,
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Arc::new(Self {
            rpc: Rpc::new(tls.clone(), config.rpc_timeout(), config.successors),
            routing: RoutingTable::new(config.successors, config.identifier_bits as usize),
            info,
            ring,
            successors_len: config.successors,
            finger_index,
            next_finger: AtomicUsize::new(0),
            primary,
            backups,
            tls,
            shutdown_tx,
            shutdown_rx,
            stabilize_period: config.stabilize_period(),
            fix_fingers_period: config.fix_fingers_period(),
            check_predecessor_period: config.check_predecessor_period(),
        }))
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn ring(&self) -> Ring {
        self.ring
    }

    pub(crate) fn tls(&self) -> Option<&Arc<TlsContext>> {
        self.tls.as_ref()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /*                         membership                         */

    /// Bootstrap a new ring: the only successor is the node itself,
    /// the predecessor stays empty.
    pub async fn create(&self) {
        self.routing.set_first_successor(self.info.clone()).await;
    }

    /// Join the ring a seed peer belongs to. Fails if the seed's ring
    /// parameters differ from ours.
    pub async fn join(&self, seed_host: &str, seed_port: u16) -> Result<()> {
        let seed = NodeInfo::new(self.ring, seed_host, seed_port);
        let seed = self.rpc.get_node_info(&seed).await?;

        let (peer_bits, peer_successors) = self.rpc.get_length(&seed).await?;
        if peer_bits != self.ring.bits() || peer_successors != self.successors_len {
            return Err(Error::ParameterMismatch {
                peer_bits,
                peer_successors,
                local_bits: self.ring.bits(),
                local_successors: self.successors_len,
            });
        }

        let successor = self
            .find_successor_from(&seed, self.info.identifier)
            .await?;
        if !self.rpc.live_check(&successor).await {
            return Err(Error::Transport(format!(
                "successor {successor} found via {seed} is not live"
            )));
        }
        self.routing.set_first_successor(successor).await;
        Ok(())
    }

    /// Voluntary leave: stop the loops and the acceptor, then tell the
    /// neighbours, best effort. Keys are not pushed anywhere; the
    /// predecessor already holds them in its first backup store and
    /// re-homes them through the orphan path on its next stabilize.
    pub async fn leave(&self) {
        self.shutdown();

        let predecessor = self.routing.predecessor().await;
        let successor = self.routing.first_successor().await;

        if !predecessor.is_empty() && predecessor.identifier != self.info.identifier {
            let _ = self.rpc.notify_successor_leave(&predecessor).await;
        }
        if !successor.is_empty() && successor.identifier != self.info.identifier {
            let _ = self
                .rpc
                .notify_predecessor_leave(&successor, &predecessor)
                .await;
        }
    }

    /*                         lookup                         */

    /// Iterative find_successor driven by this peer.
    pub async fn find_successor(&self, identifier: Id) -> Result<NodeInfo> {
        let start = self.info.clone();
        self.find_successor_from(&start, identifier).await
    }

    pub(crate) async fn find_successor_from(
        &self,
        start: &NodeInfo,
        identifier: Id,
    ) -> Result<NodeInfo> {
        let mut candidate = start.clone();
        for _ in 0..MAX_LOOKUP_STEPS {
            let (found, next) = if candidate.identifier == self.info.identifier {
                self.find_successor_step(identifier).await
            } else {
                self.rpc.find_successor(&candidate, identifier).await?
            };
            if found {
                return Ok(next);
            }
            candidate = next;
        }
        Err(Error::LookupExceeded(MAX_LOOKUP_STEPS))
    }

    /// One hop of the lookup: either the answer, or the closest
    /// preceding node to ask next.
    async fn find_successor_step(&self, identifier: Id) -> (bool, NodeInfo) {
        let successor = self.routing.first_successor().await;
        if !successor.is_empty()
            && self
                .ring
                .contains(identifier, self.info.identifier, successor.identifier, true, false)
        {
            (true, successor)
        } else {
            (false, self.closest_preceding_node(identifier).await)
        }
    }

    async fn closest_preceding_node(&self, identifier: Id) -> NodeInfo {
        let finger = self.nearest_finger(identifier).await;
        if finger.identifier == self.info.identifier {
            return finger;
        }
        // one remote read of the finger's successor list; stale finger
        // entries make this shortcut worthwhile
        let successors = match self.rpc.get_successors(&finger).await {
            Ok(successors) => successors,
            Err(_) => return finger,
        };
        for entry in successors.iter().rev() {
            if entry.is_empty() {
                continue;
            }
            if self
                .ring
                .contains(entry.identifier, self.info.identifier, identifier, true, true)
            {
                return entry.clone();
            }
        }
        finger
    }

    async fn nearest_finger(&self, identifier: Id) -> NodeInfo {
        let fingers = self.routing.fingers().await;
        for finger in fingers.iter().rev() {
            if finger.is_empty() {
                continue;
            }
            if self
                .ring
                .contains(finger.identifier, self.info.identifier, identifier, true, true)
            {
                return finger.clone();
            }
        }
        self.info.clone()
    }

    /*                         periodic tasks                         */

    /// Start the acceptor and the three maintenance loops.
    pub fn start(self: &Arc<Self>, listener: TcpListener) -> Vec<JoinHandle<()>> {
        let mut handles = vec![net::serve(self.clone(), listener)];

        let node = self.clone();
        handles.push(tokio::spawn(async move {
            let mut shutdown = node.shutdown_signal();
            let mut ticker = tokio::time::interval(node.stabilize_period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => node.stabilize().await,
                    _ = shutdown.changed() => { if *shutdown.borrow() { break; } },
                }
            }
        }));

        let node = self.clone();
        handles.push(tokio::spawn(async move {
            let mut shutdown = node.shutdown_signal();
            let mut ticker = tokio::time::interval(node.fix_fingers_period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => node.fix_fingers().await,
                    _ = shutdown.changed() => { if *shutdown.borrow() { break; } },
                }
            }
        }));

        let node = self.clone();
        handles.push(tokio::spawn(async move {
            let mut shutdown = node.shutdown_signal();
            let mut ticker = tokio::time::interval(node.check_predecessor_period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => node.check_predecessor().await,
                    _ = shutdown.changed() => { if *shutdown.borrow() { break; } },
                }
            }
        }));

        handles
    }

    /// One stabilize round: repair the successor link, re-home orphaned
    /// replicas, reconcile the successor list, refresh the backup
    /// stores, and propose ourselves to the successor.
    pub async fn stabilize(&self) {
        match self.run_stabilize().await {
            Ok(()) => {}
            Err(Error::RingCollapsed) => {
                error!("every successor is dead, shutting down");
                self.shutdown();
            }
            Err(e) => debug!("stabilize: {e}"),
        }
    }

    async fn run_stabilize(&self) -> Result<()> {
        let live_index = self
            .find_first_live_successor()
            .await
            .ok_or(Error::RingCollapsed)?;

        // replicas kept for successors that just died; the ring walked
        // past them, so they must move to the surviving successor
        let mut orphans = Vec::new();
        if live_index > 0 {
            orphans = self.backup_entries_up_to(live_index).await;
        }

        self.adopt_successor_predecessor().await;

        if !orphans.is_empty() {
            self.send_orphans(orphans).await;
        }

        self.update_successors().await?;

        if let Err(e) = self.update_backups().await {
            warn!("backup refresh failed: {e}");
        }

        let successor = self.routing.first_successor().await;
        let _ = self.rpc.notify(&successor, &self.info).await;
        Ok(())
    }

    /// Walk the successor list for the first peer that answers a
    /// LiveCheck and promote it to successors[0].
    async fn find_first_live_successor(&self) -> Option<usize> {
        for index in 0..self.successors_len {
            let successor = self.routing.successor(index).await;
            if successor.is_empty() {
                continue;
            }
            if self.rpc.live_check(&successor).await {
                self.routing.set_first_successor(successor).await;
                return Some(index);
            }
        }
        None
    }

    async fn backup_entries_up_to(&self, index: usize) -> Vec<FileEntry> {
        let mut entries = Vec::new();
        for store in &self.backups[..index] {
            match store.entries().await {
                Ok(mut found) => entries.append(&mut found),
                Err(e) => debug!("reading orphaned backup store: {e}"),
            }
        }
        entries
    }

    /// Ask the successor for its predecessor x; if x is live and sits
    /// between us and the successor, x is the better successor.
    async fn adopt_successor_predecessor(&self) {
        let successor = self.routing.first_successor().await;
        let x = match self.rpc.get_predecessor(&successor).await {
            Ok(x) => x,
            Err(_) => return,
        };
        if x.is_empty() || !self.rpc.live_check(&x).await {
            return;
        }
        if self
            .ring
            .contains(x.identifier, self.info.identifier, successor.identifier, true, true)
        {
            self.routing.set_first_successor(x).await;
        }
    }

    async fn send_orphans(&self, orphans: Vec<FileEntry>) {
        let successor = self.routing.first_successor().await;
        let delivered = matches!(self.rpc.store_files(&successor, &orphans).await, Ok(true));
        if !delivered {
            // keep them in our own primary; the next stabilize or an
            // incoming notify moves them again
            if let Err(e) = self.primary.store_entries(&orphans).await {
                warn!("could not keep orphaned replicas locally: {e}");
            }
        }
    }

    /// Copy the successor's list, prepend the successor, truncate to r.
    async fn update_successors(&self) -> Result<()> {
        let successor = self.routing.first_successor().await;
        let list = self.rpc.get_successors(&successor).await?;

        let mut next = Vec::with_capacity(self.successors_len);
        next.push(successor);
        next.extend(list.into_iter().take(self.successors_len - 1));
        self.routing.set_successors(next).await;
        Ok(())
    }

    /// Rewrite the backup stores from the successor: backups[0] is its
    /// primary, backups[i] its backups[i-1]. The stores end this round
    /// either consistent or empty, never in between.
    async fn update_backups(&self) -> Result<()> {
        let successor = self.routing.first_successor().await;

        let files = match self.rpc.get_all_files(&successor).await {
            Ok(files) => files,
            Err(e) => {
                self.clear_backups().await?;
                return Err(e);
            }
        };

        let mut lists = Vec::with_capacity(self.successors_len);
        lists.push(files);
        let mut partial = None;
        match self.rpc.get_all_backup_files(&successor).await {
            Ok(backup_lists) => {
                lists.extend(backup_lists.into_iter().take(self.successors_len - 1))
            }
            // the successor's primary still refreshes below; the
            // deeper replicas stay empty this round
            Err(e) => partial = Some(e),
        }

        self.clear_backups().await?;
        for (store, list) in self.backups.iter().zip(&lists) {
            if let Err(e) = store.store_entries(list).await {
                let _ = self.clear_backups().await;
                return Err(e);
            }
        }

        match partial {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn clear_backups(&self) -> Result<()> {
        for store in &self.backups {
            store.clear().await?;
        }
        Ok(())
    }

    /// Refresh one finger per tick, rotating through the table.
    pub async fn fix_fingers(&self) {
        let fingers = self.finger_index.len();
        let next = (self.next_finger.load(Ordering::Relaxed) + 1) % fingers;
        self.next_finger.store(next, Ordering::Relaxed);

        let target = self.finger_index[next];
        let entry = match self.find_successor(target).await {
            Ok(node) => {
                if self.rpc.live_check(&node).await {
                    node
                } else {
                    NodeInfo::empty()
                }
            }
            Err(_) => NodeInfo::empty(),
        };
        self.routing.set_finger(next, entry).await;
    }

    /// Clear the predecessor if it stopped answering.
    pub async fn check_predecessor(&self) {
        let predecessor = self.routing.predecessor().await;
        if predecessor.is_empty() {
            return;
        }
        if !self.rpc.live_check(&predecessor).await {
            self.routing.set_predecessor(NodeInfo::empty()).await;
        }
    }

    /*                         notify handlers                         */

    /// A peer proposed itself as our predecessor.
    pub async fn handle_notify(&self, candidate: NodeInfo) {
        let old = self.routing.predecessor().await;
        let adopt = old.is_empty()
            || self
                .ring
                .contains(candidate.identifier, old.identifier, self.info.identifier, true, true);
        if !adopt {
            return;
        }
        if !self.rpc.live_check(&candidate).await {
            return;
        }
        self.routing.set_predecessor(candidate).await;
        self.transfer_to_predecessor(old).await;
    }

    /// Keys that moved out of our arc when the predecessor changed are
    /// handed to the new predecessor. On failure they go back into the
    /// primary so a later notify retries.
    async fn transfer_to_predecessor(&self, old: NodeInfo) {
        let predecessor = self.routing.predecessor().await;
        if predecessor.identifier == self.info.identifier {
            return;
        }
        if old.is_empty() || !self.rpc.live_check(&old).await {
            return;
        }

        let ring = self.ring;
        let (low, high) = (old.identifier, predecessor.identifier);
        let extracted = match self
            .primary
            .extract_by_filter(|name| ring.contains(ring.identifier(name), low, high, true, false))
            .await
        {
            Ok(extracted) => extracted,
            Err(e) => {
                debug!("extracting keys for hand-off: {e}");
                return;
            }
        };
        if extracted.is_empty() {
            return;
        }

        let delivered = matches!(
            self.rpc.store_files(&predecessor, &extracted).await,
            Ok(true)
        );
        if !delivered {
            if let Err(e) = self.primary.store_entries(&extracted).await {
                warn!("could not restore keys after failed hand-off: {e}");
            }
        }
    }

    /// Our successor left voluntarily; re-run the repair sequence to
    /// pick the next one and re-replicate.
    pub async fn handle_successor_leave(&self) {
        self.stabilize().await;
    }

    /// Our predecessor left voluntarily and told us who came before it.
    pub async fn handle_predecessor_leave(&self, predecessor: NodeInfo) {
        if predecessor.is_empty() || !self.rpc.live_check(&predecessor).await {
            return;
        }
        self.routing.set_predecessor(predecessor).await;
    }

    /*                         routed file operations                         */

    /// Store a file on whichever peer owns its identifier.
    pub async fn store_file(&self, name: &str, body: Vec<u8>) -> Result<()> {
        let owner = self.find_successor(self.ring.identifier(name)).await?;
        if owner.identifier == self.info.identifier {
            self.primary.put(name, &body).await
        } else {
            let stored = self
                .rpc
                .store_file(
                    &owner,
                    FileEntry {
                        name: name.to_string(),
                        body,
                    },
                )
                .await?;
            if stored {
                Ok(())
            } else {
                Err(Error::Storage(format!("peer {owner} rejected the file")))
            }
        }
    }

    /// Fetch a file from whichever peer owns its identifier.
    pub async fn get_file(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let owner = self.find_successor(self.ring.identifier(name)).await?;
        if owner.identifier == self.info.identifier {
            self.primary.get(name).await
        } else {
            let (found, body) = self.rpc.get_file(&owner, name).await?;
            if found {
                Ok(body)
            } else {
                Err(Error::Storage(format!("peer {owner} could not read the file")))
            }
        }
    }

    /*                         rpc dispatch                         */

    pub(crate) async fn handle_request(self: &Arc<Self>, request: Request) -> Reply {
        match request {
            Request::FindSuccessor { identifier } => {
                let (found, node) = self.find_successor_step(identifier).await;
                Reply::FindSuccessor { found, node }
            }
            Request::GetPredecessor => Reply::Predecessor {
                node: self.routing.predecessor().await,
            },
            Request::GetSuccessors => Reply::Successors {
                nodes: self.routing.successors().await,
            },
            Request::GetNodeInfo => Reply::NodeInfo {
                node: self.info.clone(),
            },
            Request::GetLength => Reply::Length {
                identifier_bits: self.ring.bits(),
                successors: self.successors_len,
            },
            Request::LiveCheck => Reply::Ack,
            // the notify family acknowledges immediately and does the
            // work on a detached task, so a handler that itself issues
            // RPCs cannot deadlock its caller
            Request::Notify { candidate } => {
                let node = self.clone();
                tokio::spawn(async move {
                    node.handle_notify(candidate).await;
                });
                Reply::Ack
            }
            Request::NotifySuccessorLeave => {
                let node = self.clone();
                tokio::spawn(async move {
                    node.handle_successor_leave().await;
                });
                Reply::Ack
            }
            Request::NotifyPredecessorLeave { predecessor } => {
                let node = self.clone();
                tokio::spawn(async move {
                    node.handle_predecessor_leave(predecessor).await;
                });
                Reply::Ack
            }
            Request::StoreFile { file } => Reply::Store {
                success: self.primary.put(&file.name, &file.body).await.is_ok(),
            },
            Request::GetFile { name } => match self.primary.get(&name).await {
                Ok(body) => Reply::File {
                    success: true,
                    body,
                },
                Err(_) => Reply::File {
                    success: false,
                    body: None,
                },
            },
            Request::StoreFiles { files } => Reply::Store {
                success: self.primary.store_entries(&files).await.is_ok(),
            },
            Request::GetAllFiles => match self.primary.entries().await {
                Ok(files) => Reply::Files {
                    success: true,
                    files,
                },
                Err(_) => Reply::Files {
                    success: false,
                    files: Vec::new(),
                },
            },
            Request::GetAllBackupFiles => {
                let mut lists = Vec::with_capacity(self.backups.len());
                let mut success = true;
                for store in &self.backups {
                    match store.entries().await {
                        Ok(entries) => lists.push(entries),
                        Err(_) => {
                            success = false;
                            lists.clear();
                            break;
                        }
                    }
                }
                Reply::BackupFiles { success, lists }
            }
        }
    }

    /*                         state reporter                         */

    pub async fn state(&self) -> Result<NodeState> {
        let mut backup_files = Vec::with_capacity(self.backups.len());
        for store in &self.backups {
            backup_files.push(store.list().await?);
        }
        Ok(NodeState {
            info: self.info.clone(),
            predecessor: self.routing.predecessor().await,
            successors: self.routing.successors().await,
            finger_index: self.finger_index.clone(),
            finger_table: self.routing.fingers().await,
            primary_files: self.primary.list().await?,
            backup_files,
        })
    }
}

/// Snapshot of the routing and storage state, for inspection.
#[derive(Debug, Clone, Serialize)]
pub struct NodeState {
    pub info: NodeInfo,
    pub predecessor: NodeInfo,
    pub successors: Vec<NodeInfo>,
    pub finger_index: Vec<Id>,
    pub finger_table: Vec<NodeInfo>,
    pub primary_files: Vec<String>,
    pub backup_files: Vec<Vec<String>>,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Self: {}", self.info)?;
        writeln!(f, "Predecessor: {}", self.predecessor)?;
        writeln!(f, "Successors:")?;
        for (i, successor) in self.successors.iter().enumerate() {
            writeln!(f, "  {i} {successor}")?;
        }
        writeln!(f, "Finger table:")?;
        for (i, finger) in self.finger_table.iter().enumerate() {
            writeln!(f, "  {i} at {} -> {finger}", self.finger_index[i])?;
        }
        writeln!(f, "Files:")?;
        for name in &self.primary_files {
            writeln!(f, "  {name}")?;
        }
        writeln!(f, "Backup files:")?;
        for (i, names) in self.backup_files.iter().enumerate() {
            writeln!(f, "  {i}: {}", names.join(", "))?;
        }
        Ok(())
    }
}
