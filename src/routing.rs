use crate::ring::NodeInfo;
use tokio::sync::RwLock;

struct State {
    predecessor: NodeInfo,
    successors: Vec<NodeInfo>,
    fingers: Vec<NodeInfo>,
}

/// Predecessor, successor list and finger table behind one reader/writer
/// lock. Every operation is a short in-memory swap; nothing here touches
/// the network, so callers are free to drop the guard before any RPC.
pub struct RoutingTable {
    successors_len: usize,
    state: RwLock<State>,
}

impl RoutingTable {
    pub fn new(successors_len: usize, fingers_len: usize) -> Self {
        Self {
            successors_len,
            state: RwLock::new(State {
                predecessor: NodeInfo::empty(),
                successors: vec![NodeInfo::empty(); successors_len],
                fingers: vec![NodeInfo::empty(); fingers_len],
            }),
        }
    }

    pub async fn predecessor(&self) -> NodeInfo {
        self.state.read().await.predecessor.clone()
    }

    pub async fn set_predecessor(&self, node: NodeInfo) {
        self.state.write().await.predecessor = node;
    }

    pub async fn successor(&self, index: usize) -> NodeInfo {
        let state = self.state.read().await;
        state
            .successors
            .get(index)
            .cloned()
            .unwrap_or_else(NodeInfo::empty)
    }

    pub async fn first_successor(&self) -> NodeInfo {
        self.successor(0).await
    }

    pub async fn set_first_successor(&self, node: NodeInfo) {
        self.state.write().await.successors[0] = node;
    }

    pub async fn successors(&self) -> Vec<NodeInfo> {
        self.state.read().await.successors.clone()
    }

    /// Replace the whole list; always kept at exactly r entries.
    pub async fn set_successors(&self, mut list: Vec<NodeInfo>) {
        list.resize_with(self.successors_len, NodeInfo::empty);
        self.state.write().await.successors = list;
    }

    pub async fn finger(&self, index: usize) -> NodeInfo {
        let state = self.state.read().await;
        state
            .fingers
            .get(index)
            .cloned()
            .unwrap_or_else(NodeInfo::empty)
    }

    pub async fn set_finger(&self, index: usize, node: NodeInfo) {
        let mut state = self.state.write().await;
        if index < state.fingers.len() {
            state.fingers[index] = node;
        }
    }

    pub async fn fingers(&self) -> Vec<NodeInfo> {
        self.state.read().await.fingers.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::Ring;

    fn info(port: u16) -> NodeInfo {
        NodeInfo::new(Ring::new(32), "127.0.0.1", port)
    }

    #[tokio::test]
    async fn starts_empty() {
        let table = RoutingTable::new(3, 8);
        assert!(table.predecessor().await.is_empty());
        assert!(table.first_successor().await.is_empty());
        assert_eq!(table.successors().await.len(), 3);
        assert_eq!(table.fingers().await.len(), 8);
    }

    #[tokio::test]
    async fn set_and_get_entries() {
        let table = RoutingTable::new(3, 8);
        table.set_predecessor(info(4000)).await;
        assert_eq!(table.predecessor().await, info(4000));

        table.set_first_successor(info(4001)).await;
        assert_eq!(table.first_successor().await, info(4001));
        assert_eq!(table.successor(0).await, info(4001));
        assert!(table.successor(1).await.is_empty());

        table.set_finger(7, info(4002)).await;
        assert_eq!(table.finger(7).await, info(4002));
        // out of range reads come back empty, writes are dropped
        assert!(table.finger(8).await.is_empty());
        table.set_finger(8, info(4003)).await;
    }

    #[tokio::test]
    async fn bulk_successor_replacement_keeps_length() {
        let table = RoutingTable::new(3, 8);
        table.set_successors(vec![info(4000)]).await;
        assert_eq!(table.successors().await.len(), 3);
        assert_eq!(table.successor(0).await, info(4000));
        assert!(table.successor(2).await.is_empty());

        table
            .set_successors(vec![info(1), info(2), info(3), info(4)])
            .await;
        let successors = table.successors().await;
        assert_eq!(successors.len(), 3);
        assert_eq!(successors[2], info(3));
    }
}
