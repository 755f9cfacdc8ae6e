//! Shared harness for the StockMesh cluster tests: in-process nodes on
//! loopback ports, an operator client, and small polling helpers.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use stockmesh::network::{Directory, NodeId, PeerAddress, RpcServer, Transport};
use stockmesh::storage::{InventoryStore, MemoryStore, NewItem, StorageError};
use stockmesh::{Config, Node};

pub struct TestCluster {
    pub nodes: BTreeMap<NodeId, Arc<Node<MemoryStore>>>,
    pub directory: Arc<Directory>,
    members: BTreeMap<NodeId, PeerAddress>,
}

impl TestCluster {
    /// Starts a node for every id in `alive`. Ids in `dead` are members with
    /// an address nobody listens on.
    pub async fn start(alive: &[u32], dead: &[u32]) -> Self {
        Self::start_with(alive, dead, |_| {}).await
    }

    pub async fn start_with(alive: &[u32], dead: &[u32], tweak: impl Fn(&mut Config)) -> Self {
        let mut servers = BTreeMap::new();
        let mut members = BTreeMap::new();

        for id in alive {
            let id = NodeId(*id);
            let server = RpcServer::bind(id, "127.0.0.1:0").await.unwrap();
            let port = server.local_addr().unwrap().port();
            members.insert(id, PeerAddress::new("127.0.0.1", port));
            servers.insert(id, server);
        }
        for id in dead {
            members.insert(NodeId(*id), PeerAddress::new("127.0.0.1", closed_port()));
        }

        let mut nodes = BTreeMap::new();
        for (id, server) in servers {
            let node = spawn_node(id, server, &members, &tweak);
            nodes.insert(id, node);
        }
        for node in nodes.values() {
            wait_started(node).await;
        }

        Self {
            nodes,
            directory: Arc::new(Directory::new(members.clone())),
            members,
        }
    }

    /// Brings up a member that was started as dead, on its registered
    /// address, and waits for its startup check.
    pub async fn rejoin(&mut self, id: u32) -> Arc<Node<MemoryStore>> {
        let id = NodeId(id);
        let address = self.directory.address(id).unwrap().clone();
        let server = RpcServer::bind(id, (address.host.as_str(), address.port))
            .await
            .unwrap();
        let node = spawn_node(id, server, &self.members, &|_: &mut Config| {});
        wait_started(&node).await;
        self.nodes.insert(id, node.clone());
        node
    }

    pub fn node(&self, id: u32) -> &Arc<Node<MemoryStore>> {
        &self.nodes[&NodeId(id)]
    }

    /// A client speaking as the operator (node id 0).
    pub fn operator(&self) -> Transport {
        Transport::new(NodeId::OPERATOR, self.directory.clone(), Duration::from_secs(5))
    }

    pub async fn leader_seen_by(&self, id: u32) -> Option<NodeId> {
        self.node(id).consensus().current_leader().await
    }
}

fn spawn_node(
    id: NodeId,
    server: RpcServer,
    members: &BTreeMap<NodeId, PeerAddress>,
    tweak: &impl Fn(&mut Config),
) -> Arc<Node<MemoryStore>> {
    let mut config = Config::new(id, members.clone());
    // Liveness probes stay out of the way unless a test asks for them.
    config.liveness_interval_ms = 60_000;
    config.rpc_timeout_ms = 2_000;
    tweak(&mut config);

    let store = MemoryStore::with_default_capacity(config.default_branch_capacity);
    let node = Node::new(config, store).unwrap();
    tokio::spawn(node.clone().run(server));
    node
}

async fn wait_started(node: &Arc<Node<MemoryStore>>) {
    tokio::time::timeout(Duration::from_secs(10), node.consensus().started())
        .await
        .unwrap_or_else(|_| panic!("node {} never finished its startup check", node.id()));
}

/// A port that refuses connections.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Polls `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check().await
}

pub fn article(name: &str, quantity: u64) -> NewItem {
    NewItem {
        name: name.to_string(),
        description: format!("{} for tests", name),
        quantity,
    }
}

/// Inserts an item with `stock` units at each listed branch directly into
/// `store`, bypassing the cluster. Returns the item id.
pub async fn seed<S: InventoryStore>(store: &S, name: &str, stock: &[(u32, u64)]) -> i64 {
    let total: u64 = stock.iter().map(|(_, qty)| qty).sum();
    let item = article(name, total);
    let stock: Vec<(NodeId, u64)> = stock.iter().map(|(id, qty)| (NodeId(*id), *qty)).collect();
    store
        .atomically(move |tx| {
            let record = tx.insert_item(&item)?;
            for (branch, qty) in &stock {
                tx.insert_branch_stock(record.id, *branch, *qty)?;
            }
            Ok::<_, StorageError>(record.id)
        })
        .await
        .unwrap()
}
