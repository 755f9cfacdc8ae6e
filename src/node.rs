use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use consensus::ConsensusManager;
use coordinator::{IngestionCoordinator, Redistributor, Replica, SaleCoordinator};
use network::{
    ClientList, EnvelopeHandler, ErrorKind, InventoryReport, MemberStatus, Message, NodeId, Pong,
    RpcServer, StatusReport, Transport,
};
use storage::InventoryStore;

use crate::config::Config;
use crate::error::{Result, StockMeshError};

/// Everything one branch node owns. Handlers reach all state through this
/// context; nothing is global.
pub struct Node<S: InventoryStore> {
    config: Config,
    store: Arc<S>,
    transport: Transport,
    consensus: ConsensusManager,
    sales: SaleCoordinator<S>,
    ingestion: IngestionCoordinator<S>,
    redistributor: Redistributor<S>,
    replica: Replica<S>,
    shutdown: watch::Sender<bool>,
}

impl<S: InventoryStore> Node<S> {
    pub fn new(config: Config, store: S) -> Result<Arc<Self>> {
        config.validate()?;
        info!("Initializing StockMesh node {} ({} members)", config.node_id, config.members.len());

        let network_config: network::Config = config.clone().into();
        let directory = Arc::new(config.directory()?);
        let transport = Transport::new(network_config.node_id, directory, network_config.rpc_timeout());
        let consensus = ConsensusManager::new(config.clone().into(), transport.clone());

        let store = Arc::new(store);
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            sales: SaleCoordinator::new(store.clone(), transport.clone()),
            ingestion: IngestionCoordinator::new(store.clone(), transport.clone(), consensus.clone()),
            redistributor: Redistributor::new(store.clone(), transport.clone(), consensus.clone()),
            replica: Replica::new(store.clone()),
            config,
            store,
            transport,
            consensus,
            shutdown,
        }))
    }

    pub fn id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn consensus(&self) -> &ConsensusManager {
        &self.consensus
    }

    /// Binds this node's configured address.
    pub async fn bind(&self) -> Result<RpcServer> {
        let address = self.config.listen_address()?;
        let server = RpcServer::bind(self.id(), (address.host.as_str(), address.port)).await?;
        Ok(server.with_read_timeout(self.transport_timeout()))
    }

    fn transport_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.config.rpc_timeout_ms)
    }

    pub async fn start(self: Arc<Self>) -> Result<()> {
        let server = self.bind().await?;
        self.run(server).await
    }

    /// Serves requests on `server` and runs the liveness monitor until
    /// [`shutdown`](Self::shutdown) is called or either task stops.
    pub async fn run(self: Arc<Self>, server: RpcServer) -> Result<()> {
        info!("Starting StockMesh node {} services", self.id());

        let server_task = {
            let node = self.clone();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move { server.serve(node, shutdown).await })
        };

        let consensus_task = {
            let consensus = self.consensus.clone();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move { consensus.start(shutdown).await })
        };

        let result = tokio::select! {
            result = server_task => match result {
                Ok(served) => served.map_err(StockMeshError::from),
                Err(e) => {
                    error!("RPC server stopped: {:?}", e);
                    Err(StockMeshError::Task(format!("RPC server: {}", e)))
                }
            },
            result = consensus_task => match result {
                Ok(monitored) => monitored.map_err(StockMeshError::from),
                Err(e) => {
                    error!("Consensus manager stopped: {:?}", e);
                    Err(StockMeshError::Task(format!("consensus manager: {}", e)))
                }
            },
        };

        self.shutdown();
        info!("StockMesh node {} stopped", self.id());
        result
    }

    /// Stops accepting connections. Requests already being handled finish.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    async fn inventory(&self) -> Message {
        match self.store.branch_inventory(self.id()).await {
            Ok(lines) => Message::Inventory(InventoryReport {
                branch: self.id(),
                lines,
            }),
            Err(e) => Message::error(ErrorKind::Storage, e.to_string()),
        }
    }

    async fn status(&self) -> Message {
        let state = self.consensus.state().await;
        let probes = self.transport.directory().members().map(|(id, addr)| {
            let address = addr.to_string();
            async move {
                let reachable = id == self.id() || self.transport.ping(id).await;
                MemberStatus { id, address, reachable }
            }
        });
        let members = join_all(probes).await;

        Message::StatusReport(StatusReport {
            node_id: self.id(),
            role: state.role,
            leader: state.current_leader,
            election_in_progress: state.election_in_progress,
            members,
        })
    }
}

#[async_trait]
impl<S: InventoryStore> EnvelopeHandler for Node<S> {
    async fn handle(&self, origin: NodeId, message: Message) -> Message {
        match message {
            Message::Ping => Message::Pong(Pong {
                timestamp: Utc::now(),
                leader: self.consensus.current_leader().await,
            }),

            Message::Election(request) => self.consensus.handle_election(request.initiator),
            Message::LeaderConfirmed(confirmed) => {
                self.consensus.handle_leader_confirmed(confirmed.leader_id).await
            }

            Message::LockAcquire(request) => self.consensus.handle_lock_acquire(origin, request).await,
            Message::LockRelease(request) => self.consensus.handle_lock_release(origin, request).await,

            Message::QueryInventory => self.inventory().await,
            Message::QueryClients => match self.store.clients().await {
                Ok(clients) => Message::Clients(ClientList { clients }),
                Err(e) => Message::error(ErrorKind::Storage, e.to_string()),
            },
            Message::RegisterClient(client) => match self.store.register_client(client).await {
                Ok(client) => {
                    info!("Node {} registered client {} ({})", self.id(), client.id, client.name);
                    Message::ClientRegistered(client)
                }
                Err(e) => Message::error(ErrorKind::Storage, e.to_string()),
            },
            Message::Status => self.status().await,

            Message::Sell(request) => match self.sales.sell(request).await {
                Ok(receipt) => Message::SaleCompleted(receipt),
                Err(e) => e.to_reply(),
            },
            Message::AddArticle(item) => self.ingestion.add_article(origin, item).await,
            Message::Redistribute(request) => self.redistributor.redistribute(origin, request).await,

            Message::InventoryUpdate(update) => {
                let code = update.shipment_code.clone();
                match self.replica.apply_inventory_update(update).await {
                    Ok(true) => Message::Ack,
                    Ok(false) => {
                        info!("Node {} already has shipment {}", self.id(), code);
                        Message::Ack
                    }
                    Err(e) => {
                        warn!("Node {} could not apply sale from node {}: {}", self.id(), origin, e);
                        e.to_reply()
                    }
                }
            }
            Message::NewArticle(announcement) => match self.replica.apply_new_article(announcement).await {
                Ok(()) => Message::Ack,
                Err(e) => e.to_reply(),
            },
            Message::StockRebalanced(rebalance) => match self.replica.apply_stock_rebalanced(rebalance).await {
                Ok(()) => Message::Ack,
                Err(e) => e.to_reply(),
            },

            Message::Unknown => {
                warn!("Node {} received an unknown message type from node {}", self.id(), origin);
                Message::error(ErrorKind::Protocol, "unknown message type")
            }

            reply @ (Message::Pong(_)
            | Message::ElectionAck(_)
            | Message::LockReply(_)
            | Message::Inventory(_)
            | Message::Clients(_)
            | Message::ClientRegistered(_)
            | Message::StatusReport(_)
            | Message::SaleCompleted(_)
            | Message::ArticleAdded(_)
            | Message::Redistributed(_)
            | Message::Ack
            | Message::Error(_)) => Message::error(
                ErrorKind::Protocol,
                format!("'{}' is a reply and cannot be sent as a request", reply.tag()),
            ),
        }
    }
}
