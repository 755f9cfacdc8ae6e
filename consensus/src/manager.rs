use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use network::{ErrorKind, LockReply, LockRequest, Message, NodeId, Transport};
use storage::ItemId;

use crate::election::{BullyElection, ElectionState};
use crate::locks::LockTable;
use crate::{Config, ConsensusError, Result};

/// Leadership and mutual exclusion for one node: runs the bully election,
/// watches the leader's liveness, and hosts the lock table while this node
/// leads.
#[derive(Clone)]
pub struct ConsensusManager {
    node_id: NodeId,
    election: BullyElection,
    locks: Arc<Mutex<LockTable>>,
    transport: Transport,
    config: Config,
    started: Arc<watch::Sender<bool>>,
}

impl ConsensusManager {
    pub fn new(config: Config, transport: Transport) -> Self {
        let election = BullyElection::new(
            transport.clone(),
            config.initial_leader,
            config.election_confirm_timeout(),
        );

        Self {
            node_id: config.node_id,
            election,
            locks: Arc::new(Mutex::new(LockTable::new())),
            transport,
            config,
            started: Arc::new(watch::channel(false).0),
        }
    }

    /// Settles who leads at startup, then probes the believed leader every
    /// liveness interval until `shutdown` fires.
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!("Starting consensus manager for node {}", self.node_id);

        self.startup_check().await;
        self.started.send_replace(true);

        let mut interval = tokio::time::interval(self.config.liveness_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => self.election.check_leader().await,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Consensus manager for node {} stopped", self.node_id);
        Ok(())
    }

    /// Resolves once the startup check has settled who leads.
    pub async fn started(&self) {
        let mut started = self.started.subscribe();
        let _ = started.wait_for(|done| *done).await;
    }

    /// Finds out who the running cluster follows before trusting the
    /// configured leader. A node that restarts after leadership moved must
    /// not fall back to the bootstrap choice.
    async fn startup_check(&self) {
        let initial = self.config.initial_leader;

        let reported = if initial == self.node_id {
            let seen = self.leader_seen_by_peers().await;
            if seen.is_none() {
                tracing::info!("Node {} starts as the configured leader", self.node_id);
                return;
            }
            seen
        } else {
            match self.leader_seen_by(initial).await {
                None => {
                    tracing::warn!(
                        "Configured leader {} is not answering, node {} starts an election",
                        initial,
                        self.node_id
                    );
                    self.election.start_election().await;
                    return;
                }
                Some(Some(leader)) if leader == initial => {
                    tracing::info!("Node {} found leader {} alive", self.node_id, leader);
                    return;
                }
                Some(seen) => seen,
            }
        };

        match reported {
            Some(leader) if leader > self.node_id => {
                tracing::info!("Node {} joins a cluster already led by node {}", self.node_id, leader);
                self.election.handle_leader_confirmed(leader).await;
            }
            Some(leader) => {
                tracing::info!(
                    "Node {} out-ranks current leader {}, starting an election",
                    self.node_id,
                    leader
                );
                self.election.start_election().await;
            }
            None => {
                tracing::info!("Node {} found no leader in the cluster, starting an election", self.node_id);
                self.election.start_election().await;
            }
        }
    }

    /// The leader `peer` follows, or `None` when it does not answer.
    async fn leader_seen_by(&self, peer: NodeId) -> Option<Option<NodeId>> {
        match self.transport.send(peer, Message::Ping).await {
            Some(Message::Pong(pong)) => Some(pong.leader),
            _ => None,
        }
    }

    /// The highest leader any answering peer follows, other than this node.
    async fn leader_seen_by_peers(&self) -> Option<NodeId> {
        self.transport
            .broadcast(Message::Ping)
            .await
            .into_iter()
            .filter_map(|(_, reply)| match reply {
                Some(Message::Pong(pong)) => pong.leader,
                _ => None,
            })
            .filter(|leader| *leader != self.node_id)
            .max()
    }

    pub fn election(&self) -> &BullyElection {
        &self.election
    }

    pub async fn state(&self) -> ElectionState {
        self.election.state().await
    }

    pub async fn is_leader(&self) -> bool {
        self.election.is_leader().await
    }

    pub async fn current_leader(&self) -> Option<NodeId> {
        self.election.current_leader().await
    }

    /// The leader this node would forward a leader-only request to, or
    /// `None` when this node leads.
    pub async fn remote_leader(&self) -> Result<Option<NodeId>> {
        let state = self.election.state().await;
        if state.role == network::Role::Leader {
            return Ok(None);
        }
        match state.current_leader {
            Some(leader) if leader != self.node_id => Ok(Some(leader)),
            _ => Err(ConsensusError::NoLeader),
        }
    }

    pub fn handle_election(&self, initiator: NodeId) -> Message {
        self.election.handle_election(initiator)
    }

    pub async fn handle_leader_confirmed(&self, leader_id: NodeId) -> Message {
        self.election.handle_leader_confirmed(leader_id).await
    }

    /// Serves a remote `lock-acquire`. Only the leader hosts locks.
    pub async fn handle_lock_acquire(&self, requester: NodeId, request: LockRequest) -> Message {
        if !self.is_leader().await {
            return self.not_leader_reply().await;
        }
        let mut locks = self.locks.lock().await;
        let granted = locks.acquire(request.resource, requester);
        Self::log_lock("acquire", request.resource, requester, granted);
        Message::LockReply(LockReply {
            resource: request.resource,
            granted,
            holder: locks.holder(request.resource),
        })
    }

    pub async fn handle_lock_release(&self, requester: NodeId, request: LockRequest) -> Message {
        if !self.is_leader().await {
            return self.not_leader_reply().await;
        }
        let mut locks = self.locks.lock().await;
        let granted = locks.release(request.resource, requester);
        Self::log_lock("release", request.resource, requester, granted);
        Message::LockReply(LockReply {
            resource: request.resource,
            granted,
            holder: locks.holder(request.resource),
        })
    }

    /// Asks the leader for `resource` on behalf of this node. Served locally
    /// when this node leads.
    pub async fn acquire(&self, resource: ItemId) -> Result<bool> {
        match self.remote_leader().await? {
            None => {
                let granted = self.locks.lock().await.acquire(resource, self.node_id);
                Self::log_lock("acquire", resource, self.node_id, granted);
                Ok(granted)
            }
            Some(leader) => {
                self.remote_lock(leader, Message::LockAcquire(LockRequest { resource }))
                    .await
            }
        }
    }

    pub async fn release(&self, resource: ItemId) -> Result<bool> {
        match self.remote_leader().await? {
            None => {
                let released = self.locks.lock().await.release(resource, self.node_id);
                Self::log_lock("release", resource, self.node_id, released);
                Ok(released)
            }
            Some(leader) => {
                self.remote_lock(leader, Message::LockRelease(LockRequest { resource }))
                    .await
            }
        }
    }

    async fn remote_lock(&self, leader: NodeId, request: Message) -> Result<bool> {
        match self.transport.send(leader, request).await {
            Some(Message::LockReply(reply)) => Ok(reply.granted),
            Some(Message::Error(e)) => Err(ConsensusError::Rejected(e.message)),
            Some(other) => Err(ConsensusError::UnexpectedReply(other.tag().to_string())),
            None => Err(ConsensusError::LeaderUnreachable(leader)),
        }
    }

    async fn not_leader_reply(&self) -> Message {
        let leader = self.current_leader().await;
        Message::error(
            ErrorKind::Business,
            match leader {
                Some(leader) => format!("node {} is not the leader (leader is node {})", self.node_id, leader),
                None => format!("node {} is not the leader", self.node_id),
            },
        )
    }

    fn log_lock(action: &str, resource: ItemId, requester: NodeId, granted: bool) {
        if granted {
            tracing::debug!("Lock {} on item {} by node {} granted", action, resource, requester);
        } else {
            tracing::info!("Lock {} on item {} by node {} denied", action, resource, requester);
        }
    }
}
