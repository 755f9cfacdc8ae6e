//! Bully leader election.
//!
//! The highest reachable id wins. An election is triggered when the believed
//! leader stops answering pings or is unknown at startup. There is no term
//! or epoch: a `leader-confirmed` from a stale election (for example one
//! resolved on the far side of a healed partition) is adopted as readily as
//! a fresh one and can displace a newer leader. No fencing is applied.

use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use network::{ElectionAck, ElectionRequest, LeaderConfirmed, Message, NodeId, Role, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionState {
    pub role: Role,
    pub current_leader: Option<NodeId>,
    pub election_in_progress: bool,
}

#[derive(Clone)]
pub struct BullyElection {
    node_id: NodeId,
    transport: Transport,
    state: Arc<RwLock<ElectionState>>,
    /// Bumped on every election this node starts; lets a stale confirmation
    /// watchdog recognise it has been overtaken.
    round: Arc<AtomicU64>,
    confirm_timeout: Duration,
}

impl BullyElection {
    pub fn new(transport: Transport, initial_leader: NodeId, confirm_timeout: Duration) -> Self {
        let node_id = transport.local_id();
        let role = if initial_leader == node_id {
            Role::Leader
        } else {
            Role::Follower
        };

        Self {
            node_id,
            transport,
            state: Arc::new(RwLock::new(ElectionState {
                role,
                current_leader: Some(initial_leader),
                election_in_progress: false,
            })),
            round: Arc::new(AtomicU64::new(0)),
            confirm_timeout,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub async fn state(&self) -> ElectionState {
        self.state.read().await.clone()
    }

    pub async fn current_leader(&self) -> Option<NodeId> {
        self.state.read().await.current_leader
    }

    pub async fn is_leader(&self) -> bool {
        self.state.read().await.role == Role::Leader
    }

    /// Runs one bully round from this node and returns the role it ends in.
    ///
    /// Ends as `Leader` when no higher node exists or none answers, and as
    /// `Candidate` when a higher node took over; the candidate then waits for
    /// that node's `leader-confirmed`.
    pub async fn start_election(&self) -> Role {
        {
            let mut state = self.state.write().await;
            if state.election_in_progress {
                tracing::debug!("Node {} already has an election in progress", self.node_id);
                return state.role;
            }
            state.election_in_progress = true;
            state.role = Role::Candidate;
        }
        let round = self.round.fetch_add(1, Ordering::SeqCst) + 1;

        let higher = self.transport.directory().higher_than(self.node_id);
        if higher.is_empty() {
            tracing::info!("Node {} has the highest id, taking leadership", self.node_id);
            self.become_leader().await;
            return Role::Leader;
        }

        tracing::info!("Node {} starting election against {:?}", self.node_id, higher);
        let request = Message::Election(ElectionRequest {
            initiator: self.node_id,
        });
        let replies = join_all(
            higher
                .iter()
                .map(|peer| self.transport.send(*peer, request.clone())),
        )
        .await;

        let answered = replies
            .iter()
            .filter(|reply| matches!(reply, Some(Message::ElectionAck(_))))
            .count();

        if answered == 0 {
            tracing::info!("No higher node answered node {}, taking leadership", self.node_id);
            self.become_leader().await;
            Role::Leader
        } else {
            tracing::info!(
                "{} higher node(s) answered node {}, waiting for leader confirmation",
                answered,
                self.node_id
            );
            self.watch_for_confirmation(round);
            Role::Candidate
        }
    }

    /// Clears a deferred candidacy if no confirmation arrives in time so the
    /// liveness monitor can start over.
    fn watch_for_confirmation(&self, round: u64) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.confirm_timeout).await;
            if this.round.load(Ordering::SeqCst) != round {
                return;
            }
            let mut state = this.state.write().await;
            if state.election_in_progress && state.role == Role::Candidate {
                tracing::warn!(
                    "Node {} got no leader confirmation within {:?}",
                    this.node_id,
                    this.confirm_timeout
                );
                state.election_in_progress = false;
                state.role = Role::Follower;
            }
        });
    }

    async fn become_leader(&self) {
        {
            let mut state = self.state.write().await;
            state.role = Role::Leader;
            state.current_leader = Some(self.node_id);
            state.election_in_progress = false;
        }
        tracing::info!("Node {} is now the leader", self.node_id);

        let replies = self
            .transport
            .broadcast(Message::LeaderConfirmed(LeaderConfirmed {
                leader_id: self.node_id,
            }))
            .await;
        for (peer, reply) in replies {
            if reply.is_none() {
                tracing::warn!("Leader announcement to node {} was not delivered", peer);
            }
        }
    }

    /// Answers an `election` from `initiator`. Out-ranking the initiator means
    /// taking the election over; that runs in the background so the
    /// initiator gets its answer without waiting on our own round.
    pub fn handle_election(&self, initiator: NodeId) -> Message {
        let taking_over = initiator < self.node_id;
        if taking_over {
            tracing::info!("Node {} out-ranks election initiator {}", self.node_id, initiator);
            let this = self.clone();
            tokio::spawn(async move {
                this.start_election().await;
            });
        }
        Message::ElectionAck(ElectionAck { taking_over })
    }

    /// Adopts `leader_id` unconditionally.
    pub async fn handle_leader_confirmed(&self, leader_id: NodeId) -> Message {
        let mut state = self.state.write().await;
        if state.role == Role::Leader && leader_id != self.node_id {
            tracing::warn!("Node {} stepping down in favour of node {}", self.node_id, leader_id);
        }
        state.current_leader = Some(leader_id);
        state.role = if leader_id == self.node_id {
            Role::Leader
        } else {
            Role::Follower
        };
        state.election_in_progress = false;
        tracing::info!("Node {} adopted node {} as leader", self.node_id, leader_id);
        Message::Ack
    }

    /// One liveness probe: pings the believed leader and starts an election
    /// when it does not answer.
    pub async fn check_leader(&self) {
        let state = self.state().await;
        if state.election_in_progress {
            return;
        }
        match state.current_leader {
            Some(leader) if leader == self.node_id => {}
            Some(leader) => {
                if !self.transport.ping(leader).await {
                    tracing::warn!("Leader {} is not answering node {}", leader, self.node_id);
                    self.start_election().await;
                }
            }
            None => {
                self.start_election().await;
            }
        }
    }
}
