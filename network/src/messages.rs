//! Envelope schema for node-to-node RPC.
//!
//! `Message` is a closed, internally tagged union (`"type"` field). A tag this
//! build does not know decodes into [`Message::Unknown`] instead of failing, so
//! receivers can answer it explicitly. Maps keyed by node id are carried as
//! lists of [`Allocation`] because tagged enums cannot round-trip integer map
//! keys through JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use storage::{Client, InventoryItem, ItemId, NewClient, NewItem, NodeId, SaleRecord, StockLine};

use crate::PROTOCOL_VERSION;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u16,
    pub origin: NodeId,
    pub message: Message,
}

impl Envelope {
    pub fn new(origin: NodeId, message: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            origin,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    // Liveness
    Ping,
    Pong(Pong),

    // Leader election
    Election(ElectionRequest),
    ElectionAck(ElectionAck),
    LeaderConfirmed(LeaderConfirmed),

    // Lock manager (served by the leader)
    LockAcquire(LockRequest),
    LockRelease(LockRequest),
    LockReply(LockReply),

    // Queries
    QueryInventory,
    Inventory(InventoryReport),
    QueryClients,
    Clients(ClientList),
    RegisterClient(NewClient),
    ClientRegistered(Client),
    Status,
    StatusReport(StatusReport),

    // Writes
    Sell(SaleRequest),
    SaleCompleted(SaleReceipt),
    AddArticle(NewItem),
    ArticleAdded(ArticleAnnouncement),
    Redistribute(RedistributeRequest),
    Redistributed(Rebalance),

    // Replication (fire-and-forget)
    InventoryUpdate(InventoryUpdate),
    NewArticle(ArticleAnnouncement),
    StockRebalanced(Rebalance),

    Ack,
    Error(ErrorReply),

    #[serde(other)]
    Unknown,
}

impl Message {
    /// Wire tag, for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Ping => "ping",
            Message::Pong(_) => "pong",
            Message::Election(_) => "election",
            Message::ElectionAck(_) => "election-ack",
            Message::LeaderConfirmed(_) => "leader-confirmed",
            Message::LockAcquire(_) => "lock-acquire",
            Message::LockRelease(_) => "lock-release",
            Message::LockReply(_) => "lock-reply",
            Message::QueryInventory => "query-inventory",
            Message::Inventory(_) => "inventory",
            Message::QueryClients => "query-clients",
            Message::Clients(_) => "clients",
            Message::RegisterClient(_) => "register-client",
            Message::ClientRegistered(_) => "client-registered",
            Message::Status => "status",
            Message::StatusReport(_) => "status-report",
            Message::Sell(_) => "sell",
            Message::SaleCompleted(_) => "sale-completed",
            Message::AddArticle(_) => "add-article",
            Message::ArticleAdded(_) => "article-added",
            Message::Redistribute(_) => "redistribute",
            Message::Redistributed(_) => "redistributed",
            Message::InventoryUpdate(_) => "inventory-update",
            Message::NewArticle(_) => "new-article",
            Message::StockRebalanced(_) => "stock-rebalanced",
            Message::Ack => "ack",
            Message::Error(_) => "error",
            Message::Unknown => "unknown",
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Message::Error(ErrorReply {
            kind,
            message: message.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub timestamp: DateTime<Utc>,
    /// Who the responder currently follows.
    #[serde(default)]
    pub leader: Option<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectionRequest {
    pub initiator: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectionAck {
    pub taking_over: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderConfirmed {
    pub leader_id: NodeId,
}

/// The requester is the envelope origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRequest {
    pub resource: ItemId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockReply {
    pub resource: ItemId,
    pub granted: bool,
    pub holder: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryReport {
    pub branch: NodeId,
    pub lines: Vec<StockLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientList {
    pub clients: Vec<Client>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberStatus {
    pub id: NodeId,
    pub address: String,
    pub reachable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub node_id: NodeId,
    pub role: Role,
    pub leader: Option<NodeId>,
    pub election_in_progress: bool,
    pub members: Vec<MemberStatus>,
}

/// A sale served by whichever branch receives it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleRequest {
    pub item_id: ItemId,
    pub client_id: i64,
    pub qty: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleReceipt {
    pub sale: SaleRecord,
    pub remaining_qty: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub branch_id: NodeId,
    pub qty: u64,
}

pub fn allocations(plan: &BTreeMap<NodeId, u64>) -> Vec<Allocation> {
    plan.iter()
        .map(|(branch_id, qty)| Allocation {
            branch_id: *branch_id,
            qty: *qty,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleAnnouncement {
    pub item: InventoryItem,
    pub distribution: Vec<Allocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedistributeRequest {
    pub item_id: ItemId,
    pub from_branch: NodeId,
}

/// Per-branch quantities of one item after a rebalance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rebalance {
    pub item_id: ItemId,
    pub distribution: Vec<Allocation>,
}

/// Replicated effect of one committed sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryUpdate {
    pub item_id: ItemId,
    pub branch_id: NodeId,
    pub new_qty: u64,
    pub qty: u64,
    pub client_id: i64,
    pub shipment_code: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Unrecognized tag, malformed payload, unsupported version.
    Protocol,
    /// Insufficient stock, lock denied, leader-only operation.
    Business,
    Storage,
    /// The node could not reach a peer it needed.
    Network,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} error: {}", self.kind, self.message)
    }
}
