/*!
 * Replication protocol payloads
 * Field meanings for heartbeat, election and progress messages; the wire
 * encoding itself belongs to the transport layer
 */

use bson::Document;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::member_state::MemberState;
use crate::optime::OpTime;
use crate::replica_set_config::HostAndPort;

/// Stable per-node identifier keying the progress map.
pub type Rid = Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub set_name: String,
    /// Sender address; empty for heartbeats from very old peers.
    pub sender_host: Option<HostAndPort>,
    pub sender_id: Option<i64>,
    /// The sender's view of the configuration version.
    pub config_version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub set_name: String,
    pub state: MemberState,
    pub config_version: i64,
    /// Receiver's applied position.
    pub op_time: OpTime,
    /// Whether the sender is up in the receiver's view.
    pub sender_up: bool,
    /// Receiver's configuration document, attached when the sender reported
    /// an older version.
    pub config: Option<Document>,
}

/// Freshness probe sent by a would-be candidate before requesting votes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreshRequest {
    pub set_name: String,
    pub who: HostAndPort,
    pub candidate_id: i64,
    pub config_version: i64,
    pub op_time: OpTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreshResponse {
    /// Responder's member id.
    pub id: i64,
    pub set_name: String,
    /// Responder's applied position.
    pub op_time: OpTime,
    /// True when the responder has applied past the candidate's position.
    pub fresher: bool,
    /// Hard veto; the candidate must abort this round.
    pub veto: bool,
    pub errmsg: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectRequest {
    pub set_name: String,
    pub candidate_id: i64,
    pub config_version: i64,
    pub round: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectResponse {
    /// 1 for a yea vote, a large negative value for a veto.
    pub vote: i64,
    pub round: Uuid,
}

pub const ELECT_VETO_VOTE: i64 = -10_000;

/// One entry of a downstream progress report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UpdatePositionEntry {
    pub rid: Rid,
    pub op_time: OpTime,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UpdatePositionArgs {
    pub updates: Vec<UpdatePositionEntry>,
}

/// Downstream node introducing itself; associates its RID with a member id.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HandshakeArgs {
    pub rid: Rid,
    pub member_id: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IsMasterResponse {
    pub is_master: bool,
    pub secondary: bool,
    pub set_name: String,
    pub hosts: Vec<String>,
    pub primary: Option<String>,
    pub me: Option<String>,
    pub shutdown_in_progress: bool,
}

impl IsMasterResponse {
    pub fn mark_shutdown_in_progress(&mut self) {
        self.shutdown_in_progress = true;
        self.is_master = false;
        self.secondary = false;
    }
}
