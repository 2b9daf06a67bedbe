/*!
 * Topology coordinator: the pure replica set state machine
 * Owns role transitions, per-member liveness, election responses and sync
 * source policy. Performs no I/O; every method is a pure transition over the
 * current state, the clock and the node's applied position. All mutation
 * happens on the topology driver thread.
 */

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bson::Document;
use uuid::Uuid;

use crate::error::{Result, RookDBError};
use crate::member_state::MemberState;
use crate::optime::OpTime;
use crate::protocol::{
    ElectRequest, ElectResponse, FreshRequest, FreshResponse, HeartbeatRequest,
    HeartbeatResponse, IsMasterResponse, ELECT_VETO_VOTE,
};
use crate::replica_set_config::{HostAndPort, ReplicaSetConfig};

/// Internal election role, distinct from the externally visible member state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// What the coordinator should do after a heartbeat response has been folded
/// into the topology, beyond rescheduling the next beat.
#[derive(Debug)]
pub enum HeartbeatAction {
    None,
    /// No primary seen within the election timeout and this node is eligible.
    StartElection,
    /// A remote primary outranks us; relinquish leadership.
    StepDownSelf,
    /// The remote carries a newer configuration document.
    Reconfig(Document),
}

#[derive(Debug)]
pub struct HeartbeatDisposition {
    pub action: HeartbeatAction,
    pub next_heartbeat_at: Instant,
}

#[derive(Debug, Clone, Default)]
struct MemberData {
    up: bool,
    state: Option<MemberState>,
    op_time: OpTime,
    last_response: Option<Instant>,
}

const VOTE_LEASE: Duration = Duration::from_secs(30);

pub struct TopologyCoordinator {
    role: Role,
    follower_mode: MemberState,
    config: ReplicaSetConfig,
    self_index: Option<usize>,
    member_data: Vec<MemberData>,
    maintenance_count: i32,
    frozen_until: Option<Instant>,
    step_down_until: Option<Instant>,
    last_primary_seen: Option<Instant>,
    last_vote: Option<(Instant, Uuid)>,
    election_id: Option<Uuid>,
    election_op_time: Option<OpTime>,
    sync_source: Option<HostAndPort>,
    forced_sync_source: Option<HostAndPort>,
    blacklist: HashMap<HostAndPort, Instant>,
    election_timeout: Duration,
    heartbeat_interval: Duration,
}

impl TopologyCoordinator {
    pub fn new(election_timeout: Duration, heartbeat_interval: Duration) -> Self {
        Self {
            role: Role::Follower,
            follower_mode: MemberState::Startup,
            config: ReplicaSetConfig::default(),
            self_index: None,
            member_data: Vec::new(),
            maintenance_count: 0,
            frozen_until: None,
            step_down_until: None,
            last_primary_seen: None,
            last_vote: None,
            election_id: None,
            election_op_time: None,
            sync_source: None,
            forced_sync_source: None,
            blacklist: HashMap::new(),
            election_timeout,
            heartbeat_interval,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn election_id(&self) -> Option<Uuid> {
        self.election_id
    }

    pub fn election_op_time(&self) -> Option<OpTime> {
        self.election_op_time
    }

    pub fn config(&self) -> &ReplicaSetConfig {
        &self.config
    }

    pub fn self_index(&self) -> Option<usize> {
        self.self_index
    }

    /// The externally visible member state derived from the role and the
    /// follower sub-state.
    pub fn member_state(&self) -> MemberState {
        if !self.config.is_initialized() {
            return MemberState::Startup;
        }
        let self_index = match self.self_index {
            Some(i) => i,
            None => return MemberState::Removed,
        };
        if self.config.member_at(self_index).arbiter_only {
            return MemberState::Arbiter;
        }
        if self.role == Role::Leader {
            return MemberState::Primary;
        }
        if self.maintenance_count > 0 {
            return MemberState::Recovering;
        }
        self.follower_mode
    }

    /// Install a new configuration. Returns true when the install left this
    /// node a candidate (one-node short-circuit); the caller must then drive
    /// `process_win_election` without a heartbeat round trip.
    pub fn update_config(
        &mut self,
        config: ReplicaSetConfig,
        self_index: Option<usize>,
        _now: Instant,
        my_op_time: OpTime,
    ) -> bool {
        self.config = config;
        self.self_index = self_index;
        self.member_data = vec![MemberData::default(); self.config.num_members()];
        self.forced_sync_source = None;
        self.sync_source = None;

        if let Some(idx) = self_index {
            self.member_data[idx].up = true;
            self.member_data[idx].op_time = my_op_time;
            self.member_data[idx].state = Some(self.member_state());
        }

        let still_leader = self.role == Role::Leader
            && self_index
                .map(|i| self.config.member_at(i).is_electable())
                .unwrap_or(false);
        if still_leader {
            return false;
        }

        self.role = Role::Follower;
        if self.only_electable_voter_is_self() {
            // Elections are normally triggered by incoming heartbeats, but a
            // set whose only electable voter is this node receives none.
            self.role = Role::Candidate;
            return true;
        }
        false
    }

    fn only_electable_voter_is_self(&self) -> bool {
        let self_index = match self.self_index {
            Some(i) => i,
            None => return false,
        };
        if !self.config.member_at(self_index).is_electable() {
            return false;
        }
        self.config
            .members
            .iter()
            .enumerate()
            .all(|(i, m)| i == self_index || !m.is_electable())
    }

    // ---- heartbeat handling -------------------------------------------------

    pub fn prepare_heartbeat_response(
        &mut self,
        now: Instant,
        args: &HeartbeatRequest,
        our_set_name: &str,
        last_applied: OpTime,
    ) -> Result<HeartbeatResponse> {
        if args.set_name != our_set_name {
            return Err(RookDBError::BadValue(format!(
                "replica set names do not match: ours '{}', sender's '{}'",
                our_set_name, args.set_name
            )));
        }

        let mut sender_up = false;
        if let Some(sender) = &args.sender_host {
            if let Some(idx) = self.config.find_member_by_host(sender) {
                let md = &mut self.member_data[idx];
                md.last_response = Some(now);
                sender_up = md.up;
            }
        }

        let config_version = if self.config.is_initialized() {
            self.config.version
        } else {
            0
        };
        let config = if self.config.is_initialized() && args.config_version < self.config.version
        {
            Some(self.config.to_document())
        } else {
            None
        };

        Ok(HeartbeatResponse {
            set_name: our_set_name.to_string(),
            state: self.member_state(),
            config_version,
            op_time: last_applied,
            sender_up,
            config,
        })
    }

    /// Fold a heartbeat response (or failure) from `target` into the member
    /// table and decide what, if anything, the coordinator must do next.
    pub fn process_heartbeat_response(
        &mut self,
        now: Instant,
        target: &HostAndPort,
        response: &Result<HeartbeatResponse>,
    ) -> HeartbeatDisposition {
        let next_heartbeat_at = now + self.heartbeat_interval;
        let member_index = match self.config.find_member_by_host(target) {
            Some(i) => i,
            None => {
                return HeartbeatDisposition {
                    action: HeartbeatAction::None,
                    next_heartbeat_at,
                }
            }
        };

        match response {
            Err(_) => {
                let timed_out = self.member_data[member_index]
                    .last_response
                    .map(|t| now.duration_since(t) > self.config.heartbeat_timeout)
                    .unwrap_or(true);
                if timed_out {
                    let md = &mut self.member_data[member_index];
                    md.up = false;
                    md.state = Some(MemberState::Down);
                }
            }
            Ok(resp) => {
                let md = &mut self.member_data[member_index];
                md.up = true;
                md.state = Some(resp.state);
                md.op_time = resp.op_time;
                md.last_response = Some(now);

                if resp.state.primary() {
                    self.last_primary_seen = Some(now);
                    if self.role == Role::Leader {
                        let self_priority = self
                            .self_index
                            .map(|i| self.config.member_at(i).priority)
                            .unwrap_or(0.0);
                        if self.config.member_at(member_index).priority > self_priority {
                            return HeartbeatDisposition {
                                action: HeartbeatAction::StepDownSelf,
                                next_heartbeat_at,
                            };
                        }
                    }
                }

                if resp.config_version > self.config.version {
                    if let Some(doc) = &resp.config {
                        return HeartbeatDisposition {
                            action: HeartbeatAction::Reconfig(doc.clone()),
                            next_heartbeat_at,
                        };
                    }
                }
            }
        }

        if self.should_stand_for_election(now) {
            return HeartbeatDisposition {
                action: HeartbeatAction::StartElection,
                next_heartbeat_at,
            };
        }

        HeartbeatDisposition {
            action: HeartbeatAction::None,
            next_heartbeat_at,
        }
    }

    fn should_stand_for_election(&self, now: Instant) -> bool {
        if self.role != Role::Follower {
            return false;
        }
        if self.follower_mode != MemberState::Secondary || self.maintenance_count > 0 {
            return false;
        }
        if self.is_frozen(now) || self.is_stepped_down(now) {
            return false;
        }
        let self_index = match self.self_index {
            Some(i) => i,
            None => return false,
        };
        if !self.config.member_at(self_index).is_electable() {
            return false;
        }
        if self.primary_index().is_some() {
            return false;
        }
        match self.last_primary_seen {
            Some(seen) => now.duration_since(seen) >= self.election_timeout,
            None => true,
        }
    }

    fn primary_index(&self) -> Option<usize> {
        self.member_data
            .iter()
            .position(|md| md.up && md.state.map(|s| s.primary()).unwrap_or(false))
    }

    pub fn is_frozen(&self, now: Instant) -> bool {
        self.frozen_until.map(|t| t > now).unwrap_or(false)
    }

    pub fn is_stepped_down(&self, now: Instant) -> bool {
        self.step_down_until.map(|t| t > now).unwrap_or(false)
    }

    // ---- elections ----------------------------------------------------------

    /// Move follower → candidate if this node is currently eligible.
    pub fn become_candidate_if_electable(&mut self, now: Instant) -> bool {
        if self.should_stand_for_election(now) {
            self.role = Role::Candidate;
            true
        } else {
            false
        }
    }

    /// candidate → leader. Calling this in any other role is a logic error.
    pub fn process_win_election(&mut self, election_id: Uuid, election_op_time: OpTime) {
        assert!(
            self.role == Role::Candidate,
            "processWinElection called on a {:?}, not a candidate",
            self.role
        );
        self.role = Role::Leader;
        self.election_id = Some(election_id);
        self.election_op_time = Some(election_op_time);
        self.step_down_until = None;
        self.sync_source = None;
        self.last_primary_seen = None;
        if let Some(idx) = self.self_index {
            self.member_data[idx].state = Some(MemberState::Primary);
        }
    }

    /// candidate → follower when a round is lost or cancelled.
    pub fn process_lose_election(&mut self) {
        assert!(
            self.role == Role::Candidate,
            "processLoseElection called on a {:?}, not a candidate",
            self.role
        );
        self.role = Role::Follower;
    }

    /// leader → follower; the caller decides when and wakes its waiters.
    pub fn step_down(&mut self) {
        assert!(
            self.role == Role::Leader,
            "stepDown called on a {:?}, not a leader",
            self.role
        );
        self.role = Role::Follower;
        self.follower_mode = MemberState::Secondary;
        self.election_id = None;
        if let Some(idx) = self.self_index {
            self.member_data[idx].state = Some(MemberState::Secondary);
        }
    }

    pub fn set_step_down_time(&mut self, until: Instant) {
        self.step_down_until = Some(until);
    }

    /// Install a follower sub-state. Returns true when the change left this
    /// node a candidate (one-node set entering SECONDARY).
    pub fn set_follower_mode(&mut self, new_state: MemberState) -> bool {
        assert!(
            self.role != Role::Leader,
            "setFollowerMode called while leader"
        );
        self.follower_mode = new_state;
        if let Some(idx) = self.self_index {
            self.member_data[idx].state = Some(self.member_state());
        }
        if new_state == MemberState::Secondary
            && self.role == Role::Follower
            && self.only_electable_voter_is_self()
        {
            self.role = Role::Candidate;
            return true;
        }
        false
    }

    pub fn follower_mode(&self) -> MemberState {
        self.follower_mode
    }

    pub fn prepare_fresh_response(
        &mut self,
        args: &FreshRequest,
        _now: Instant,
        last_applied: OpTime,
    ) -> Result<FreshResponse> {
        if !self.config.is_initialized() {
            return Err(RookDBError::NotYetInitialized(
                "received freshness probe before a configuration was installed".to_string(),
            ));
        }
        if args.set_name != self.config.name {
            return Err(RookDBError::BadValue(format!(
                "wrong replica set name for freshness probe: '{}'",
                args.set_name
            )));
        }
        let my_id = self
            .self_index
            .map(|i| self.config.member_at(i).id)
            .unwrap_or(-1);

        let mut veto = false;
        let mut errmsg = None;
        if self.config.find_member_by_id(args.candidate_id).is_none() {
            veto = true;
            errmsg = Some(format!(
                "candidate with id {} is not in our configuration",
                args.candidate_id
            ));
        } else if args.config_version < self.config.version {
            veto = true;
            errmsg = Some("candidate's configuration version is stale".to_string());
        } else if self.member_state().primary() && last_applied >= args.op_time {
            veto = true;
            errmsg = Some("I am already primary and at least as current".to_string());
        } else if let Some(primary) = self.primary_index() {
            if self.member_data[primary].op_time >= args.op_time {
                veto = true;
                errmsg = Some(format!(
                    "existing primary {} is at least as current as the candidate",
                    self.config.member_at(primary).host
                ));
            }
        }

        // Stale when we have applied past the candidate; ties break toward
        // the lower member id.
        let fresher = last_applied > args.op_time
            || (last_applied == args.op_time && my_id < args.candidate_id);

        Ok(FreshResponse {
            id: my_id,
            set_name: self.config.name.clone(),
            op_time: last_applied,
            fresher,
            veto,
            errmsg,
        })
    }

    pub fn prepare_elect_response(
        &mut self,
        args: &ElectRequest,
        now: Instant,
        _last_applied: OpTime,
    ) -> Result<ElectResponse> {
        if !self.config.is_initialized() {
            return Err(RookDBError::NotYetInitialized(
                "received elect request before a configuration was installed".to_string(),
            ));
        }
        if args.set_name != self.config.name {
            return Err(RookDBError::BadValue(format!(
                "wrong replica set name for elect request: '{}'",
                args.set_name
            )));
        }

        let candidate = self.config.find_member_by_id(args.candidate_id);
        let vote = if candidate.map(|m| m.votes).unwrap_or(0) < 1 {
            ELECT_VETO_VOTE
        } else if args.config_version < self.config.version {
            ELECT_VETO_VOTE
        } else if self.member_state().primary() {
            ELECT_VETO_VOTE
        } else if self
            .last_vote
            .map(|(when, round)| round != args.round && now.duration_since(when) < VOTE_LEASE)
            .unwrap_or(false)
        {
            // Voted for another round too recently.
            0
        } else {
            self.last_vote = Some((now, args.round));
            self.self_index
                .map(|i| self.config.member_at(i).votes)
                .unwrap_or(0)
        };

        Ok(ElectResponse {
            vote,
            round: args.round,
        })
    }

    // ---- maintenance --------------------------------------------------------

    pub fn maintenance_count(&self) -> i32 {
        self.maintenance_count
    }

    /// Only followers may adjust the counter; it never goes negative.
    pub fn adjust_maintenance_count_by(&mut self, delta: i32) {
        assert!(
            self.role == Role::Follower,
            "maintenance mode can only change on a follower"
        );
        self.maintenance_count += delta;
        assert!(self.maintenance_count >= 0, "maintenance count underflow");
    }

    pub fn prepare_freeze_response(&mut self, now: Instant, secs: i64) -> Result<String> {
        if self.member_state().primary() {
            return Err(RookDBError::NotSecondary(
                "cannot freeze a primary; step down first".to_string(),
            ));
        }
        if secs <= 0 {
            self.frozen_until = None;
            Ok("unfreezing".to_string())
        } else {
            self.frozen_until = Some(now + Duration::from_secs(secs as u64));
            Ok(format!("frozen for {} seconds", secs))
        }
    }

    // ---- sync source policy -------------------------------------------------

    pub fn choose_new_sync_source(&mut self, now: Instant, my_op_time: OpTime) -> Option<HostAndPort> {
        if !self.config.is_initialized() {
            return None;
        }
        if let Some(forced) = self.forced_sync_source.take() {
            self.sync_source = Some(forced.clone());
            return Some(forced);
        }
        self.blacklist.retain(|_, until| *until > now);

        let self_index = self.self_index;
        let builds_indexes = self_index
            .map(|i| self.config.member_at(i).build_indexes)
            .unwrap_or(true);

        let mut best: Option<usize> = None;
        for (i, member) in self.config.members.iter().enumerate() {
            if Some(i) == self_index {
                continue;
            }
            let md = &self.member_data[i];
            if !md.up {
                continue;
            }
            let state = md.state.unwrap_or(MemberState::Unknown);
            if !state.readable() {
                continue;
            }
            if self.blacklist.contains_key(&member.host) {
                continue;
            }
            if builds_indexes && !member.build_indexes {
                continue;
            }
            if !state.primary() && md.op_time <= my_op_time {
                continue;
            }
            match best {
                None => best = Some(i),
                Some(b) => {
                    let better = md.op_time > self.member_data[b].op_time
                        || (md.op_time == self.member_data[b].op_time
                            && member.id < self.config.member_at(b).id);
                    if better {
                        best = Some(i);
                    }
                }
            }
        }

        self.sync_source = best.map(|i| self.config.member_at(i).host.clone());
        self.sync_source.clone()
    }

    pub fn blacklist_sync_source(&mut self, host: &HostAndPort, until: Instant) {
        self.blacklist.insert(host.clone(), until);
    }

    pub fn clear_sync_source_blacklist(&mut self) {
        self.blacklist.clear();
    }

    pub fn should_change_sync_source(&mut self, current: &HostAndPort, now: Instant) -> bool {
        self.blacklist.retain(|_, until| *until > now);
        let idx = match self.config.find_member_by_host(current) {
            Some(i) => i,
            None => return true,
        };
        if self.blacklist.contains_key(current) {
            return true;
        }
        let md = &self.member_data[idx];
        if !md.up || !md.state.map(|s| s.readable()).unwrap_or(false) {
            return true;
        }
        false
    }

    pub fn prepare_sync_from_response(&mut self, target: &HostAndPort) -> Result<String> {
        if !self.config.is_initialized() {
            return Err(RookDBError::NotYetInitialized(
                "cannot sync from a member before a configuration is installed".to_string(),
            ));
        }
        let idx = self
            .config
            .find_member_by_host(target)
            .ok_or_else(|| {
                RookDBError::NodeNotFound(format!("{} is not a member of the set", target))
            })?;
        if Some(idx) == self.self_index {
            return Err(RookDBError::BadValue(
                "cannot sync from self".to_string(),
            ));
        }
        if self.config.member_at(idx).arbiter_only {
            return Err(RookDBError::BadValue(format!(
                "cannot sync from {} because it is an arbiter",
                target
            )));
        }
        let previous = self.sync_source.clone();
        self.forced_sync_source = Some(target.clone());
        Ok(match previous {
            Some(prev) => format!("syncing from {} instead of {}", target, prev),
            None => format!("syncing from {}", target),
        })
    }

    pub fn sync_source(&self) -> Option<HostAndPort> {
        self.sync_source.clone()
    }

    // ---- status -------------------------------------------------------------

    pub fn fill_is_master(&self, response: &mut IsMasterResponse) {
        response.set_name = self.config.name.clone();
        let state = self.member_state();
        response.is_master = state.primary();
        response.secondary = state.secondary();
        response.hosts = self
            .config
            .members
            .iter()
            .filter(|m| !m.hidden)
            .map(|m| m.host.to_string())
            .collect();
        response.me = self
            .self_index
            .map(|i| self.config.member_at(i).host.to_string());
        response.primary = if state.primary() {
            response.me.clone()
        } else {
            self.primary_index()
                .map(|i| self.config.member_at(i).host.to_string())
        };
    }
}
