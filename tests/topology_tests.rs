/*!
 * Topology coordinator tests
 * Pure state machine checks: role transitions, election responses,
 * maintenance mode and sync source policy
 */

use std::time::{Duration, Instant};

use bson::doc;
use uuid::Uuid;

use rookdb::member_state::MemberState;
use rookdb::optime::OpTime;
use rookdb::protocol::{ElectRequest, FreshRequest, HeartbeatRequest, HeartbeatResponse};
use rookdb::replica_set_config::{HostAndPort, ReplicaSetConfig};
use rookdb::topology::{HeartbeatAction, Role, TopologyCoordinator};

fn make_config(version: i64, hosts: &[&str]) -> ReplicaSetConfig {
    let members: Vec<bson::Bson> = hosts
        .iter()
        .enumerate()
        .map(|(i, h)| bson::Bson::Document(doc! { "_id": i as i64, "host": *h }))
        .collect();
    let config =
        ReplicaSetConfig::initialize(&doc! { "_id": "rs0", "version": version, "members": members })
            .unwrap();
    config.validate().unwrap();
    config
}

fn new_topo() -> TopologyCoordinator {
    TopologyCoordinator::new(Duration::from_millis(50), Duration::from_millis(10))
}

fn ok_response(state: MemberState, op_time: OpTime) -> HeartbeatResponse {
    HeartbeatResponse {
        set_name: "rs0".to_string(),
        state,
        config_version: 1,
        op_time,
        sender_up: true,
        config: None,
    }
}

#[test]
fn one_node_config_short_circuits_to_candidate_and_wins() {
    let mut topo = new_topo();
    let became_candidate = topo.update_config(
        make_config(1, &["h:1"]),
        Some(0),
        Instant::now(),
        OpTime::NULL,
    );
    assert!(became_candidate);
    assert_eq!(topo.role(), Role::Candidate);

    topo.process_win_election(Uuid::new_v4(), OpTime::NULL);
    assert_eq!(topo.role(), Role::Leader);
    assert_eq!(topo.member_state(), MemberState::Primary);
}

#[test]
fn three_node_config_stays_follower() {
    let mut topo = new_topo();
    let became_candidate = topo.update_config(
        make_config(1, &["h:1", "h:2", "h:3"]),
        Some(0),
        Instant::now(),
        OpTime::NULL,
    );
    assert!(!became_candidate);
    assert_eq!(topo.role(), Role::Follower);
    assert_eq!(topo.member_state(), MemberState::Startup);
}

#[test]
fn removed_node_reports_removed() {
    let mut topo = new_topo();
    topo.update_config(make_config(1, &["h:1", "h:2"]), None, Instant::now(), OpTime::NULL);
    assert_eq!(topo.member_state(), MemberState::Removed);
}

#[test]
fn step_down_returns_to_secondary() {
    let mut topo = new_topo();
    topo.update_config(make_config(1, &["h:1"]), Some(0), Instant::now(), OpTime::NULL);
    topo.process_win_election(Uuid::new_v4(), OpTime::NULL);

    topo.step_down();
    assert_eq!(topo.role(), Role::Follower);
    assert_eq!(topo.member_state(), MemberState::Secondary);
}

#[test]
#[should_panic(expected = "processWinElection")]
fn win_election_as_follower_panics() {
    let mut topo = new_topo();
    topo.update_config(
        make_config(1, &["h:1", "h:2", "h:3"]),
        Some(0),
        Instant::now(),
        OpTime::NULL,
    );
    topo.process_win_election(Uuid::new_v4(), OpTime::NULL);
}

#[test]
fn follower_mode_secondary_on_one_node_set_becomes_candidate() {
    let mut topo = new_topo();
    let config = ReplicaSetConfig::initialize(&doc! {
        "_id": "rs0",
        "version": 1,
        "members": [
            { "_id": 0, "host": "h:1" },
            { "_id": 1, "host": "h:2", "arbiterOnly": true },
        ],
    })
    .unwrap();
    // The arbiter is a voter but not electable, so the install leaves us a
    // candidate already; knock the role back and retry via follower mode.
    let became_candidate = topo.update_config(config, Some(0), Instant::now(), OpTime::NULL);
    assert!(became_candidate);
    topo.process_lose_election();

    assert!(topo.set_follower_mode(MemberState::Secondary));
    assert_eq!(topo.role(), Role::Candidate);
}

#[test]
fn heartbeat_timeout_without_primary_starts_election() {
    let mut topo = new_topo();
    topo.update_config(
        make_config(1, &["h:1", "h:2", "h:3"]),
        Some(0),
        Instant::now(),
        OpTime::NULL,
    );
    topo.set_follower_mode(MemberState::Secondary);

    let action = topo.process_heartbeat_response(
        Instant::now(),
        &HostAndPort::new("h", 2),
        &Ok(ok_response(MemberState::Secondary, OpTime::new(1, 1))),
    );
    assert!(matches!(action.action, HeartbeatAction::StartElection));
}

#[test]
fn heartbeat_from_primary_suppresses_election() {
    let mut topo = new_topo();
    topo.update_config(
        make_config(1, &["h:1", "h:2", "h:3"]),
        Some(0),
        Instant::now(),
        OpTime::NULL,
    );
    topo.set_follower_mode(MemberState::Secondary);

    let action = topo.process_heartbeat_response(
        Instant::now(),
        &HostAndPort::new("h", 2),
        &Ok(ok_response(MemberState::Primary, OpTime::new(1, 5))),
    );
    assert!(matches!(action.action, HeartbeatAction::None));

    let action = topo.process_heartbeat_response(
        Instant::now(),
        &HostAndPort::new("h", 3),
        &Ok(ok_response(MemberState::Secondary, OpTime::new(1, 1))),
    );
    assert!(matches!(action.action, HeartbeatAction::None));
}

#[test]
fn heartbeat_response_carries_state_and_config_for_stale_sender() {
    let mut topo = new_topo();
    topo.update_config(
        make_config(3, &["h:1", "h:2"]),
        Some(0),
        Instant::now(),
        OpTime::NULL,
    );

    let request = HeartbeatRequest {
        set_name: "rs0".to_string(),
        sender_host: Some(HostAndPort::new("h", 2)),
        sender_id: Some(1),
        config_version: 1,
    };
    let response = topo
        .prepare_heartbeat_response(Instant::now(), &request, "rs0", OpTime::new(2, 7))
        .unwrap();
    assert_eq!(response.set_name, "rs0");
    assert_eq!(response.config_version, 3);
    assert_eq!(response.op_time, OpTime::new(2, 7));
    assert!(response.config.is_some());

    let mismatched = HeartbeatRequest {
        set_name: "other".to_string(),
        sender_host: None,
        sender_id: None,
        config_version: 1,
    };
    assert!(topo
        .prepare_heartbeat_response(Instant::now(), &mismatched, "rs0", OpTime::NULL)
        .is_err());
}

#[test]
fn fresh_response_reports_stale_candidates() {
    let mut topo = new_topo();
    topo.update_config(
        make_config(1, &["h:1", "h:2", "h:3"]),
        Some(0),
        Instant::now(),
        OpTime::NULL,
    );

    // Candidate is behind our applied position.
    let response = topo
        .prepare_fresh_response(
            &FreshRequest {
                set_name: "rs0".to_string(),
                who: HostAndPort::new("h", 2),
                candidate_id: 1,
                config_version: 1,
                op_time: OpTime::new(1, 3),
            },
            Instant::now(),
            OpTime::new(1, 5),
        )
        .unwrap();
    assert!(response.fresher);

    // Unknown candidates are vetoed outright.
    let response = topo
        .prepare_fresh_response(
            &FreshRequest {
                set_name: "rs0".to_string(),
                who: HostAndPort::new("h", 9),
                candidate_id: 42,
                config_version: 1,
                op_time: OpTime::new(9, 9),
            },
            Instant::now(),
            OpTime::NULL,
        )
        .unwrap();
    assert!(response.veto);
}

#[test]
fn elect_response_votes_once_per_lease() {
    let mut topo = new_topo();
    topo.update_config(
        make_config(2, &["h:1", "h:2", "h:3"]),
        Some(0),
        Instant::now(),
        OpTime::NULL,
    );

    let round = Uuid::new_v4();
    let response = topo
        .prepare_elect_response(
            &ElectRequest {
                set_name: "rs0".to_string(),
                candidate_id: 1,
                config_version: 2,
                round,
            },
            Instant::now(),
            OpTime::NULL,
        )
        .unwrap();
    assert_eq!(response.vote, 1);

    // A different round inside the lease gets no vote.
    let response = topo
        .prepare_elect_response(
            &ElectRequest {
                set_name: "rs0".to_string(),
                candidate_id: 2,
                config_version: 2,
                round: Uuid::new_v4(),
            },
            Instant::now(),
            OpTime::NULL,
        )
        .unwrap();
    assert_eq!(response.vote, 0);

    // A stale configuration version is vetoed.
    let response = topo
        .prepare_elect_response(
            &ElectRequest {
                set_name: "rs0".to_string(),
                candidate_id: 1,
                config_version: 1,
                round,
            },
            Instant::now(),
            OpTime::NULL,
        )
        .unwrap();
    assert!(response.vote < 0);
}

#[test]
fn maintenance_count_drives_recovering_state() {
    let mut topo = new_topo();
    topo.update_config(
        make_config(1, &["h:1", "h:2", "h:3"]),
        Some(0),
        Instant::now(),
        OpTime::NULL,
    );
    topo.set_follower_mode(MemberState::Secondary);

    topo.adjust_maintenance_count_by(1);
    topo.adjust_maintenance_count_by(1);
    assert_eq!(topo.maintenance_count(), 2);
    assert_eq!(topo.member_state(), MemberState::Recovering);

    topo.adjust_maintenance_count_by(-1);
    topo.adjust_maintenance_count_by(-1);
    assert_eq!(topo.member_state(), MemberState::Secondary);
}

#[test]
fn freeze_requires_secondary_and_expires() {
    let mut topo = new_topo();
    topo.update_config(make_config(1, &["h:1"]), Some(0), Instant::now(), OpTime::NULL);
    topo.process_win_election(Uuid::new_v4(), OpTime::NULL);
    assert!(topo.prepare_freeze_response(Instant::now(), 10).is_err());

    topo.step_down();
    let now = Instant::now();
    topo.prepare_freeze_response(now, 10).unwrap();
    assert!(topo.is_frozen(now + Duration::from_secs(5)));
    assert!(!topo.is_frozen(now + Duration::from_secs(11)));

    topo.prepare_freeze_response(now, 0).unwrap();
    assert!(!topo.is_frozen(now + Duration::from_secs(5)));
}

#[test]
fn sync_source_prefers_fresher_members_and_honors_blacklist() {
    let mut topo = new_topo();
    topo.update_config(
        make_config(1, &["h:1", "h:2", "h:3"]),
        Some(0),
        Instant::now(),
        OpTime::new(1, 1),
    );
    let now = Instant::now();
    topo.process_heartbeat_response(
        now,
        &HostAndPort::new("h", 2),
        &Ok(ok_response(MemberState::Secondary, OpTime::new(1, 9))),
    );
    topo.process_heartbeat_response(
        now,
        &HostAndPort::new("h", 3),
        &Ok(ok_response(MemberState::Secondary, OpTime::new(1, 5))),
    );

    let chosen = topo.choose_new_sync_source(now, OpTime::new(1, 1));
    assert_eq!(chosen, Some(HostAndPort::new("h", 2)));

    topo.blacklist_sync_source(&HostAndPort::new("h", 2), now + Duration::from_secs(30));
    let chosen = topo.choose_new_sync_source(now, OpTime::new(1, 1));
    assert_eq!(chosen, Some(HostAndPort::new("h", 3)));
    assert!(topo.should_change_sync_source(&HostAndPort::new("h", 2), now));

    topo.clear_sync_source_blacklist();
    let chosen = topo.choose_new_sync_source(now, OpTime::new(1, 1));
    assert_eq!(chosen, Some(HostAndPort::new("h", 2)));

    // A member we have not heard from is not a usable source.
    assert!(topo.should_change_sync_source(&HostAndPort::new("h", 9), now));
}

#[test]
fn forced_sync_source_is_used_once() {
    let mut topo = new_topo();
    topo.update_config(
        make_config(1, &["h:1", "h:2", "h:3"]),
        Some(0),
        Instant::now(),
        OpTime::new(1, 1),
    );
    let now = Instant::now();
    topo.process_heartbeat_response(
        now,
        &HostAndPort::new("h", 2),
        &Ok(ok_response(MemberState::Secondary, OpTime::new(1, 9))),
    );

    topo.prepare_sync_from_response(&HostAndPort::new("h", 3)).unwrap();
    assert_eq!(
        topo.choose_new_sync_source(now, OpTime::new(1, 1)),
        Some(HostAndPort::new("h", 3))
    );
    // The override applies to a single selection.
    assert_eq!(
        topo.choose_new_sync_source(now, OpTime::new(1, 1)),
        Some(HostAndPort::new("h", 2))
    );

    assert!(topo.prepare_sync_from_response(&HostAndPort::new("h", 1)).is_err());
    assert!(topo.prepare_sync_from_response(&HostAndPort::new("x", 9)).is_err());
}
