/*!
 * Quorum checks for configuration changes
 * Probes the proposed members with heartbeats before a new configuration is
 * persisted: initiate requires every member to assent, reconfig a majority
 * of votes
 */

use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;

use crate::error::{Result, RookDBError};
use crate::network::ReplicationNetwork;
use crate::protocol::{HeartbeatRequest, HeartbeatResponse};
use crate::replica_set_config::ReplicaSetConfig;
use tracing::warn;

struct QuorumReply {
    member_index: usize,
    response: Result<HeartbeatResponse>,
}

fn probe_members(
    network: &dyn ReplicationNetwork,
    config: &ReplicaSetConfig,
    my_index: usize,
    timeout: Duration,
) -> Vec<QuorumReply> {
    let (tx, rx) = unbounded();
    let mut outstanding = 0usize;

    for (i, member) in config.members.iter().enumerate() {
        if i == my_index {
            continue;
        }
        let request = HeartbeatRequest {
            set_name: config.name.clone(),
            sender_host: Some(config.member_at(my_index).host.clone()),
            sender_id: Some(config.member_at(my_index).id),
            config_version: config.version,
        };
        let reply_tx = tx.clone();
        network.start_heartbeat(
            &member.host,
            request,
            Box::new(move |response| {
                let _ = reply_tx.send(QuorumReply {
                    member_index: i,
                    response,
                });
            }),
        );
        outstanding += 1;
    }
    drop(tx);

    let deadline = Instant::now() + timeout;
    let mut replies = Vec::with_capacity(outstanding);
    while replies.len() < outstanding {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(reply) => replies.push(reply),
            Err(_) => break,
        }
    }
    replies
}

fn check_for_vetoes(config: &ReplicaSetConfig, replies: &[QuorumReply]) -> Result<()> {
    for reply in replies {
        if let Ok(resp) = &reply.response {
            let host = &config.member_at(reply.member_index).host;
            if resp.set_name != config.name {
                return Err(RookDBError::BadValue(format!(
                    "{} reports set name '{}', expected '{}'",
                    host, resp.set_name, config.name
                )));
            }
            if resp.config_version > config.version {
                return Err(RookDBError::BadValue(format!(
                    "{} has a newer configuration (version {} > {})",
                    host, resp.config_version, config.version
                )));
            }
        }
    }
    Ok(())
}

/// Initiate requires assent from every proposed member.
pub fn check_quorum_for_initiate(
    network: &dyn ReplicationNetwork,
    config: &ReplicaSetConfig,
    my_index: usize,
    timeout: Duration,
) -> Result<()> {
    let replies = probe_members(network, config, my_index, timeout);
    check_for_vetoes(config, &replies)?;

    let responded = replies.iter().filter(|r| r.response.is_ok()).count();
    let expected = config.num_members() - 1;
    if responded < expected {
        for reply in &replies {
            if let Err(err) = &reply.response {
                warn!(
                    "quorum check could not reach {}: {}",
                    config.member_at(reply.member_index).host,
                    err
                );
            }
        }
        return Err(RookDBError::NodeNotFound(format!(
            "could not reach all members for initiate: {} of {} responded",
            responded, expected
        )));
    }
    Ok(())
}

/// Reconfig requires a majority of votes, counting this node's own.
pub fn check_quorum_for_reconfig(
    network: &dyn ReplicationNetwork,
    config: &ReplicaSetConfig,
    my_index: usize,
    timeout: Duration,
) -> Result<()> {
    let replies = probe_members(network, config, my_index, timeout);
    check_for_vetoes(config, &replies)?;

    let mut votes = config.member_at(my_index).votes;
    for reply in &replies {
        if reply.response.is_ok() {
            votes += config.member_at(reply.member_index).votes;
        }
    }
    if votes < config.majority_vote_count() as i64 {
        return Err(RookDBError::NodeNotFound(format!(
            "only {} of {} required votes reachable for reconfig",
            votes,
            config.majority_vote_count()
        )));
    }
    Ok(())
}
