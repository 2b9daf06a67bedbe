/*!
 * Outbound replication network interface
 * The coordinator sends heartbeats and election probes through this seam;
 * delivery and encoding belong to the transport layer
 */

use parking_lot::Mutex;

use crate::error::{Result, RookDBError};
use crate::member_state::MemberState;
use crate::optime::OpTime;
use crate::protocol::{
    ElectRequest, ElectResponse, FreshRequest, FreshResponse, HeartbeatRequest, HeartbeatResponse,
};
use crate::replica_set_config::HostAndPort;

/// Completion callback for an outbound request. May be invoked from any
/// thread; implementations must not block the caller of `start_*`.
pub type ReplyFn<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

pub trait ReplicationNetwork: Send + Sync {
    fn start_heartbeat(
        &self,
        target: &HostAndPort,
        request: HeartbeatRequest,
        reply: ReplyFn<HeartbeatResponse>,
    );

    fn start_fresh(&self, target: &HostAndPort, request: FreshRequest, reply: ReplyFn<FreshResponse>);

    fn start_elect(&self, target: &HostAndPort, request: ElectRequest, reply: ReplyFn<ElectResponse>);
}

type HeartbeatHandler =
    Box<dyn Fn(&HostAndPort, &HeartbeatRequest) -> Result<HeartbeatResponse> + Send + Sync>;
type FreshHandler = Box<dyn Fn(&HostAndPort, &FreshRequest) -> Result<FreshResponse> + Send + Sync>;
type ElectHandler = Box<dyn Fn(&HostAndPort, &ElectRequest) -> Result<ElectResponse> + Send + Sync>;

/// Test and bootstrap network: responses come from programmable handlers,
/// invoked synchronously. With no handler installed every target is
/// unreachable.
#[derive(Default)]
pub struct MockNetwork {
    heartbeat: Mutex<Option<HeartbeatHandler>>,
    fresh: Mutex<Option<FreshHandler>>,
    elect: Mutex<Option<ElectHandler>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A network where every member acknowledges heartbeats; enough for
    /// quorum checks to pass.
    pub fn healthy() -> Self {
        let net = Self::new();
        net.set_heartbeat_handler(|_, req| {
            Ok(HeartbeatResponse {
                set_name: req.set_name.clone(),
                state: MemberState::Startup2,
                config_version: 0,
                op_time: OpTime::NULL,
                sender_up: true,
                config: None,
            })
        });
        net
    }

    pub fn set_heartbeat_handler<F>(&self, handler: F)
    where
        F: Fn(&HostAndPort, &HeartbeatRequest) -> Result<HeartbeatResponse> + Send + Sync + 'static,
    {
        *self.heartbeat.lock() = Some(Box::new(handler));
    }

    pub fn set_fresh_handler<F>(&self, handler: F)
    where
        F: Fn(&HostAndPort, &FreshRequest) -> Result<FreshResponse> + Send + Sync + 'static,
    {
        *self.fresh.lock() = Some(Box::new(handler));
    }

    pub fn set_elect_handler<F>(&self, handler: F)
    where
        F: Fn(&HostAndPort, &ElectRequest) -> Result<ElectResponse> + Send + Sync + 'static,
    {
        *self.elect.lock() = Some(Box::new(handler));
    }
}

fn unreachable_error(target: &HostAndPort) -> RookDBError {
    RookDBError::HostUnreachable(format!("no route to {}", target))
}

impl ReplicationNetwork for MockNetwork {
    fn start_heartbeat(
        &self,
        target: &HostAndPort,
        request: HeartbeatRequest,
        reply: ReplyFn<HeartbeatResponse>,
    ) {
        let result = match &*self.heartbeat.lock() {
            Some(handler) => handler(target, &request),
            None => Err(unreachable_error(target)),
        };
        reply(result);
    }

    fn start_fresh(&self, target: &HostAndPort, request: FreshRequest, reply: ReplyFn<FreshResponse>) {
        let result = match &*self.fresh.lock() {
            Some(handler) => handler(target, &request),
            None => Err(unreachable_error(target)),
        };
        reply(result);
    }

    fn start_elect(&self, target: &HostAndPort, request: ElectRequest, reply: ReplyFn<ElectResponse>) {
        let result = match &*self.elect.lock() {
            Some(handler) => handler(target, &request),
            None => Err(unreachable_error(target)),
        };
        reply(result);
    }
}
