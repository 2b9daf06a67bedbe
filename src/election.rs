/*!
 * Election sub-state machines
 * Vote accounting for the freshness probe round and the elect round; the
 * coordinator drives both on the topology driver thread
 */

use uuid::Uuid;

use crate::error::Result;
use crate::executor::EventHandle;
use crate::protocol::{ElectResponse, FreshResponse};

/// Tally of one freshness probe round. The candidate aborts when any voter
/// reports itself fresher or vetoes outright.
#[derive(Debug)]
pub struct FreshnessChecker {
    pending: usize,
    fresher_found: bool,
    vetoed: bool,
    canceled: bool,
}

impl FreshnessChecker {
    pub fn new(num_targets: usize) -> Self {
        Self {
            pending: num_targets,
            fresher_found: false,
            vetoed: false,
            canceled: false,
        }
    }

    pub fn process_response(&mut self, response: &Result<FreshResponse>) {
        if self.pending > 0 {
            self.pending -= 1;
        }
        if let Ok(resp) = response {
            if resp.fresher {
                self.fresher_found = true;
            }
            if resp.veto {
                self.vetoed = true;
            }
        }
        // An unreachable voter neither vetoes nor votes.
    }

    pub fn done(&self) -> bool {
        self.pending == 0
    }

    pub fn should_abort_election(&self) -> bool {
        self.fresher_found || self.vetoed
    }

    pub fn cancel(&mut self) {
        self.canceled = true;
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }
}

/// Tally of one elect round. Votes start with the candidate's own weight; a
/// veto carries a large negative weight so a single nay sinks the round.
#[derive(Debug)]
pub struct ElectCmdRunner {
    round: Uuid,
    pending: usize,
    votes: i64,
    canceled: bool,
}

impl ElectCmdRunner {
    pub fn new(round: Uuid, num_targets: usize, my_votes: i64) -> Self {
        Self {
            round,
            pending: num_targets,
            votes: my_votes,
            canceled: false,
        }
    }

    pub fn round(&self) -> Uuid {
        self.round
    }

    pub fn process_response(&mut self, response: &Result<ElectResponse>) {
        if self.pending > 0 {
            self.pending -= 1;
        }
        if let Ok(resp) = response {
            if resp.round == self.round {
                self.votes += resp.vote;
            }
        }
    }

    pub fn done(&self) -> bool {
        self.pending == 0
    }

    pub fn received_votes(&self) -> i64 {
        self.votes
    }

    pub fn cancel(&mut self) {
        self.canceled = true;
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }
}

/// The in-flight election owned by the coordinator; torn down when the
/// finish event fires.
pub struct ElectionState {
    pub round: Uuid,
    pub freshness: FreshnessChecker,
    pub elect: Option<ElectCmdRunner>,
    pub finish_event: EventHandle,
}

impl ElectionState {
    pub fn new(round: Uuid, num_targets: usize, finish_event: EventHandle) -> Self {
        Self {
            round,
            freshness: FreshnessChecker::new(num_targets),
            elect: None,
            finish_event,
        }
    }

    pub fn cancel(&mut self) {
        self.freshness.cancel();
        if let Some(elect) = &mut self.elect {
            elect.cancel();
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.freshness.is_canceled()
            || self.elect.as_ref().map(|e| e.is_canceled()).unwrap_or(false)
    }
}
