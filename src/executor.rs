/*!
 * Topology driver: single-threaded cooperative task executor
 * Exclusively owns the topology coordinator; every mutation of topology
 * state runs as a task on the driver thread, strictly serialized FIFO.
 */

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};

use crate::error::{Result, RookDBError};
use tracing::debug;
use crate::topology::TopologyCoordinator;

/// Passed to every task when it runs. A cancelled or shutdown-drained task
/// still runs once so it can release resources, with `canceled` set.
pub struct TaskContext {
    pub canceled: bool,
}

pub type Task = Box<dyn FnOnce(&mut TopologyCoordinator, &TaskContext) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(u64);

struct WorkItem {
    id: u64,
    run_at: Option<Instant>,
    task: Task,
}

enum Directive {
    Work(WorkItem),
    Shutdown,
}

struct Deferred {
    run_at: Instant,
    seq: u64,
    item: WorkItem,
}

impl PartialEq for Deferred {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at && self.seq == other.seq
    }
}

impl Eq for Deferred {}

impl PartialOrd for Deferred {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deferred {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline pops
        // first, FIFO among equal deadlines.
        other
            .run_at
            .cmp(&self.run_at)
            .then(other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct EventState {
    signaled: bool,
    subscribers: Vec<WorkItem>,
}

struct ExecState {
    shutdown: bool,
    finished: bool,
    next_id: u64,
    next_event_id: u64,
    completed: HashSet<u64>,
    canceled: HashSet<u64>,
    events: HashMap<u64, EventState>,
    driver_thread: Option<ThreadId>,
}

struct ExecShared {
    tx: Sender<Directive>,
    state: Mutex<ExecState>,
    cond: Condvar,
}

/// Handle to the driver. Cloneable; all methods are thread safe.
#[derive(Clone)]
pub struct TopologyExecutor {
    shared: Arc<ExecShared>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl TopologyExecutor {
    /// Spawn the driver thread, handing it exclusive ownership of the
    /// topology coordinator.
    pub fn spawn(topology: TopologyCoordinator) -> Self {
        let (tx, rx) = unbounded();
        let shared = Arc::new(ExecShared {
            tx,
            state: Mutex::new(ExecState {
                shutdown: false,
                finished: false,
                next_id: 1,
                next_event_id: 1,
                completed: HashSet::new(),
                canceled: HashSet::new(),
                events: HashMap::new(),
                driver_thread: None,
            }),
            cond: Condvar::new(),
        });

        let loop_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("topology-driver".to_string())
            .spawn(move || driver_loop(loop_shared, rx, topology))
            .expect("failed to spawn topology driver thread");

        Self {
            shared,
            thread: Arc::new(Mutex::new(Some(handle))),
        }
    }

    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Append a task to the queue. Tasks run FIFO, strictly serialized.
    pub fn schedule<F>(&self, task: F) -> Result<CallbackHandle>
    where
        F: FnOnce(&mut TopologyCoordinator, &TaskContext) + Send + 'static,
    {
        self.enqueue(None, Box::new(task))
    }

    /// Run a task at or after `when`.
    pub fn schedule_at<F>(&self, when: Instant, task: F) -> Result<CallbackHandle>
    where
        F: FnOnce(&mut TopologyCoordinator, &TaskContext) + Send + 'static,
    {
        self.enqueue(Some(when), Box::new(task))
    }

    fn enqueue(&self, run_at: Option<Instant>, task: Task) -> Result<CallbackHandle> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(RookDBError::ShutdownInProgress(
                "topology driver is shutting down".to_string(),
            ));
        }
        let id = state.next_id;
        state.next_id += 1;
        // Send while holding the lock so the shutdown directive is totally
        // ordered after every accepted task.
        self.shared
            .tx
            .send(Directive::Work(WorkItem { id, run_at, task }))
            .map_err(|_| {
                RookDBError::ShutdownInProgress("topology driver is gone".to_string())
            })?;
        Ok(CallbackHandle(id))
    }

    /// Best-effort cancellation; the task still runs once with the
    /// cancellation marker set.
    pub fn cancel(&self, handle: CallbackHandle) {
        let mut state = self.shared.state.lock();
        if !state.completed.contains(&handle.0) {
            state.canceled.insert(handle.0);
        }
    }

    /// Block until the task has run. Must not be called from the driver
    /// thread itself.
    pub fn wait(&self, handle: CallbackHandle) {
        let mut state = self.shared.state.lock();
        assert!(
            state.driver_thread != Some(thread::current().id()),
            "re-entrant wait on the topology driver thread"
        );
        while !state.finished && !state.completed.contains(&handle.0) {
            self.shared.cond.wait(&mut state);
        }
    }

    pub fn make_event(&self) -> Result<EventHandle> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(RookDBError::ShutdownInProgress(
                "topology driver is shutting down".to_string(),
            ));
        }
        let id = state.next_event_id;
        state.next_event_id += 1;
        state.events.insert(id, EventState::default());
        Ok(EventHandle(id))
    }

    /// Signal an event: wake waiters and enqueue subscribed tasks.
    /// Signaling an unknown event is a logic error.
    pub fn signal_event(&self, event: EventHandle) {
        let mut state = self.shared.state.lock();
        let ev = state
            .events
            .get_mut(&event.0)
            .unwrap_or_else(|| panic!("signalEvent on unknown event {:?}", event));
        ev.signaled = true;
        let subscribers = std::mem::take(&mut ev.subscribers);
        let gone = state.shutdown;
        for item in subscribers {
            if gone {
                state.completed.insert(item.id);
            } else if self.shared.tx.send(Directive::Work(item)).is_err() {
                break;
            }
        }
        self.shared.cond.notify_all();
    }

    /// Run `task` once the event is signaled (immediately if it already was).
    pub fn on_event<F>(&self, event: EventHandle, task: F) -> Result<CallbackHandle>
    where
        F: FnOnce(&mut TopologyCoordinator, &TaskContext) + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(RookDBError::ShutdownInProgress(
                "topology driver is shutting down".to_string(),
            ));
        }
        let id = state.next_id;
        state.next_id += 1;
        let item = WorkItem {
            id,
            run_at: None,
            task: Box::new(task),
        };
        let ev = state
            .events
            .get_mut(&event.0)
            .ok_or_else(|| RookDBError::BadValue("onEvent for unknown event".to_string()))?;
        if ev.signaled {
            self.shared
                .tx
                .send(Directive::Work(item))
                .map_err(|_| RookDBError::ShutdownInProgress("topology driver is gone".to_string()))?;
        } else {
            ev.subscribers.push(item);
        }
        Ok(CallbackHandle(id))
    }

    /// Block the calling thread until the event is signaled.
    pub fn wait_for_event(&self, event: EventHandle) {
        let mut state = self.shared.state.lock();
        assert!(
            state.driver_thread != Some(thread::current().id()),
            "re-entrant waitForEvent on the topology driver thread"
        );
        loop {
            if state.finished {
                return;
            }
            match state.events.get(&event.0) {
                Some(ev) if ev.signaled => return,
                Some(_) => {}
                None => return,
            }
            self.shared.cond.wait(&mut state);
        }
    }

    /// Stop accepting tasks; pending tasks run once with the cancellation
    /// marker, then all waiters unblock.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        let _ = self.shared.tx.send(Directive::Shutdown);
    }

    /// Join the driver thread. Call after `shutdown`.
    pub fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }
}

fn driver_loop(shared: Arc<ExecShared>, rx: Receiver<Directive>, mut topology: TopologyCoordinator) {
    {
        let mut state = shared.state.lock();
        state.driver_thread = Some(thread::current().id());
    }

    let mut deferred: BinaryHeap<Deferred> = BinaryHeap::new();
    let mut seq: u64 = 0;

    'outer: loop {
        // Run everything whose deadline has passed.
        loop {
            let due = deferred
                .peek()
                .map(|d| d.run_at <= Instant::now())
                .unwrap_or(false);
            if !due {
                break;
            }
            let item = deferred.pop().unwrap().item;
            run_task(&shared, item, &mut topology, false);
        }

        let directive = match deferred.peek() {
            Some(next) => {
                let timeout = next.run_at.saturating_duration_since(Instant::now());
                match rx.recv_timeout(timeout) {
                    Ok(d) => d,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break 'outer,
                }
            }
            None => match rx.recv() {
                Ok(d) => d,
                Err(_) => break 'outer,
            },
        };

        match directive {
            Directive::Work(item) => match item.run_at {
                Some(when) if when > Instant::now() => {
                    seq += 1;
                    deferred.push(Deferred {
                        run_at: when,
                        seq,
                        item,
                    });
                }
                _ => run_task(&shared, item, &mut topology, false),
            },
            Directive::Shutdown => break 'outer,
        }
    }

    // Drain: every pending task runs once with the cancellation marker.
    debug!("topology driver draining {} deferred tasks", deferred.len());
    while let Ok(Directive::Work(item)) = rx.try_recv() {
        run_task(&shared, item, &mut topology, true);
    }
    for d in deferred.into_iter() {
        run_task(&shared, d.item, &mut topology, true);
    }

    let mut state = shared.state.lock();
    // Event subscribers that never ran count as complete so waits unblock.
    let pending: Vec<u64> = state
        .events
        .values()
        .flat_map(|ev| ev.subscribers.iter().map(|i| i.id))
        .collect();
    for id in pending {
        state.completed.insert(id);
    }
    state.finished = true;
    shared.cond.notify_all();
}

fn run_task(
    shared: &Arc<ExecShared>,
    item: WorkItem,
    topology: &mut TopologyCoordinator,
    draining: bool,
) {
    let canceled = draining || {
        let state = shared.state.lock();
        state.canceled.contains(&item.id)
    };
    let ctx = TaskContext { canceled };
    (item.task)(topology, &ctx);

    let mut state = shared.state.lock();
    state.completed.insert(item.id);
    state.canceled.remove(&item.id);
    shared.cond.notify_all();
}
