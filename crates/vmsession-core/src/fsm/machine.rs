//! Fsm - ルーティング状態とワーカースレッドの管理
//!
//! # ロックの順序
//! 1. `goto_lock`: serializes route replacement (`goto`, `skew`) with the
//!    worker popping the next node, so a route is never swapped halfway
//!    through a pop.
//! 2. `routing`: current node, target and queue. Held only for short
//!    critical sections; never held while an action runs.
//!
//! Progress recalibration runs under `goto_lock`. Progress observers must
//! not call `goto` or `skew` on the same machine.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::cancel::CancelToken;
use super::graph::Graph;
use super::{lock, router, worker, StateId};
use crate::observability::FsmStatus;
use crate::progress::{FiniteTask, ProgressTask};

pub(crate) struct Routing {
    /// Node the machine is at (or executing).
    pub current: usize,
    pub target: StateId,
    pub queue: VecDeque<usize>,
    /// An action is running right now.
    pub busy: bool,
}

struct Bridge {
    task: FiniteTask,
    reset_message: String,
}

/// State shared between the `Fsm` handle, its worker thread and every
/// `ActionContext`.
pub(crate) struct Shared {
    pub name: String,
    pub graph: Graph,
    pub goto_lock: Mutex<()>,
    pub routing: Mutex<Routing>,
    pub routing_changed: Condvar,
    /// `true` while the worker should stay parked.
    pub paused: Mutex<bool>,
    pub wakeup: Condvar,
    /// Reentrancy guard of the single-step primitive.
    pub inside_handler: AtomicBool,
    pub cancel: CancelToken,
    bridge: Mutex<Option<Bridge>>,
}

impl Shared {
    fn routing(&self) -> MutexGuard<'_, Routing> {
        lock(&self.routing)
    }

    pub fn bound_progress(&self) -> Option<FiniteTask> {
        lock(&self.bridge).as_ref().map(|b| b.task.clone())
    }

    pub fn target_state(&self) -> StateId {
        self.routing().target
    }

    pub fn goto(&self, target: StateId) -> bool {
        let _serial = lock(&self.goto_lock);
        self.route(target)
    }

    /// Replace the queue with the route to `target`. Caller holds `goto_lock`.
    fn route(&self, target: StateId) -> bool {
        debug!(fsm = %self.name, target, "going towards");
        let from = self.routing().current;
        let Some(path) = router::find_path(&self.graph, from, target) else {
            debug!(fsm = %self.name, target, "no route; keeping the current one");
            return false;
        };

        let queue: VecDeque<usize> = path.into_iter().skip(1).collect();
        let steps = queue.iter().filter(|i| self.graph.has_action(**i)).count();
        debug!(
            fsm = %self.name,
            path = ?queue.iter().map(|i| self.graph.id_of(*i)).collect::<Vec<_>>(),
            steps,
            "best path"
        );

        {
            let mut routing = self.routing();
            routing.target = target;
            routing.queue = queue;
        }
        self.routing_changed.notify_all();

        self.recalibrate(steps);
        self.wake();
        true
    }

    pub fn skew(&self, state: StateId) -> bool {
        let _serial = lock(&self.goto_lock);
        let Some(index) = self.graph.index_of(state) else {
            warn!(fsm = %self.name, state, "cannot skew to an unknown state");
            return false;
        };

        let target = {
            let mut routing = self.routing();
            debug!(fsm = %self.name, state, target = routing.target, "skewing");
            routing.current = index;
            routing.queue.clear();
            routing.target
        };
        self.routing_changed.notify_all();

        if target != state {
            self.route(target);
        } else {
            self.recalibrate(0);
        }
        true
    }

    /// Restart the bound tree and size it to the actions about to run.
    fn recalibrate(&self, steps: usize) {
        let Some((task, message)) = lock(&self.bridge)
            .as_ref()
            .map(|b| (b.task.clone(), b.reset_message.clone()))
        else {
            return;
        };
        task.restart(&message);
        task.set_max(steps);
        if steps == 0 {
            task.complete(&message);
        }
    }

    pub fn fail_progress(&self, message: &str, code: i32) {
        if let Some(task) = self.bound_progress() {
            task.fail(message, code);
        }
    }

    pub fn wake(&self) {
        trace!(fsm = %self.name, "waking up worker");
        *lock(&self.paused) = false;
        self.wakeup.notify_all();
    }

    /// Block until woken up. Returns `false` when the machine is stopping.
    pub fn park(&self) -> bool {
        trace!(fsm = %self.name, "parking");
        let mut paused = lock(&self.paused);
        while *paused && !self.cancel.is_cancelled() {
            paused = match self.wakeup.wait(paused) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        *paused = true;
        trace!(fsm = %self.name, "resuming");
        !self.cancel.is_cancelled()
    }

    fn wait_until(&self, timeout: Option<Duration>, done: impl Fn(&Routing) -> bool) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut routing = self.routing();
        loop {
            if done(&routing) {
                return true;
            }
            routing = match deadline {
                None => match self.routing_changed.wait(routing) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                },
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    match self.routing_changed.wait_timeout(routing, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
            };
        }
    }

    pub fn wait_for(&self, state: StateId, timeout: Option<Duration>) -> bool {
        self.wait_until(timeout, |r| !r.busy && self.graph.id_of(r.current) == state)
    }

    pub fn wait_inactive(&self, timeout: Option<Duration>) -> bool {
        self.wait_until(timeout, |r| !r.busy && r.queue.is_empty())
    }
}

/// A self-routing state machine with its own worker thread.
///
/// The machine starts positioned on the root node. Nothing runs until
/// [`start`](Fsm::start) spawns the worker (or [`continue_once`](Fsm::continue_once)
/// is driven by hand). Dropping the machine stops the worker.
pub struct Fsm {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Fsm {
    pub(crate) fn from_graph(name: String, graph: Graph, root: usize) -> Self {
        let target = graph.id_of(root);
        let shared = Shared {
            name,
            graph,
            goto_lock: Mutex::new(()),
            routing: Mutex::new(Routing {
                current: root,
                target,
                queue: VecDeque::new(),
                busy: false,
            }),
            routing_changed: Condvar::new(),
            paused: Mutex::new(true),
            wakeup: Condvar::new(),
            inside_handler: AtomicBool::new(false),
            cancel: CancelToken::new(),
            bridge: Mutex::new(None),
        };
        Self {
            shared: Arc::new(shared),
            worker: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Spawn the worker thread. Calling it again while running is a no-op.
    ///
    /// A worker that was stopped from its own thread is joined first, so
    /// at most one worker runs per machine.
    pub fn start(&self) -> std::io::Result<()> {
        let mut worker = lock(&self.worker);
        if let Some(handle) = worker.as_ref() {
            if !self.shared.cancel.is_cancelled() && !handle.is_finished() {
                return Ok(());
            }
            if handle.thread().id() == std::thread::current().id() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WouldBlock,
                    "worker is still stopping",
                ));
            }
            if let Some(old) = worker.take() {
                if old.join().is_err() {
                    warn!(fsm = %self.shared.name, "worker thread panicked");
                }
            }
        }

        self.shared.cancel.reset();
        *lock(&self.shared.paused) = true;

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || worker::run(shared))?;
        *worker = Some(handle);
        debug!(fsm = %self.shared.name, "worker started");
        Ok(())
    }

    /// Ask the worker to stop and wait for it.
    ///
    /// A running action keeps running until it reaches a yield point
    /// (`checkpoint`, `sleep`) or returns. Called from the worker thread
    /// itself, this only requests the stop; the thread is joined by the
    /// next `start` or `stop` from another thread.
    pub fn stop(&self) {
        let mut worker = lock(&self.worker);
        let Some(handle) = worker.as_ref() else {
            return;
        };
        let own_thread = handle.thread().id() == std::thread::current().id();
        self.shared.cancel.cancel();
        self.shared.wake();
        if own_thread {
            return;
        }

        let Some(handle) = worker.take() else {
            return;
        };
        drop(worker);
        if handle.join().is_err() {
            warn!(fsm = %self.shared.name, "worker thread panicked");
        }
        debug!(fsm = %self.shared.name, "worker stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.shared.cancel.is_cancelled()
            && lock(&self.worker)
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }

    /// Route towards `target` and wake the worker.
    ///
    /// Returns `false` and keeps the current route when `target` is
    /// unknown or unreachable.
    pub fn goto(&self, target: StateId) -> bool {
        self.shared.goto(target)
    }

    /// Declare that the machine actually is at `state` (no action runs),
    /// then route again towards the current target.
    pub fn skew(&self, state: StateId) -> bool {
        self.shared.skew(state)
    }

    /// Run the next queued action on the calling thread.
    ///
    /// Returns `false` if nothing was queued, an action is already
    /// running, or the action failed. After a successful step the worker
    /// is woken if more of the route is queued.
    pub fn continue_once(&self) -> bool {
        let ran = matches!(worker::step(&self.shared), worker::Step::Ran);
        if ran && !self.shared.routing().queue.is_empty() {
            self.shared.wake();
        }
        ran
    }

    /// Bind a progress tree; every successful route restarts it with
    /// `reset_message` and resizes it to the number of actions to run.
    pub fn use_progress(&self, task: &FiniteTask, reset_message: &str) {
        *lock(&self.shared.bridge) = Some(Bridge {
            task: task.clone(),
            reset_message: reset_message.to_string(),
        });
    }

    pub fn progress(&self) -> Option<FiniteTask> {
        self.shared.bound_progress()
    }

    /// Block until the machine is at `state` and idle there.
    ///
    /// `None` waits forever. Returns `false` on timeout.
    pub fn wait_for(&self, state: StateId, timeout: Option<Duration>) -> bool {
        self.shared.wait_for(state, timeout)
    }

    /// Block until the queue is drained and no action runs.
    pub fn wait_inactive(&self, timeout: Option<Duration>) -> bool {
        self.shared.wait_inactive(timeout)
    }

    pub async fn wait_for_async(&self, state: StateId, timeout: Option<Duration>) -> bool {
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || shared.wait_for(state, timeout))
            .await
            .unwrap_or(false)
    }

    pub async fn wait_inactive_async(&self, timeout: Option<Duration>) -> bool {
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || shared.wait_inactive(timeout))
            .await
            .unwrap_or(false)
    }

    /// An action is running or queued.
    pub fn is_active(&self) -> bool {
        let routing = self.shared.routing();
        routing.busy || !routing.queue.is_empty()
    }

    pub fn current_state(&self) -> StateId {
        self.shared.graph.id_of(self.shared.routing().current)
    }

    pub fn target_state(&self) -> StateId {
        self.shared.target_state()
    }

    /// Ids still queued, state markers included.
    pub fn pending_path(&self) -> Vec<StateId> {
        let routing = self.shared.routing();
        routing
            .queue
            .iter()
            .map(|i| self.shared.graph.id_of(*i))
            .collect()
    }

    /// Ids still queued that carry an action.
    pub fn pending_actions(&self) -> Vec<StateId> {
        let routing = self.shared.routing();
        routing
            .queue
            .iter()
            .filter(|i| self.shared.graph.has_action(**i))
            .map(|i| self.shared.graph.id_of(*i))
            .collect()
    }

    /// Route `goto(target)` would take from the current node, without
    /// changing anything. The current node is included.
    pub fn plan(&self, target: StateId) -> Option<Vec<StateId>> {
        let from = self.shared.routing().current;
        router::find_path(&self.shared.graph, from, target)
            .map(|path| path.iter().map(|i| self.shared.graph.id_of(*i)).collect())
    }

    pub fn status(&self) -> FsmStatus {
        let (current, target, pending, active) = {
            let routing = self.shared.routing();
            (
                self.shared.graph.id_of(routing.current),
                routing.target,
                routing
                    .queue
                    .iter()
                    .map(|i| self.shared.graph.id_of(*i))
                    .collect(),
                routing.busy || !routing.queue.is_empty(),
            )
        };
        FsmStatus {
            name: self.shared.name.clone(),
            current,
            target,
            pending,
            active,
            running: self.is_running(),
            progress: self.progress().map(|task| task.progress()),
        }
    }
}

impl Drop for Fsm {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Fsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fsm")
            .field("name", &self.shared.name)
            .field("current", &self.current_state())
            .field("target", &self.target_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::{ActionContext, ActionError, FsmBuilder};
    use std::sync::atomic::Ordering;
    use std::sync::mpsc;
    use std::sync::{Mutex as StdMutex, OnceLock, Weak};

    const WAIT: Option<Duration> = Some(Duration::from_secs(5));

    type Log = Arc<StdMutex<Vec<StateId>>>;

    fn recording(log: &Log) -> impl Fn(&ActionContext) -> Result<(), ActionError> + use<> {
        let log = Arc::clone(log);
        move |ctx: &ActionContext| {
            log.lock().unwrap().push(ctx.state());
            ctx.done(&format!("ran {}", ctx.state()));
            Ok(())
        }
    }

    /// 1 -> 2 -> 3(H3), with 3 -> 1 so the machine can come back.
    fn scenario_a(log: &Log) -> Fsm {
        FsmBuilder::new()
            .name("scenario-a")
            .state(1, &[2])
            .state(2, &[3])
            .action(3, recording(log), &[1])
            .build(1)
            .unwrap()
    }

    #[test]
    fn goto_queues_markers_but_runs_only_actions() {
        let log = Log::default();
        let fsm = scenario_a(&log);

        assert!(fsm.goto(3));
        assert_eq!(fsm.pending_path(), vec![2, 3]);
        assert_eq!(fsm.pending_actions(), vec![3]);
        assert_eq!(fsm.target_state(), 3);
        assert!(fsm.is_active());

        assert!(fsm.continue_once());
        assert_eq!(*log.lock().unwrap(), vec![3]);
        assert_eq!(fsm.current_state(), 3);
        assert!(!fsm.is_active());
        assert!(!fsm.continue_once());
    }

    #[test]
    fn unreachable_goto_keeps_route_and_target() {
        let log = Log::default();
        let fsm = FsmBuilder::new()
            .state(1, &[2])
            .action(2, recording(&log), &[])
            .state(9, &[])
            .build(1)
            .unwrap();

        assert!(fsm.goto(2));
        assert!(!fsm.goto(9));
        assert!(!fsm.goto(42));
        assert_eq!(fsm.target_state(), 2);
        assert_eq!(fsm.pending_path(), vec![2]);
    }

    #[test]
    fn goto_current_state_is_an_empty_route() {
        let log = Log::default();
        let fsm = scenario_a(&log);
        assert!(fsm.goto(1));
        assert!(fsm.pending_path().is_empty());
        assert_eq!(fsm.plan(3), Some(vec![1, 2, 3]));
    }

    #[test]
    fn route_recalibrates_bound_progress() {
        let log = Log::default();
        let fsm = scenario_a(&log);
        let root = FiniteTask::new();
        let resets = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&resets);
        root.on_started(move |msg| sink.lock().unwrap().push(msg.to_string()));
        fsm.use_progress(&root, "preparing");

        assert!(fsm.goto(3));
        assert_eq!(root.max(), 1);
        assert_eq!(root.progress(), 0.0);
        assert_eq!(*resets.lock().unwrap(), vec!["preparing".to_string()]);

        assert!(fsm.continue_once());
        assert!(root.is_completed());
    }

    #[test]
    fn zero_step_route_completes_bound_progress() {
        let log = Log::default();
        let fsm = FsmBuilder::new()
            .state(1, &[2])
            .state(2, &[])
            .action(3, recording(&log), &[])
            .build(1)
            .unwrap();
        let root = FiniteTask::new();
        fsm.use_progress(&root, "nothing to do");

        assert!(fsm.goto(2));
        assert!(root.is_completed());
        assert_eq!(root.progress(), 1.0);
    }

    #[test]
    fn failing_action_reports_once_and_machine_recovers() {
        let log = Log::default();
        let fsm = FsmBuilder::new()
            .name("scenario-d")
            .state(1, &[10, 20])
            .action(
                10,
                |_: &ActionContext| Err(ActionError::failed("disk is on fire", -3)),
                &[1],
            )
            .action(20, recording(&log), &[1])
            .build(1)
            .unwrap();
        let root = FiniteTask::new();
        let errors = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        root.on_error(move |msg, code| sink.lock().unwrap().push((msg.to_string(), code)));
        fsm.use_progress(&root, "reset");

        assert!(fsm.goto(10));
        assert!(!fsm.continue_once());
        assert_eq!(
            *errors.lock().unwrap(),
            vec![("disk is on fire".to_string(), -3)]
        );

        // The guard was released: a fresh route runs normally.
        assert!(fsm.goto(20));
        assert!(fsm.continue_once());
        assert_eq!(*log.lock().unwrap(), vec![20]);
        assert!(root.is_completed());
    }

    #[test]
    fn panicking_action_is_reported_as_failure() {
        let fsm = FsmBuilder::new()
            .state(1, &[2])
            .action(2, |_: &ActionContext| -> Result<(), ActionError> { panic!("boom") }, &[1])
            .build(1)
            .unwrap();
        let root = FiniteTask::new();
        let codes = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&codes);
        root.on_error(move |msg, code| sink.lock().unwrap().push((msg.to_string(), code)));
        fsm.use_progress(&root, "reset");

        assert!(fsm.goto(2));
        assert!(!fsm.continue_once());
        assert_eq!(*codes.lock().unwrap(), vec![("boom".to_string(), -1)]);
        assert!(!fsm.is_active());
    }

    #[test]
    fn skew_repositions_and_routes_to_active_target() {
        let log = Log::default();
        let fsm = FsmBuilder::new()
            .state(1, &[100])
            .action(100, recording(&log), &[2])
            .state(2, &[101])
            .action(101, recording(&log), &[3])
            .state(3, &[])
            .build(1)
            .unwrap();

        assert!(fsm.goto(3));
        assert_eq!(fsm.pending_actions(), vec![100, 101]);

        // Out-of-band information: we already are at 2.
        assert!(fsm.skew(2));
        assert_eq!(fsm.current_state(), 2);
        assert_eq!(fsm.pending_path(), vec![101, 3]);

        // Skewing onto the target leaves nothing to do.
        assert!(fsm.skew(3));
        assert!(fsm.pending_path().is_empty());
        assert!(!fsm.skew(77));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn skew_onto_target_completes_bound_progress() {
        let log = Log::default();
        let fsm = FsmBuilder::new()
            .state(1, &[100])
            .action(100, recording(&log), &[2])
            .state(2, &[])
            .build(1)
            .unwrap();
        let root = FiniteTask::new();
        fsm.use_progress(&root, "reset");

        assert!(fsm.goto(2));
        assert!(!root.is_completed());
        assert!(fsm.skew(2));
        assert!(root.is_completed());
        assert!(!fsm.is_active());
    }

    #[test]
    fn worker_drains_route_and_parks() {
        let log = Log::default();
        let fsm = FsmBuilder::new()
            .name("drain")
            .state(1, &[100])
            .action(100, recording(&log), &[101])
            .action(101, recording(&log), &[2])
            .state(2, &[102])
            .action(102, recording(&log), &[1])
            .build(1)
            .unwrap();
        fsm.start().unwrap();

        assert!(fsm.goto(2));
        assert!(fsm.wait_for(2, WAIT));
        assert_eq!(*log.lock().unwrap(), vec![100, 101]);

        // Parked worker wakes up for the next route.
        assert!(fsm.goto(1));
        assert!(fsm.wait_for(1, WAIT));
        assert!(fsm.wait_inactive(WAIT));
        assert_eq!(*log.lock().unwrap(), vec![100, 101, 102]);
        assert!(fsm.is_running());

        fsm.stop();
        assert!(!fsm.is_running());
    }

    #[test]
    fn new_route_replaces_remaining_queue() {
        // 1 -> 10 -> 11 -> 12 -> 2, and 10 -> 20 -> 3.
        let log = Log::default();
        let gate = Arc::new((StdMutex::new(false), Condvar::new()));
        let entered = Arc::new((StdMutex::new(false), Condvar::new()));

        let first = {
            let log = Arc::clone(&log);
            let gate = Arc::clone(&gate);
            let entered = Arc::clone(&entered);
            move |ctx: &ActionContext| {
                log.lock().unwrap().push(ctx.state());
                {
                    let (flag, cv) = &*entered;
                    *flag.lock().unwrap() = true;
                    cv.notify_all();
                }
                let (open, cv) = &*gate;
                let mut open = open.lock().unwrap();
                while !*open {
                    open = cv.wait(open).unwrap();
                }
                Ok(())
            }
        };

        let fsm = FsmBuilder::new()
            .name("scenario-c")
            .state(1, &[10])
            .action(10, first, &[11, 20])
            .action(11, recording(&log), &[12])
            .action(12, recording(&log), &[2])
            .state(2, &[])
            .action(20, recording(&log), &[3])
            .state(3, &[])
            .build(1)
            .unwrap();
        fsm.start().unwrap();

        assert!(fsm.goto(2));
        {
            let (flag, cv) = &*entered;
            let mut flag = flag.lock().unwrap();
            while !*flag {
                flag = cv.wait(flag).unwrap();
            }
        }

        // Action 10 is running; re-route before 11 starts.
        assert!(fsm.goto(3));
        {
            let (open, cv) = &*gate;
            *open.lock().unwrap() = true;
            cv.notify_all();
        }

        assert!(fsm.wait_for(3, WAIT));
        assert_eq!(*log.lock().unwrap(), vec![10, 20]);
    }

    #[test]
    fn stop_interrupts_sleeping_action() {
        let fsm = FsmBuilder::new()
            .state(1, &[2])
            .action(
                2,
                |ctx: &ActionContext| {
                    ctx.sleep(Duration::from_secs(60))?;
                    Ok(())
                },
                &[],
            )
            .build(1)
            .unwrap();
        fsm.start().unwrap();
        assert!(fsm.goto(2));

        // Give the worker a moment to enter the action.
        std::thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        fsm.stop();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!fsm.is_running());
    }

    #[test]
    fn action_may_reroute_from_inside() {
        let log = Log::default();
        let fsm = FsmBuilder::new()
            .state(1, &[100])
            .action(
                100,
                |ctx: &ActionContext| {
                    ctx.goto(4);
                    Ok(())
                },
                &[2, 4],
            )
            .action(101, recording(&log), &[3])
            .state(2, &[101])
            .state(3, &[])
            .state(4, &[])
            .build(1)
            .unwrap();

        assert!(fsm.goto(3));
        assert!(fsm.continue_once());
        assert_eq!(fsm.target_state(), 4);
        assert_eq!(fsm.pending_path(), vec![4]);
        assert!(fsm.continue_once());
        assert_eq!(fsm.current_state(), 4);
        assert!(log.lock().unwrap().is_empty());
    }

    /// Action that reports it started, then blocks until released.
    fn blocking(
        log: &Log,
        entered: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
    ) -> impl Fn(&ActionContext) -> Result<(), ActionError> + use<> {
        let log = Arc::clone(log);
        let release = StdMutex::new(release);
        move |ctx: &ActionContext| {
            log.lock().unwrap().push(ctx.state());
            let _ = entered.send(());
            let _ = release.lock().unwrap().recv_timeout(Duration::from_secs(5));
            ctx.done("released");
            Ok(())
        }
    }

    /// 1 -> 10 (blocking) -> 11 -> 2
    fn gated(log: &Log) -> (Arc<Fsm>, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let fsm = FsmBuilder::new()
            .name("gated")
            .state(1, &[10])
            .action(10, blocking(log, entered_tx, release_rx), &[11])
            .action(11, recording(log), &[2])
            .state(2, &[])
            .build(1)
            .unwrap();
        (Arc::new(fsm), entered_rx, release_tx)
    }

    #[test]
    fn continue_once_is_not_reentrant() {
        let log = Log::default();
        let (fsm, entered, release) = gated(&log);
        assert!(fsm.goto(2));

        let runner = {
            let fsm = Arc::clone(&fsm);
            std::thread::spawn(move || fsm.continue_once())
        };
        entered.recv_timeout(Duration::from_secs(5)).unwrap();

        // Action 10 is still running on the other thread.
        assert!(!fsm.continue_once());
        assert_eq!(*log.lock().unwrap(), vec![10]);

        release.send(()).unwrap();
        assert!(runner.join().unwrap());
        assert!(fsm.continue_once());
        assert_eq!(*log.lock().unwrap(), vec![10, 11]);

        // Only the trailing marker is left.
        assert!(fsm.continue_once());
        assert_eq!(fsm.current_state(), 2);
        assert!(!fsm.continue_once());
    }

    #[test]
    fn worker_resumes_after_an_outside_step() {
        let log = Log::default();
        let (fsm, entered, release) = gated(&log);
        assert!(fsm.goto(2));

        let runner = {
            let fsm = Arc::clone(&fsm);
            std::thread::spawn(move || fsm.continue_once())
        };
        entered.recv_timeout(Duration::from_secs(5)).unwrap();

        // The worker finds the step guard taken and parks.
        fsm.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));

        release.send(()).unwrap();
        assert!(runner.join().unwrap());
        assert!(fsm.wait_for(2, WAIT));
        assert_eq!(*log.lock().unwrap(), vec![10, 11]);
    }

    type Meeting = Arc<(StdMutex<usize>, Condvar)>;

    /// Succeeds only if another action joins it within five seconds.
    fn rendezvous(meeting: &Meeting) -> impl Fn(&ActionContext) -> Result<(), ActionError> + use<> {
        let meeting = Arc::clone(meeting);
        move |ctx: &ActionContext| {
            let (count, cv) = &*meeting;
            let mut count = count.lock().unwrap();
            *count += 1;
            cv.notify_all();
            let (_count, wait) = cv
                .wait_timeout_while(count, Duration::from_secs(5), |c| *c < 2)
                .unwrap();
            if wait.timed_out() {
                return Err(ActionError::failed("nobody showed up", -2));
            }
            ctx.done("met");
            Ok(())
        }
    }

    #[test]
    fn separate_machines_run_in_parallel() {
        let meeting = Meeting::default();
        let machines: Vec<(Fsm, FiniteTask)> = ["left", "right"]
            .into_iter()
            .map(|name| {
                let fsm = FsmBuilder::new()
                    .name(name)
                    .state(1, &[2])
                    .action(2, rendezvous(&meeting), &[])
                    .build(1)
                    .unwrap();
                let root = FiniteTask::new();
                fsm.use_progress(&root, "meeting");
                fsm.start().unwrap();
                (fsm, root)
            })
            .collect();

        for (fsm, _) in &machines {
            assert!(fsm.goto(2));
        }
        for (fsm, root) in &machines {
            assert!(fsm.wait_inactive(WAIT));
            assert!(root.is_completed(), "{} did not meet", fsm.name());
        }
    }

    #[test]
    fn restart_after_stopping_from_inside_joins_the_old_worker() {
        let slot: Arc<OnceLock<Weak<Fsm>>> = Arc::default();
        let exited = Arc::new(AtomicBool::new(false));
        let (stopped_tx, stopped_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let action = {
            let slot = Arc::clone(&slot);
            let exited = Arc::clone(&exited);
            let release = StdMutex::new(release_rx);
            move |ctx: &ActionContext| {
                if let Some(fsm) = slot.get().and_then(Weak::upgrade) {
                    fsm.stop();
                }
                let _ = stopped_tx.send(());
                let _ = release.lock().unwrap().recv_timeout(Duration::from_secs(5));
                exited.store(true, Ordering::SeqCst);
                ctx.checkpoint()
            }
        };
        let fsm = Arc::new(
            FsmBuilder::new()
                .name("self-stop")
                .state(1, &[2])
                .action(2, action, &[1])
                .build(1)
                .unwrap(),
        );
        slot.set(Arc::downgrade(&fsm)).unwrap();
        fsm.start().unwrap();
        assert!(fsm.goto(2));

        stopped_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!fsm.is_running());

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let _ = release_tx.send(());
        });
        fsm.start().unwrap();
        assert!(exited.load(Ordering::SeqCst));
        assert!(fsm.is_running());
        releaser.join().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_waits_observe_the_worker() {
        let log = Log::default();
        let fsm = scenario_a(&log);
        fsm.start().unwrap();

        assert!(fsm.goto(3));
        assert!(fsm.wait_for_async(3, WAIT).await);
        assert!(fsm.wait_inactive_async(WAIT).await);
        assert!(!fsm.wait_for_async(2, Some(Duration::from_millis(20))).await);

        let status = fsm.status();
        assert_eq!(status.current, 3);
        assert!(!status.active);
        assert!(status.running);
    }
}
