//! Cooperative scheduling primitive.
//!
//! Everything in the grid runs on one thread. Timers (load timeout, retry
//! backoff, the watchdog tick) and frame polls (anchor stabilization) are
//! expressed against [`Scheduler`], so the same state machines run under a
//! glib main loop or under the virtual clock of [`ManualScheduler`].

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::trace;

pub type TaskId = u64;

/// Return value of a repeating task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFlow {
    Continue,
    Break,
}

pub trait Scheduler {
    fn now(&self) -> Instant;

    /// Runs `task` once after `delay`.
    fn timeout(&self, delay: Duration, task: Box<dyn FnOnce()>) -> TaskId;

    /// Runs `task` every `period` until it returns [`TaskFlow::Break`] or is cancelled.
    fn interval(&self, period: Duration, task: Box<dyn FnMut() -> TaskFlow>) -> TaskId;

    /// Runs `task` on the next frame.
    fn next_frame(&self, task: Box<dyn FnOnce()>) -> TaskId;

    /// Cancelling an unknown or already-fired task is a no-op.
    fn cancel(&self, id: TaskId);
}

/// Default frame interval (~60fps).
pub const FRAME_INTERVAL: Duration = Duration::from_millis(16);

enum TimerTask {
    Once(Box<dyn FnOnce()>),
    Repeat {
        period: Duration,
        task: Box<dyn FnMut() -> TaskFlow>,
    },
}

struct ManualState {
    epoch: Instant,
    elapsed: Duration,
    next_id: TaskId,
    timers: BTreeMap<(Duration, TaskId), TimerTask>,
    due_by_id: HashMap<TaskId, Duration>,
    frame_queue: Vec<(TaskId, Box<dyn FnOnce()>)>,
    current_frame: VecDeque<(TaskId, Box<dyn FnOnce()>)>,
    running: Option<TaskId>,
    running_cancelled: bool,
    frames: u64,
}

/// Deterministic scheduler with a virtual clock.
///
/// Nothing runs until the owner calls [`advance`](Self::advance) or
/// [`frame`](Self::frame). Timers fire in deadline order (ties in registration
/// order). Frame tasks queued while a frame is running wait for the next one.
pub struct ManualScheduler {
    state: RefCell<ManualState>,
    frame_interval: Duration,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::with_frame_interval(FRAME_INTERVAL)
    }

    pub fn with_frame_interval(frame_interval: Duration) -> Self {
        Self {
            state: RefCell::new(ManualState {
                epoch: Instant::now(),
                elapsed: Duration::ZERO,
                next_id: 1,
                timers: BTreeMap::new(),
                due_by_id: HashMap::new(),
                frame_queue: Vec::new(),
                current_frame: VecDeque::new(),
                running: None,
                running_cancelled: false,
                frames: 0,
            }),
            frame_interval,
        }
    }

    /// Time since the scheduler was created.
    pub fn elapsed(&self) -> Duration {
        self.state.borrow().elapsed
    }

    pub fn frames(&self) -> u64 {
        self.state.borrow().frames
    }

    /// Number of timers and frame tasks still waiting to run.
    pub fn pending_tasks(&self) -> usize {
        let state = self.state.borrow();
        state.timers.len() + state.frame_queue.len() + state.current_frame.len()
    }

    pub fn pending_timers(&self) -> usize {
        self.state.borrow().timers.len()
    }

    /// Moves the clock forward, firing every timer that falls due on the way.
    pub fn advance(&self, by: Duration) {
        let target = self.state.borrow().elapsed + by;
        loop {
            let (key, task) = {
                let mut state = self.state.borrow_mut();
                let Some((key, task)) = state.timers.pop_first() else {
                    break;
                };
                if key.0 > target {
                    state.timers.insert(key, task);
                    break;
                }
                state.due_by_id.remove(&key.1);
                state.elapsed = state.elapsed.max(key.0);
                state.running = Some(key.1);
                state.running_cancelled = false;
                (key, task)
            };

            match task {
                TimerTask::Once(task) => task(),
                TimerTask::Repeat { period, mut task } => {
                    let flow = task();
                    let mut state = self.state.borrow_mut();
                    if flow == TaskFlow::Continue && !state.running_cancelled {
                        let due = key.0 + period.max(Duration::from_millis(1));
                        state.timers.insert((due, key.1), TimerTask::Repeat { period, task });
                        state.due_by_id.insert(key.1, due);
                    }
                }
            }
            self.state.borrow_mut().running = None;
        }
        let mut state = self.state.borrow_mut();
        state.elapsed = state.elapsed.max(target);
    }

    /// Runs one frame: advances the clock by the frame interval, then runs the
    /// frame tasks that were queued before the frame started.
    pub fn frame(&self) {
        {
            let mut state = self.state.borrow_mut();
            let queued = std::mem::take(&mut state.frame_queue);
            state.current_frame.extend(queued);
            state.frames += 1;
        }
        self.advance(self.frame_interval);
        loop {
            let next = self.state.borrow_mut().current_frame.pop_front();
            let Some((id, task)) = next else {
                break;
            };
            trace!(task = id, "running frame task");
            task();
        }
    }

    pub fn run_frames(&self, count: usize) {
        for _ in 0..count {
            self.frame();
        }
    }

    fn allocate_id(state: &mut ManualState) -> TaskId {
        let id = state.next_id;
        state.next_id += 1;
        id
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> Instant {
        let state = self.state.borrow();
        state.epoch + state.elapsed
    }

    fn timeout(&self, delay: Duration, task: Box<dyn FnOnce()>) -> TaskId {
        let mut state = self.state.borrow_mut();
        let id = Self::allocate_id(&mut state);
        let due = state.elapsed + delay;
        state.timers.insert((due, id), TimerTask::Once(task));
        state.due_by_id.insert(id, due);
        id
    }

    fn interval(&self, period: Duration, task: Box<dyn FnMut() -> TaskFlow>) -> TaskId {
        let mut state = self.state.borrow_mut();
        let id = Self::allocate_id(&mut state);
        let due = state.elapsed + period;
        state
            .timers
            .insert((due, id), TimerTask::Repeat { period, task });
        state.due_by_id.insert(id, due);
        id
    }

    fn next_frame(&self, task: Box<dyn FnOnce()>) -> TaskId {
        let mut state = self.state.borrow_mut();
        let id = Self::allocate_id(&mut state);
        state.frame_queue.push((id, task));
        id
    }

    fn cancel(&self, id: TaskId) {
        let mut state = self.state.borrow_mut();
        if state.running == Some(id) {
            state.running_cancelled = true;
            return;
        }
        if let Some(due) = state.due_by_id.remove(&id) {
            state.timers.remove(&(due, id));
            return;
        }
        state.frame_queue.retain(|(task_id, _)| *task_id != id);
        state.current_frame.retain(|(task_id, _)| *task_id != id);
    }
}
