//! Shared stall watchdog.
//!
//! One interval task serves every registered tile. The task is started when
//! the first tile registers and cancelled when the last one leaves, so the
//! number of timers never depends on the grid size.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Instant;

use tracing::{debug, warn};

use crate::config::WatchdogConfig;
use crate::models::TileId;
use crate::scheduler::{Scheduler, TaskFlow, TaskId};

/// Playback clock reading taken on a watchdog tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackSample {
    pub current_time: f64,
    pub paused: bool,
    pub enough_data: bool,
}

pub type SampleFn = Box<dyn Fn() -> Option<PlaybackSample>>;
pub type RecoverFn = Box<dyn Fn()>;

struct WatchEntry {
    sample: Rc<SampleFn>,
    recover: Rc<RecoverFn>,
    baseline: Option<f64>,
    stalled_ticks: u32,
    last_logged: Option<Instant>,
    recoveries: u32,
}

struct WatchdogState {
    entries: HashMap<TileId, WatchEntry>,
    task: Option<TaskId>,
    ticks: u64,
}

/// Stall watchdog shared by all tiles of one grid. Clones share the registry.
#[derive(Clone)]
pub struct StallWatchdog {
    config: WatchdogConfig,
    scheduler: Rc<dyn Scheduler>,
    state: Rc<RefCell<WatchdogState>>,
}

impl StallWatchdog {
    pub fn new(config: WatchdogConfig, scheduler: Rc<dyn Scheduler>) -> Self {
        Self {
            config,
            scheduler,
            state: Rc::new(RefCell::new(WatchdogState {
                entries: HashMap::new(),
                task: None,
                ticks: 0,
            })),
        }
    }

    /// Registers (or replaces) the entry for `id`.
    pub fn register(&self, id: TileId, sample: SampleFn, recover: RecoverFn) {
        let start = {
            let mut state = self.state.borrow_mut();
            state.entries.insert(
                id,
                WatchEntry {
                    sample: Rc::new(sample),
                    recover: Rc::new(recover),
                    baseline: None,
                    stalled_ticks: 0,
                    last_logged: None,
                    recoveries: 0,
                },
            );
            state.task.is_none()
        };
        if start {
            self.start_timer();
        }
    }

    pub fn unregister(&self, id: &TileId) {
        let task = {
            let mut state = self.state.borrow_mut();
            if state.entries.remove(id).is_none() || !state.entries.is_empty() {
                return;
            }
            state.task.take()
        };
        if let Some(task) = task {
            debug!("Stopping stall watchdog, no tiles left");
            self.scheduler.cancel(task);
        }
    }

    pub fn is_registered(&self, id: &TileId) -> bool {
        self.state.borrow().entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.state.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().entries.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.state.borrow().task.is_some()
    }

    pub fn ticks(&self) -> u64 {
        self.state.borrow().ticks
    }

    /// Recoveries issued for `id` since it registered.
    pub fn recoveries(&self, id: &TileId) -> u32 {
        self.state
            .borrow()
            .entries
            .get(id)
            .map_or(0, |p| p.recoveries)
    }

    fn start_timer(&self) {
        debug!(interval_ms = self.config.interval.as_millis() as u64, "Starting stall watchdog");
        let weak: Weak<RefCell<WatchdogState>> = Rc::downgrade(&self.state);
        let config = self.config.clone();
        let scheduler = Rc::downgrade(&self.scheduler);
        let task = self.scheduler.interval(
            self.config.interval,
            Box::new(move || {
                let (Some(state), Some(scheduler)) = (weak.upgrade(), scheduler.upgrade()) else {
                    return TaskFlow::Break;
                };
                if state.borrow().entries.is_empty() {
                    state.borrow_mut().task = None;
                    return TaskFlow::Break;
                }
                run_tick(&state, &config, scheduler.now());
                TaskFlow::Continue
            }),
        );
        self.state.borrow_mut().task = Some(task);
    }

    /// Runs one check immediately, outside the timer.
    pub fn tick_now(&self) {
        run_tick(&self.state, &self.config, self.scheduler.now());
    }
}

fn run_tick(state: &Rc<RefCell<WatchdogState>>, config: &WatchdogConfig, now: Instant) {
    // Sampled without holding the registry borrow; a sampler may reach back
    // into the grid.
    let entries: Vec<(TileId, Rc<SampleFn>)> = {
        let mut state = state.borrow_mut();
        state.ticks += 1;
        state
            .entries
            .iter()
            .map(|(id, p)| (id.clone(), p.sample.clone()))
            .collect()
    };
    let samples: Vec<(TileId, Option<PlaybackSample>)> =
        entries.into_iter().map(|(id, sample)| (id, sample())).collect();

    let mut recoveries = Vec::new();
    {
        let mut state = state.borrow_mut();
        for (id, sample) in samples {
            let Some(entry) = state.entries.get_mut(&id) else {
                continue;
            };
            let Some(sample) = sample else {
                entry.baseline = None;
                entry.stalled_ticks = 0;
                continue;
            };
            if sample.paused || !sample.enough_data {
                entry.baseline = Some(sample.current_time);
                entry.stalled_ticks = 0;
                continue;
            }

            let advanced = match entry.baseline {
                Some(previous) => (sample.current_time - previous).abs() >= config.min_advance,
                // First observation only sets the baseline.
                None => true,
            };
            entry.baseline = Some(sample.current_time);
            if advanced {
                entry.stalled_ticks = 0;
                continue;
            }

            entry.stalled_ticks += 1;
            if entry.stalled_ticks < config.ticks_to_stall {
                continue;
            }

            entry.stalled_ticks = 0;
            entry.recoveries += 1;
            let should_log = entry
                .last_logged
                .map_or(true, |at| now.duration_since(at) >= config.log_interval);
            if should_log {
                entry.last_logged = Some(now);
                warn!(
                    tile = %id,
                    position = sample.current_time,
                    recoveries = entry.recoveries,
                    "Playback stalled, recovering"
                );
            }
            recoveries.push(entry.recover.clone());
        }
    }

    for recover in recoveries {
        recover();
    }
}
