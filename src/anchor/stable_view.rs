//! Scroll compensation across layout-affecting changes.
//!
//! [`StableViewAnchor::begin_change`] snapshots the anchor before a mutation.
//! After [`ChangeHandle::finalize`] the anchor is re-measured once per frame
//! until it has held still for `stabilize_frames` frames, then `settle_frames`
//! more frames pass and the scroll offset is shifted by the anchor's movement.
//!
//! Only one compensation is pending at a time. Starting a new change drops
//! the previous one, so overlapping changes never scroll twice.

use std::cell::RefCell;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::time::Instant;

use tracing::{debug, trace};

use super::measure::{
    measure, resolve_target, AnchorGeometry, AnchorMeasurement, AnchorStrategy, AnchorTarget,
    SelectionSource,
};
use crate::config::AnchorConfig;
use crate::layout::LayoutTrigger;
use crate::scheduler::{Scheduler, TaskId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeOptions {
    /// Overrides the configured strategy for this change.
    pub strategy: Option<AnchorStrategy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusMode {
    /// Put the anchor's center in the middle of the viewport.
    Center,
    /// Scroll the minimum needed to reveal the anchor inside the scroll padding.
    Nudge,
}

/// Counters for diagnostics and the benchmark report.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AnchorStats {
    pub started: u64,
    pub applied: u64,
    pub abandoned: u64,
    pub superseded: u64,
    pub skipped: u64,
    pub last_adjustment: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    AwaitingFinalize,
    Stabilizing { stable_frames: u32 },
    Settling { remaining: u32 },
}

#[derive(Debug, Clone)]
struct PendingCompensation {
    token: u64,
    trigger: LayoutTrigger,
    target: AnchorTarget,
    before: AnchorMeasurement,
    latest: Option<AnchorMeasurement>,
    phase: Phase,
    missing_frames: u32,
    deadline: Option<Instant>,
}

struct AnchorState {
    next_token: u64,
    pending: Option<PendingCompensation>,
    frame_task: Option<TaskId>,
    stats: AnchorStats,
}

struct AnchorInner {
    config: AnchorConfig,
    scheduler: Rc<dyn Scheduler>,
    geometry: Rc<dyn AnchorGeometry>,
    selection: Rc<dyn SelectionSource>,
    state: RefCell<AnchorState>,
}

/// Returned by [`StableViewAnchor::begin_change`]. Call
/// [`finalize`](Self::finalize) once the mutation has been applied.
#[must_use = "a change that is never finalized is never compensated"]
pub struct ChangeHandle {
    token: u64,
    scheduled: bool,
    anchor: Weak<AnchorInner>,
}

impl ChangeHandle {
    pub fn token(&self) -> u64 {
        self.token
    }

    /// False when the anchor was missing or off-screen at snapshot time.
    pub fn is_scheduled(&self) -> bool {
        self.scheduled
    }

    pub fn finalize(self) {
        if !self.scheduled {
            return;
        }
        if let Some(inner) = self.anchor.upgrade() {
            inner.finalize(self.token);
        }
    }
}

/// Keeps the user's focal tile in place while the layout moves under it.
#[derive(Clone)]
pub struct StableViewAnchor {
    inner: Rc<AnchorInner>,
}

impl StableViewAnchor {
    pub fn new(
        config: AnchorConfig,
        scheduler: Rc<dyn Scheduler>,
        geometry: Rc<dyn AnchorGeometry>,
        selection: Rc<dyn SelectionSource>,
    ) -> Self {
        Self {
            inner: Rc::new(AnchorInner {
                config,
                scheduler,
                geometry,
                selection,
                state: RefCell::new(AnchorState {
                    next_token: 0,
                    pending: None,
                    frame_task: None,
                    stats: AnchorStats::default(),
                }),
            }),
        }
    }

    pub fn stats(&self) -> AnchorStats {
        self.inner.state.borrow().stats
    }

    pub fn has_pending(&self) -> bool {
        self.inner.state.borrow().pending.is_some()
    }

    pub fn pending_token(&self) -> Option<u64> {
        self.inner.state.borrow().pending.as_ref().map(|p| p.token)
    }

    /// Snapshots the anchor before a mutation. Supersedes any pending
    /// compensation.
    pub fn begin_change(&self, trigger: LayoutTrigger, options: ChangeOptions) -> ChangeHandle {
        let inner = &self.inner;
        let token = inner.invalidate();
        let strategy = options.strategy.unwrap_or(inner.config.strategy);

        let snapshot = resolve_target(strategy, inner.selection.as_ref(), inner.geometry.as_ref())
            .and_then(|target| {
                measure(&target, inner.geometry.as_ref()).map(|before| (target, before))
            });

        let mut state = inner.state.borrow_mut();
        match snapshot {
            Some((target, before)) if before.is_visible => {
                trace!(?trigger, token, ?target, top = before.top, "Anchor snapshot");
                state.stats.started += 1;
                state.pending = Some(PendingCompensation {
                    token,
                    trigger,
                    target,
                    before,
                    latest: None,
                    phase: Phase::AwaitingFinalize,
                    missing_frames: 0,
                    deadline: None,
                });
                ChangeHandle {
                    token,
                    scheduled: true,
                    anchor: Rc::downgrade(inner),
                }
            }
            _ => {
                trace!(?trigger, token, "No on-screen anchor, skipping compensation");
                state.stats.skipped += 1;
                ChangeHandle {
                    token,
                    scheduled: false,
                    anchor: Rc::downgrade(inner),
                }
            }
        }
    }

    /// Wraps a synchronous mutation.
    pub fn run_with_stable_anchor<R>(&self, trigger: LayoutTrigger, f: impl FnOnce() -> R) -> R {
        let handle = self.begin_change(trigger, ChangeOptions::default());
        let result = f();
        handle.finalize();
        result
    }

    /// Wraps an asynchronous mutation; compensation starts once it resolves.
    pub async fn run_with_stable_anchor_async<F, Fut, R>(&self, trigger: LayoutTrigger, f: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let handle = self.begin_change(trigger, ChangeOptions::default());
        let result = f().await;
        handle.finalize();
        result
    }

    /// Scrolls to reveal the current anchor. Drops any pending compensation.
    /// Returns whether the scroll offset changed.
    pub fn focus_current_anchor(&self, mode: FocusMode) -> bool {
        let inner = &self.inner;
        inner.invalidate();

        let geometry = inner.geometry.as_ref();
        let Some(m) = resolve_target(inner.config.strategy, inner.selection.as_ref(), geometry)
            .and_then(|target| measure(&target, geometry))
        else {
            return false;
        };

        let padding_top = inner.config.scroll_padding_top;
        let padding_bottom = inner.config.scroll_padding_bottom;
        let vh = m.viewport_height;
        let delta = match mode {
            FocusMode::Center => m.center() - vh / 2.0,
            FocusMode::Nudge => {
                if m.top < padding_top {
                    m.top - padding_top
                } else if m.bottom > vh - padding_bottom {
                    if m.height > vh - padding_top - padding_bottom {
                        m.top - padding_top
                    } else {
                        m.bottom - (vh - padding_bottom)
                    }
                } else {
                    0.0
                }
            }
        };

        if delta.abs() < inner.config.tolerance_px {
            return false;
        }
        let current = geometry.scroll_top();
        geometry.set_scroll_top(current + delta);
        debug!(?mode, delta, "Focused current anchor");
        true
    }
}

impl AnchorInner {
    /// Drops the pending compensation and returns a fresh token.
    fn invalidate(&self) -> u64 {
        let task = {
            let mut state = self.state.borrow_mut();
            state.next_token += 1;
            if let Some(previous) = state.pending.take() {
                trace!(token = previous.token, trigger = ?previous.trigger, "Superseded pending compensation");
                state.stats.superseded += 1;
            }
            state.frame_task.take()
        };
        if let Some(task) = task {
            self.scheduler.cancel(task);
        }
        self.state.borrow().next_token
    }

    fn finalize(self: &Rc<Self>, token: u64) {
        {
            let mut state = self.state.borrow_mut();
            let Some(pending) = state.pending.as_mut() else {
                return;
            };
            if pending.token != token || pending.phase != Phase::AwaitingFinalize {
                return;
            }
            pending.phase = Phase::Stabilizing { stable_frames: 0 };
            pending.deadline = Some(self.scheduler.now() + self.config.max_wait);
        }
        self.schedule_frame(token);
    }

    fn schedule_frame(self: &Rc<Self>, token: u64) {
        let weak = Rc::downgrade(self);
        let task = self.scheduler.next_frame(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.poll(token);
            }
        }));
        self.state.borrow_mut().frame_task = Some(task);
    }

    fn poll(self: &Rc<Self>, token: u64) {
        let now = self.scheduler.now();
        let target = {
            let mut state = self.state.borrow_mut();
            state.frame_task = None;
            match &state.pending {
                Some(p) if p.token == token => p.target.clone(),
                _ => return,
            }
        };
        let measurement = measure(&target, self.geometry.as_ref());

        let mut state = self.state.borrow_mut();
        let config = &self.config;
        let Some(pending) = state.pending.as_mut() else {
            return;
        };
        let deadline_passed = pending.deadline.is_some_and(|d| now >= d);

        let Some(m) = measurement else {
            pending.missing_frames += 1;
            trace!(token, missing = pending.missing_frames, "Anchor not measurable");
            if pending.missing_frames > config.missing_frame_allowance || deadline_passed {
                debug!(token, trigger = ?pending.trigger, "Anchor lost, abandoning compensation");
                state.pending = None;
                state.stats.abandoned += 1;
                return;
            }
            drop(state);
            self.schedule_frame(token);
            return;
        };
        pending.missing_frames = 0;

        let ready = match pending.phase {
            Phase::AwaitingFinalize => return,
            Phase::Stabilizing { stable_frames } => {
                let stable = pending.latest.is_some_and(|last| {
                    (m.center() - last.center()).abs() < config.tolerance_px
                        && (m.height - last.height).abs() < config.tolerance_px
                });
                let stable_frames = if stable { stable_frames + 1 } else { 0 };
                pending.latest = Some(m);
                trace!(token, stable_frames, center = m.center(), "Anchor poll");

                if stable_frames >= config.stabilize_frames {
                    if config.settle_frames == 0 {
                        true
                    } else {
                        pending.phase = Phase::Settling {
                            remaining: config.settle_frames,
                        };
                        false
                    }
                } else if deadline_passed {
                    debug!(token, "Anchor still moving at max wait, applying latest position");
                    true
                } else {
                    pending.phase = Phase::Stabilizing { stable_frames };
                    false
                }
            }
            Phase::Settling { remaining } => {
                pending.latest = Some(m);
                let remaining = remaining.saturating_sub(1);
                pending.phase = Phase::Settling { remaining };
                remaining == 0
            }
        };

        if !ready {
            drop(state);
            self.schedule_frame(token);
            return;
        }

        let Some(pending) = state.pending.take() else {
            return;
        };
        drop(state);
        self.apply(&pending, &m);
    }

    fn apply(&self, pending: &PendingCompensation, after: &AnchorMeasurement) {
        let config = &self.config;
        let delta = after.center() - pending.before.center();
        let current = self.geometry.scroll_top();
        let mut target = current + delta;

        // Where the anchor will sit once the delta is applied.
        let top = after.top - delta;
        let bottom = after.bottom - delta;
        let vh = after.viewport_height;
        if config.scroll_padding_top > 0.0 && top < config.scroll_padding_top {
            target -= config.scroll_padding_top - top;
        } else if config.scroll_padding_bottom > 0.0
            && bottom > vh - config.scroll_padding_bottom
            && after.height <= vh - config.scroll_padding_top - config.scroll_padding_bottom
        {
            target += bottom - (vh - config.scroll_padding_bottom);
        }

        let adjustment = target - current;
        if adjustment != 0.0 {
            self.geometry.set_scroll_top(target);
        }
        debug!(
            token = pending.token,
            trigger = ?pending.trigger,
            adjustment,
            "Applied anchor compensation"
        );
        let mut state = self.state.borrow_mut();
        state.stats.applied += 1;
        state.stats.last_adjustment = adjustment;
    }
}
