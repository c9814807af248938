//! Per-tile media lifecycle.
//!
//! `idle → requested → loaded → playing/paused`, with `transient-error → idle`
//! (one retry after a fixed backoff) and a terminal `permanent-error` that
//! only a file identity change clears.
//!
//! [`MediaTile`] owns at most one element and never touches a clock or a
//! scheduler itself. Every transition returns the [`TileEffect`]s the owner
//! has to carry out (arming timers, notifying the host, registering with the
//! stall watchdog).

use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use super::element::{MediaElement, MediaEvent};
use crate::config::LifecycleConfig;
use crate::error::{ErrorClass, MediaErrorCode, PlaybackError};
use crate::models::{FileSignal, MediaKind, MediaSource, TileId, TileInput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaState {
    Idle,
    Requested,
    Loaded,
    Playing,
    Paused,
    TransientError,
    PermanentError,
}

impl MediaState {
    /// Loaded far enough that an element is (or was) showing frames.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Loaded | Self::Playing | Self::Paused)
    }
}

/// Side effects requested by a tile transition.
#[derive(Debug, Clone, PartialEq)]
pub enum TileEffect {
    ArmLoadTimeout(Duration),
    CancelLoadTimeout,
    ScheduleRetry(Duration),
    CancelRetry,
    AspectRatio(f64),
    Played,
    Paused,
    Failed(PlaybackError),
    WatchStall,
    UnwatchStall,
}

pub struct MediaTile<E> {
    config: LifecycleConfig,
    id: TileId,
    kind: MediaKind,
    source: MediaSource,
    signal: FileSignal,
    state: MediaState,
    element: Option<E>,
    generation: u64,

    /// Elements created since the last successful first frame.
    attempts: u32,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    last_error: Option<PlaybackError>,

    visible: bool,
    near: bool,
    desired_playing: bool,
    on_loan: bool,
    admission_rejected: bool,

    last_known_time: f64,
    natural_aspect_ratio: Option<f64>,
    aspect_reported: bool,
    recovering: bool,
    timeout_armed: bool,
    retry_pending: bool,
}

impl<E: MediaElement> MediaTile<E> {
    pub fn new(input: &TileInput, config: &LifecycleConfig) -> Self {
        Self {
            config: config.clone(),
            id: input.id.clone(),
            kind: input.kind,
            source: input.source.clone(),
            signal: input.signal,
            state: MediaState::Idle,
            element: None,
            generation: 0,
            attempts: 0,
            consecutive_failures: 0,
            last_failure_at: None,
            last_error: None,
            visible: false,
            near: false,
            desired_playing: false,
            on_loan: false,
            admission_rejected: false,
            last_known_time: 0.0,
            natural_aspect_ratio: None,
            aspect_reported: false,
            recovering: false,
            timeout_armed: false,
            retry_pending: false,
        }
    }

    pub fn id(&self) -> &TileId {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn state(&self) -> MediaState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_failure_at(&self) -> Option<Instant> {
        self.last_failure_at
    }

    pub fn last_error(&self) -> Option<&PlaybackError> {
        self.last_error.as_ref()
    }

    pub fn natural_aspect_ratio(&self) -> Option<f64> {
        self.natural_aspect_ratio
    }

    pub fn element(&self) -> Option<&E> {
        self.element.as_ref()
    }

    pub fn has_element(&self) -> bool {
        self.element.is_some()
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn is_near(&self) -> bool {
        self.near
    }

    pub fn is_on_loan(&self) -> bool {
        self.on_loan
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_pending
    }

    pub fn admission_rejected(&self) -> bool {
        self.admission_rejected
    }

    pub fn set_admission_rejected(&mut self, rejected: bool) {
        self.admission_rejected = rejected;
    }

    /// The tile should hold a resource.
    pub fn is_wanted(&self) -> bool {
        (self.visible || self.near) && self.state != MediaState::PermanentError
    }

    /// All preconditions for a new load except admission.
    pub fn can_request(&self) -> bool {
        self.element.is_none()
            && self.state != MediaState::Requested
            && self.state != MediaState::PermanentError
            && !self.retry_pending
            && !self.on_loan
    }

    fn should_play(&self) -> bool {
        self.kind.is_video() && self.desired_playing && self.visible
    }

    /// Bumps the generation for a new element; events tagged with older
    /// generations belong to torn-down elements.
    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Starts a load with a freshly created, detached element.
    pub fn begin_load(&mut self, mut element: E, now: Instant) -> Vec<TileEffect> {
        let mut effects = Vec::new();
        self.admission_rejected = false;
        self.attempts += 1;

        let Some(source) = self.source.resolve() else {
            drop(element);
            self.state = MediaState::Idle;
            return self.fail_permanently(
                MediaErrorCode::SourceNotSupported,
                "no source available".to_string(),
                now,
                effects,
            );
        };

        element.set_source(&source);
        element.load();
        self.element = Some(element);
        self.state = MediaState::Requested;
        debug!(tile = %self.id, attempt = self.attempts, local = source.is_local(), "Load requested");

        if self.visible {
            self.timeout_armed = true;
            effects.push(TileEffect::ArmLoadTimeout(self.config.load_timeout));
        }
        effects
    }

    /// Applies a visibility update. Returns teardown / timeout effects; the
    /// owner decides separately whether a new load should be requested.
    pub fn set_visibility(&mut self, visible: bool, near: bool, now: Instant) -> Vec<TileEffect> {
        let mut effects = Vec::new();
        let was_visible = self.visible;
        self.visible = visible;
        self.near = near;

        if was_visible && !visible && self.timeout_armed {
            self.timeout_armed = false;
            effects.push(TileEffect::CancelLoadTimeout);
        }

        if !self.is_wanted() {
            // A load in flight is left to finish or fail on its own.
            if self.state != MediaState::Requested {
                effects.extend(self.teardown());
            }
            return effects;
        }

        if visible && self.state == MediaState::Requested && !self.timeout_armed {
            self.timeout_armed = true;
            effects.push(TileEffect::ArmLoadTimeout(self.config.load_timeout));
        }

        self.sync_playback(&mut effects, now);
        effects
    }

    pub fn set_playing(&mut self, playing: bool, now: Instant) -> Vec<TileEffect> {
        self.desired_playing = playing;
        let mut effects = Vec::new();
        self.sync_playback(&mut effects, now);
        effects
    }

    fn sync_playback(&mut self, effects: &mut Vec<TileEffect>, now: Instant) {
        if self.on_loan || self.recovering {
            return;
        }
        let should_play = self.should_play();
        let Some(element) = self.element.as_mut() else {
            return;
        };
        match self.state {
            MediaState::Loaded | MediaState::Paused if should_play => match element.play() {
                Ok(()) => {
                    self.state = MediaState::Playing;
                    effects.push(TileEffect::Played);
                    effects.push(TileEffect::WatchStall);
                }
                Err(code) => {
                    // Same recovery path as element errors.
                    effects.extend(self.handle_failure(code, "play request rejected".into(), now));
                }
            },
            MediaState::Playing if !should_play => {
                element.pause();
                self.state = MediaState::Paused;
                effects.push(TileEffect::Paused);
            }
            _ => {}
        }
    }

    pub fn set_on_loan(&mut self, on_loan: bool) -> Vec<TileEffect> {
        self.on_loan = on_loan;
        if on_loan || self.is_wanted() {
            return Vec::new();
        }
        // Returned from the viewer while no longer wanted.
        if self.state == MediaState::Requested {
            Vec::new()
        } else {
            self.teardown()
        }
    }

    /// Applies one event from the current element.
    pub fn handle_event(&mut self, event: MediaEvent, now: Instant) -> Vec<TileEffect> {
        let mut effects = Vec::new();
        if self.element.is_none() {
            return effects;
        }

        match event {
            MediaEvent::LoadedMetadata { width, height } => {
                if width > 0 && height > 0 {
                    let ratio = width as f64 / height as f64;
                    self.natural_aspect_ratio = Some(ratio);
                    if !self.aspect_reported {
                        self.aspect_reported = true;
                        effects.push(TileEffect::AspectRatio(ratio));
                    }
                }
                // A reloaded stream ends recovery even if it never plays.
                if self.recovering {
                    self.recovering = false;
                    self.sync_playback(&mut effects, now);
                }
            }
            MediaEvent::FirstFrame => {
                self.recovering = false;
                if self.state == MediaState::Requested {
                    if self.timeout_armed {
                        self.timeout_armed = false;
                        effects.push(TileEffect::CancelLoadTimeout);
                    }
                    self.state = MediaState::Loaded;
                    self.attempts = 0;
                    self.consecutive_failures = 0;
                    self.last_error = None;
                    if let Some(element) = self.element.as_mut() {
                        element.attach();
                    }
                    debug!(tile = %self.id, "First frame");

                    if !self.is_wanted() && !self.on_loan {
                        effects.extend(self.teardown());
                        return effects;
                    }
                }
                self.sync_playback(&mut effects, now);
            }
            MediaEvent::Playing => {
                self.recovering = false;
                if matches!(self.state, MediaState::Loaded | MediaState::Paused) {
                    self.state = MediaState::Playing;
                    effects.push(TileEffect::Played);
                    effects.push(TileEffect::WatchStall);
                }
                // Wishes changed while recovering were not applied yet.
                self.sync_playback(&mut effects, now);
            }
            MediaEvent::Paused => {
                if self.state == MediaState::Playing && !self.recovering {
                    self.state = MediaState::Paused;
                    effects.push(TileEffect::Paused);
                }
            }
            MediaEvent::TimeUpdate(seconds) => {
                if seconds.is_finite() && seconds >= 0.0 {
                    self.last_known_time = seconds;
                }
            }
            MediaEvent::Error { code, message } => {
                effects.extend(self.handle_failure(code, message, now));
            }
        }
        effects
    }

    /// The armed load timeout fired.
    pub fn load_timed_out(&mut self, now: Instant) -> Vec<TileEffect> {
        if !self.timeout_armed || self.state != MediaState::Requested {
            return Vec::new();
        }
        self.timeout_armed = false;
        self.handle_failure(
            MediaErrorCode::Timeout,
            format!("no frame within {:?}", self.config.load_timeout),
            now,
        )
    }

    /// Pause, reload, seek back to the last known position, resume.
    ///
    /// Resumes only if the tile should play right now. A rejected resume is
    /// classified like any other failure of the recovered element.
    pub fn soft_recover(&mut self, now: Instant) -> Vec<TileEffect> {
        let mut effects = Vec::new();
        if self.on_loan {
            return effects;
        }
        let resume = self.should_play();
        let Some(element) = self.element.as_mut() else {
            return effects;
        };
        let position = element.current_time().max(self.last_known_time);
        element.pause();
        element.load();
        element.seek(position);
        debug!(tile = %self.id, position, resume, "Soft recovery");
        if resume {
            if let Err(code) = element.play() {
                self.recovering = true;
                effects.extend(self.handle_failure(code, "resume after recovery rejected".into(), now));
            }
        } else if self.state == MediaState::Playing {
            self.state = MediaState::Paused;
            effects.push(TileEffect::Paused);
        }
        effects
    }

    fn handle_failure(&mut self, code: MediaErrorCode, message: String, now: Instant) -> Vec<TileEffect> {
        if code != MediaErrorCode::Timeout && !self.recovering && self.element.is_some() {
            self.recovering = true;
            debug!(tile = %self.id, %code, "Attempting soft recovery before classifying");
            return self.soft_recover(now);
        }
        self.recovering = false;

        self.consecutive_failures += 1;
        self.last_failure_at = Some(now);
        let local = self
            .source
            .resolve()
            .is_some_and(|source| source.is_local());
        let class =
            ErrorClass::classify(code, local, self.attempts, self.config.local_retry_attempts);

        let mut effects = Vec::new();
        if class == ErrorClass::Transient
            && self.consecutive_failures < self.config.max_consecutive_failures
        {
            warn!(
                tile = %self.id,
                %code,
                attempts = self.attempts,
                message = %message,
                "Transient playback failure, retrying"
            );
            effects.extend(self.teardown());
            self.state = MediaState::TransientError;
            self.retry_pending = true;
            effects.push(TileEffect::ScheduleRetry(self.config.retry_backoff));
            return effects;
        }

        effects.extend(self.teardown());
        self.fail_permanently(code, message, now, effects)
    }

    fn fail_permanently(
        &mut self,
        code: MediaErrorCode,
        message: String,
        now: Instant,
        mut effects: Vec<TileEffect>,
    ) -> Vec<TileEffect> {
        self.last_failure_at = Some(now);
        self.state = MediaState::PermanentError;
        let err = PlaybackError {
            code,
            class: ErrorClass::Permanent,
            attempts: self.attempts,
            message,
        };
        error!(tile = %self.id, error = %err, "Playback failed permanently");
        self.last_error = Some(err.clone());
        effects.push(TileEffect::Failed(err));
        effects
    }

    /// The retry backoff elapsed. The owner re-checks visibility and
    /// admission before loading again.
    pub fn retry_fired(&mut self) {
        self.retry_pending = false;
        if self.state == MediaState::TransientError {
            self.state = MediaState::Idle;
        }
    }

    /// Replaces the source descriptor and file identity. A permanent error is
    /// cleared when the identity changed. Returns whether it was cleared.
    pub fn update_input(&mut self, input: &TileInput) -> bool {
        self.source = input.source.clone();
        self.kind = input.kind;
        if input.signal == self.signal {
            return false;
        }
        self.signal = input.signal;
        if self.state != MediaState::PermanentError {
            return false;
        }
        debug!(tile = %self.id, "File changed, clearing permanent error");
        self.state = MediaState::Idle;
        self.attempts = 0;
        self.consecutive_failures = 0;
        self.last_error = None;
        self.aspect_reported = false;
        true
    }

    /// Releases the element: pause, clear source, detach, release decoder.
    /// An element on loan to a viewer is left alone.
    pub fn teardown(&mut self) -> Vec<TileEffect> {
        let mut effects = Vec::new();
        if self.on_loan {
            return effects;
        }
        if self.timeout_armed {
            self.timeout_armed = false;
            effects.push(TileEffect::CancelLoadTimeout);
        }
        self.recovering = false;

        if let Some(mut element) = self.element.take() {
            let was_playing = self.state == MediaState::Playing;
            element.pause();
            element.clear_source();
            element.detach();
            element.release_decoder();
            drop(element);
            // Late events from the dropped element must not apply.
            self.generation += 1;
            effects.push(TileEffect::UnwatchStall);
            if was_playing {
                effects.push(TileEffect::Paused);
            }
            debug!(tile = %self.id, "Tore down media element");
        }

        if matches!(
            self.state,
            MediaState::Requested | MediaState::Loaded | MediaState::Playing | MediaState::Paused
        ) {
            self.state = MediaState::Idle;
        }
        effects
    }

    /// Final teardown on removal. A loaned element is handed back instead of
    /// being released.
    pub fn dispose(mut self) -> (Vec<TileEffect>, Option<E>) {
        let mut effects = Vec::new();
        if self.retry_pending {
            self.retry_pending = false;
            effects.push(TileEffect::CancelRetry);
        }
        if self.on_loan {
            if self.timeout_armed {
                effects.push(TileEffect::CancelLoadTimeout);
            }
            effects.push(TileEffect::UnwatchStall);
            return (effects, self.element.take());
        }
        effects.extend(self.teardown());
        (effects, None)
    }
}
