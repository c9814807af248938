//! Media element abstraction.
//!
//! A backend creates one playable element per load attempt. Elements report
//! progress asynchronously by pushing [`MediaEvent`]s into a
//! [`MediaEventSink`]; the grid drains the channel on its own schedule.

use flume::{Receiver, Sender};
use tracing::trace;

use crate::error::MediaErrorCode;
use crate::models::{MediaKind, ResolvedSource, TileId};

/// How a freshly created element is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementOptions {
    pub muted: bool,
    pub looping: bool,
    /// Play inside the tile instead of taking over the screen.
    pub inline: bool,
}

impl Default for ElementOptions {
    fn default() -> Self {
        Self {
            muted: true,
            looping: true,
            inline: true,
        }
    }
}

/// A playable media node owned by exactly one tile.
///
/// Elements start detached from the tile's render container;
/// [`attach`](Self::attach) splices them in once a frame is available.
pub trait MediaElement {
    fn set_source(&mut self, source: &ResolvedSource);
    /// Drops the source and any temporary references it holds (blob handles).
    fn clear_source(&mut self);
    /// (Re)starts fetching the current source.
    fn load(&mut self);
    /// A rejected play request reports why, typically `Interrupted`.
    fn play(&mut self) -> Result<(), MediaErrorCode>;
    fn pause(&mut self);
    fn seek(&mut self, seconds: f64);
    fn current_time(&self) -> f64;
    fn is_paused(&self) -> bool;
    /// Whether enough data is buffered to keep playing.
    fn has_enough_data(&self) -> bool;
    /// Inserts the element into the tile's render container, removing any
    /// stale sibling media nodes first.
    fn attach(&mut self);
    fn detach(&mut self);
    /// Forces the decoder to release its resources.
    fn release_decoder(&mut self);
    /// Attached and live in the render tree.
    fn is_attached(&self) -> bool;
}

pub trait MediaBackend {
    type Element: MediaElement;

    fn create_element(
        &self,
        id: &TileId,
        kind: MediaKind,
        options: ElementOptions,
        sink: MediaEventSink,
    ) -> Self::Element;
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    LoadedMetadata { width: u32, height: u32 },
    FirstFrame,
    Playing,
    Paused,
    TimeUpdate(f64),
    Error { code: MediaErrorCode, message: String },
}

/// An event tagged with the element generation that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaEventEnvelope {
    pub id: TileId,
    pub generation: u64,
    pub event: MediaEvent,
}

/// Sending half handed to one element.
///
/// Events from an element that has since been torn down carry an outdated
/// generation and are dropped by the receiver.
#[derive(Debug, Clone)]
pub struct MediaEventSink {
    id: TileId,
    generation: u64,
    tx: Sender<MediaEventEnvelope>,
}

impl MediaEventSink {
    pub fn new(id: TileId, generation: u64, tx: Sender<MediaEventEnvelope>) -> Self {
        Self { id, generation, tx }
    }

    pub fn id(&self) -> &TileId {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: MediaEvent) {
        trace!(tile = %self.id, generation = self.generation, ?event, "Media event");
        // The grid may already be gone; nothing to deliver to then.
        let _ = self.tx.send(MediaEventEnvelope {
            id: self.id.clone(),
            generation: self.generation,
            event,
        });
    }
}

/// Unbounded event channel shared by every element of one grid.
pub struct MediaEventChannel {
    tx: Sender<MediaEventEnvelope>,
    rx: Receiver<MediaEventEnvelope>,
}

impl MediaEventChannel {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    pub fn sink(&self, id: TileId, generation: u64) -> MediaEventSink {
        MediaEventSink::new(id, generation, self.tx.clone())
    }

    /// Everything received so far, in arrival order.
    pub fn drain(&self) -> Vec<MediaEventEnvelope> {
        self.rx.try_iter().collect()
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl Default for MediaEventChannel {
    fn default() -> Self {
        Self::new()
    }
}
