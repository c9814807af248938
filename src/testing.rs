//! Test doubles shared by the unit tests.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::anchor::SelectionSource;
use crate::error::MediaErrorCode;
use crate::media::{ElementOptions, MediaBackend, MediaElement, MediaEvent, MediaEventSink};
use crate::models::{MediaKind, ResolvedSource, TileId};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    SetSource,
    ClearSource,
    Load,
    Play,
    Pause,
    Seek(f64),
    Attach,
    Detach,
    ReleaseDecoder,
}

#[derive(Debug)]
struct ElementState {
    id: TileId,
    sink: MediaEventSink,
    source: Option<ResolvedSource>,
    time: f64,
    paused: bool,
    enough_data: bool,
    attached: bool,
    released: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    elements: Vec<ElementState>,
    calls: Vec<(TileId, Call)>,
    play_failures: HashMap<TileId, VecDeque<MediaErrorCode>>,
}

/// Scripted backend. Elements never emit anything on their own; tests push
/// events with [`FakeBackend::emit`].
#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Rc<RefCell<FakeState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elements_created(&self) -> usize {
        self.state.borrow().elements.len()
    }

    pub fn created_for(&self, id: &TileId) -> usize {
        self.state
            .borrow()
            .elements
            .iter()
            .filter(|e| &e.id == id)
            .count()
    }

    /// Elements of `id` still attached to the render tree.
    pub fn attached_for(&self, id: &TileId) -> usize {
        self.state
            .borrow()
            .elements
            .iter()
            .filter(|e| &e.id == id && e.attached)
            .count()
    }

    /// Elements of `id` that still hold a source or a decoder.
    pub fn retained_for(&self, id: &TileId) -> usize {
        self.state
            .borrow()
            .elements
            .iter()
            .filter(|e| &e.id == id && (e.source.is_some() || !e.released))
            .count()
    }

    /// Whether the newest element of `id` is paused.
    pub fn paused_for(&self, id: &TileId) -> Option<bool> {
        self.state
            .borrow()
            .elements
            .iter()
            .rev()
            .find(|e| &e.id == id)
            .map(|e| e.paused)
    }

    pub fn calls_for(&self, id: &TileId) -> Vec<Call> {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|(i, _)| i == id)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    pub fn last_source(&self, id: &TileId) -> Option<ResolvedSource> {
        self.state
            .borrow()
            .elements
            .iter()
            .rev()
            .find(|e| &e.id == id)
            .and_then(|e| e.source.clone())
    }

    /// Emits `event` through the newest element of `id`.
    pub fn emit(&self, id: &TileId, event: MediaEvent) {
        let sink = self
            .state
            .borrow()
            .elements
            .iter()
            .rev()
            .find(|e| &e.id == id)
            .map(|e| e.sink.clone());
        if let Some(sink) = sink {
            sink.emit(event);
        }
    }

    /// Metadata followed by the first frame.
    pub fn load_ok(&self, id: &TileId, width: u32, height: u32) {
        self.emit(id, MediaEvent::LoadedMetadata { width, height });
        self.emit(id, MediaEvent::FirstFrame);
    }

    pub fn fail(&self, id: &TileId, code: MediaErrorCode) {
        self.emit(
            id,
            MediaEvent::Error {
                code,
                message: format!("scripted {code}"),
            },
        );
    }

    pub fn set_time(&self, id: &TileId, seconds: f64) {
        if let Some(mut e) = self.newest_mut(id) {
            e.time = seconds;
        }
    }

    pub fn set_buffering(&self, id: &TileId, buffering: bool) {
        if let Some(mut e) = self.newest_mut(id) {
            e.enough_data = !buffering;
        }
    }

    pub fn fail_next_play(&self, id: &TileId, code: MediaErrorCode) {
        self.state
            .borrow_mut()
            .play_failures
            .entry(id.clone())
            .or_default()
            .push_back(code);
    }

    fn newest_mut(&self, id: &TileId) -> Option<std::cell::RefMut<'_, ElementState>> {
        let state = self.state.borrow_mut();
        let index = state.elements.iter().rposition(|e| &e.id == id)?;
        Some(std::cell::RefMut::map(state, |s| &mut s.elements[index]))
    }
}

impl MediaBackend for FakeBackend {
    type Element = FakeElement;

    fn create_element(
        &self,
        id: &TileId,
        _kind: MediaKind,
        _options: ElementOptions,
        sink: MediaEventSink,
    ) -> FakeElement {
        let mut state = self.state.borrow_mut();
        state.elements.push(ElementState {
            id: id.clone(),
            sink,
            source: None,
            time: 0.0,
            paused: true,
            enough_data: true,
            attached: false,
            released: false,
        });
        FakeElement {
            index: state.elements.len() - 1,
            id: id.clone(),
            state: self.state.clone(),
        }
    }
}

pub struct FakeElement {
    index: usize,
    id: TileId,
    state: Rc<RefCell<FakeState>>,
}

impl FakeElement {
    fn record(&self, call: Call) {
        self.state.borrow_mut().calls.push((self.id.clone(), call));
    }

    fn with<R>(&self, f: impl FnOnce(&mut ElementState) -> R) -> R {
        f(&mut self.state.borrow_mut().elements[self.index])
    }
}

impl MediaElement for FakeElement {
    fn set_source(&mut self, source: &ResolvedSource) {
        self.record(Call::SetSource);
        self.with(|e| e.source = Some(source.clone()));
    }

    fn clear_source(&mut self) {
        self.record(Call::ClearSource);
        self.with(|e| e.source = None);
    }

    fn load(&mut self) {
        self.record(Call::Load);
    }

    fn play(&mut self) -> Result<(), MediaErrorCode> {
        self.record(Call::Play);
        let failure = self
            .state
            .borrow_mut()
            .play_failures
            .get_mut(&self.id)
            .and_then(VecDeque::pop_front);
        match failure {
            Some(code) => Err(code),
            None => {
                self.with(|e| e.paused = false);
                Ok(())
            }
        }
    }

    fn pause(&mut self) {
        self.record(Call::Pause);
        self.with(|e| e.paused = true);
    }

    fn seek(&mut self, seconds: f64) {
        self.record(Call::Seek(seconds));
        self.with(|e| e.time = seconds);
    }

    fn current_time(&self) -> f64 {
        self.with(|e| e.time)
    }

    fn is_paused(&self) -> bool {
        self.with(|e| e.paused)
    }

    fn has_enough_data(&self) -> bool {
        self.with(|e| e.enough_data)
    }

    fn attach(&mut self) {
        self.record(Call::Attach);
        self.with(|e| e.attached = true);
    }

    fn detach(&mut self) {
        self.record(Call::Detach);
        self.with(|e| e.attached = false);
    }

    fn release_decoder(&mut self) {
        self.record(Call::ReleaseDecoder);
        self.with(|e| e.released = true);
    }

    fn is_attached(&self) -> bool {
        self.with(|e| e.attached)
    }
}

/// Host selection with a fixed navigation order.
pub struct FakeSelection {
    order: RefCell<Vec<TileId>>,
    selected: RefCell<Vec<TileId>>,
}

impl FakeSelection {
    pub fn new(order: Vec<TileId>) -> Self {
        Self {
            order: RefCell::new(order),
            selected: RefCell::new(Vec::new()),
        }
    }

    pub fn select(&self, ids: &[&str]) {
        *self.selected.borrow_mut() = ids.iter().map(|id| TileId::from(*id)).collect();
    }

    pub fn set_order(&self, order: Vec<TileId>) {
        *self.order.borrow_mut() = order;
    }
}

impl SelectionSource for FakeSelection {
    fn selected(&self) -> Vec<TileId> {
        self.selected.borrow().clone()
    }

    fn ordered_ids(&self) -> Vec<TileId> {
        self.order.borrow().clone()
    }
}
