//! GTK media elements.
//!
//! Images are decoded into a `gdk4::Texture`; videos play through a
//! `gtk4::MediaFile`. Both are shown by a `gtk4::Picture` that is spliced
//! into the tile's frame on attach. GTK notifications are translated into
//! [`MediaEvent`]s on the element's sink.

use std::cell::Cell;
use std::rc::Rc;

use gtk4::prelude::*;
use gtk4::{Box as GtkBox, ContentFit, MediaFile, Picture, Widget};
use tracing::{debug, warn};

use super::gtk_surface::GtkGridSurface;
use crate::error::MediaErrorCode;
use crate::media::{ElementOptions, MediaBackend, MediaElement, MediaEvent, MediaEventSink};
use crate::models::{MediaKind, ResolvedSource, TileId};

/// Creates elements whose widgets live in the frames of a [`GtkGridSurface`].
#[derive(Clone)]
pub struct GtkMediaBackend {
    surface: GtkGridSurface,
}

impl GtkMediaBackend {
    pub fn new(surface: GtkGridSurface) -> Self {
        Self { surface }
    }
}

impl MediaBackend for GtkMediaBackend {
    type Element = GtkMediaElement;

    fn create_element(
        &self,
        id: &TileId,
        kind: MediaKind,
        options: ElementOptions,
        sink: MediaEventSink,
    ) -> GtkMediaElement {
        let picture = Picture::new();
        picture.set_can_shrink(true);
        picture.set_content_fit(ContentFit::Cover);
        picture.set_hexpand(true);
        picture.set_vexpand(true);
        picture.add_css_class("media-tile-content");

        GtkMediaElement {
            id: id.clone(),
            kind,
            options,
            sink,
            frame: self.surface.frame(id),
            picture,
            source: None,
            stream: None,
            pending_seek: PendingSeek::default(),
            handlers: Vec::new(),
        }
    }
}

pub struct GtkMediaElement {
    id: TileId,
    kind: MediaKind,
    options: ElementOptions,
    sink: MediaEventSink,
    frame: GtkBox,
    picture: Picture,
    source: Option<ResolvedSource>,
    stream: Option<MediaFile>,
    pending_seek: PendingSeek,
    handlers: Vec<glib::SignalHandlerId>,
}

/// A seek requested before the stream was prepared. A fresh `MediaFile`
/// rejects seeks until then, so the position is replayed from the
/// prepared notification.
#[derive(Clone, Default)]
struct PendingSeek(Rc<Cell<Option<f64>>>);

impl PendingSeek {
    fn defer(&self, seconds: f64) {
        self.0.set(Some(seconds));
    }

    fn clear(&self) {
        self.0.set(None);
    }

    fn take_micros(&self) -> Option<i64> {
        self.0.take().map(to_micros)
    }
}

fn to_micros(seconds: f64) -> i64 {
    (seconds.max(0.0) * 1_000_000.0) as i64
}

impl GtkMediaElement {
    pub fn widget(&self) -> &Picture {
        &self.picture
    }

    fn load_image(&mut self, source: &ResolvedSource) {
        let texture = match source {
            ResolvedSource::Local(path) => gdk4::Texture::from_filename(path),
            ResolvedSource::Blob(blob) => {
                gdk4::Texture::from_bytes(&glib::Bytes::from_owned(blob.bytes.to_vec()))
            }
            ResolvedSource::Remote(url) => gdk4::Texture::from_file(&gio::File::for_uri(url)),
        };
        match texture {
            Ok(texture) => {
                self.picture.set_paintable(Some(&texture));
                self.sink.emit(MediaEvent::LoadedMetadata {
                    width: texture.width().max(0) as u32,
                    height: texture.height().max(0) as u32,
                });
                self.sink.emit(MediaEvent::FirstFrame);
            }
            Err(err) => {
                debug!(tile = %self.id, error = %err, "Image decode failed");
                self.sink.emit(MediaEvent::Error {
                    code: classify_error(&err),
                    message: err.message().to_string(),
                });
            }
        }
    }

    fn load_video(&mut self, source: &ResolvedSource) {
        let media = match source {
            ResolvedSource::Local(path) => MediaFile::for_filename(path),
            ResolvedSource::Remote(url) => MediaFile::for_file(&gio::File::for_uri(url)),
            ResolvedSource::Blob(blob) => {
                let bytes = glib::Bytes::from_owned(blob.bytes.to_vec());
                MediaFile::for_input_stream(&gio::MemoryInputStream::from_bytes(&bytes))
            }
        };
        media.set_muted(self.options.muted);
        media.set_loop(self.options.looping);

        let sink = self.sink.clone();
        let pending = self.pending_seek.clone();
        let id = self.id.clone();
        self.handlers.push(media.connect_prepared_notify(move |m| {
            if !m.is_prepared() {
                return;
            }
            if let Some(target) = pending.take_micros() {
                if m.is_seekable() {
                    m.seek(target);
                } else {
                    debug!(tile = %id, "Stream not seekable, restarting from the beginning");
                }
            }
            sink.emit(MediaEvent::LoadedMetadata {
                width: m.intrinsic_width().max(0) as u32,
                height: m.intrinsic_height().max(0) as u32,
            });
        }));

        let sink = self.sink.clone();
        let first_frame = Cell::new(false);
        self.handlers
            .push(media.connect_invalidate_contents(move |_| {
                if !first_frame.replace(true) {
                    sink.emit(MediaEvent::FirstFrame);
                }
            }));

        let sink = self.sink.clone();
        self.handlers.push(media.connect_error_notify(move |m| {
            if let Some(err) = m.error() {
                sink.emit(MediaEvent::Error {
                    code: classify_error(&err),
                    message: err.message().to_string(),
                });
            }
        }));

        let sink = self.sink.clone();
        self.handlers.push(media.connect_playing_notify(move |m| {
            sink.emit(if m.is_playing() {
                MediaEvent::Playing
            } else {
                MediaEvent::Paused
            });
        }));

        self.picture.set_paintable(Some(&media));
        self.stream = Some(media);
    }

    fn drop_stream(&mut self) {
        self.pending_seek.clear();
        if let Some(media) = self.stream.take() {
            for handler in self.handlers.drain(..) {
                media.disconnect(handler);
            }
            media.pause();
            media.clear();
        }
        self.picture.set_paintable(None::<&gdk4::Paintable>);
    }
}

impl MediaElement for GtkMediaElement {
    fn set_source(&mut self, source: &ResolvedSource) {
        self.source = Some(source.clone());
    }

    fn clear_source(&mut self) {
        self.source = None;
        self.drop_stream();
    }

    fn load(&mut self) {
        let Some(source) = self.source.clone() else {
            warn!(tile = %self.id, "Load without a source");
            return;
        };
        self.drop_stream();
        match self.kind {
            MediaKind::Image => self.load_image(&source),
            MediaKind::Video => self.load_video(&source),
        }
    }

    fn play(&mut self) -> Result<(), MediaErrorCode> {
        match (&self.stream, self.kind) {
            (Some(media), _) => {
                media.play();
                Ok(())
            }
            (None, MediaKind::Image) => Ok(()),
            (None, MediaKind::Video) => Err(MediaErrorCode::Interrupted),
        }
    }

    fn pause(&mut self) {
        if let Some(media) = &self.stream {
            media.pause();
        }
    }

    fn seek(&mut self, seconds: f64) {
        match &self.stream {
            Some(media) if media.is_prepared() => {
                if media.is_seekable() {
                    media.seek(to_micros(seconds));
                }
            }
            Some(_) => self.pending_seek.defer(seconds),
            None => {}
        }
    }

    fn current_time(&self) -> f64 {
        self.stream
            .as_ref()
            .map_or(0.0, |m| m.timestamp() as f64 / 1_000_000.0)
    }

    fn is_paused(&self) -> bool {
        self.stream.as_ref().map_or(true, |m| !m.is_playing())
    }

    /// GTK exposes no buffer level; a prepared stream counts as playable.
    fn has_enough_data(&self) -> bool {
        self.stream.as_ref().is_some_and(|m| m.is_prepared())
    }

    fn attach(&mut self) {
        let own: &Widget = self.picture.upcast_ref();
        let mut child = self.frame.first_child();
        while let Some(widget) = child {
            child = widget.next_sibling();
            if &widget != own {
                self.frame.remove(&widget);
            }
        }
        if self.picture.parent().is_none() {
            self.frame.append(&self.picture);
        }
    }

    fn detach(&mut self) {
        if self.picture.parent().is_some() {
            self.picture.unparent();
        }
    }

    fn release_decoder(&mut self) {
        self.drop_stream();
    }

    fn is_attached(&self) -> bool {
        self.picture.parent().is_some() && self.picture.root().is_some()
    }
}

impl Drop for GtkMediaElement {
    fn drop(&mut self) {
        // A picture reparented into a viewer stays with the viewer.
        let own_frame: &Widget = self.frame.upcast_ref();
        if self.picture.parent().as_ref().map_or(true, |p| p == own_frame) {
            self.drop_stream();
            self.detach();
        }
    }
}

/// Maps a GIO/GDK error onto the element error codes the lifecycle classifies.
fn classify_error(err: &glib::Error) -> MediaErrorCode {
    if let Some(kind) = err.kind::<gio::IOErrorEnum>() {
        return match kind {
            gio::IOErrorEnum::Cancelled => MediaErrorCode::Aborted,
            gio::IOErrorEnum::NotFound | gio::IOErrorEnum::NotSupported => {
                MediaErrorCode::SourceNotSupported
            }
            gio::IOErrorEnum::TimedOut
            | gio::IOErrorEnum::HostNotFound
            | gio::IOErrorEnum::HostUnreachable
            | gio::IOErrorEnum::NetworkUnreachable
            | gio::IOErrorEnum::ConnectionRefused => MediaErrorCode::Network,
            _ => MediaErrorCode::Decode,
        };
    }
    match err.kind::<gdk4::TextureError>() {
        Some(gdk4::TextureError::UnsupportedFormat) | Some(gdk4::TextureError::UnsupportedContent) => {
            MediaErrorCode::SourceNotSupported
        }
        _ => MediaErrorCode::Decode,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_io_errors() {
        let missing = glib::Error::new(gio::IOErrorEnum::NotFound, "missing");
        assert_eq!(classify_error(&missing), MediaErrorCode::SourceNotSupported);
        let cancelled = glib::Error::new(gio::IOErrorEnum::Cancelled, "cancelled");
        assert_eq!(classify_error(&cancelled), MediaErrorCode::Aborted);
        let timeout = glib::Error::new(gio::IOErrorEnum::TimedOut, "slow");
        assert_eq!(classify_error(&timeout), MediaErrorCode::Network);
    }

    #[test]
    fn test_pending_seek_replayed_once() {
        let pending = PendingSeek::default();
        let handler = pending.clone();
        assert_eq!(handler.take_micros(), None);

        pending.defer(1.0);
        pending.defer(4.25);
        assert_eq!(handler.take_micros(), Some(4_250_000));
        assert_eq!(handler.take_micros(), None);

        pending.defer(-3.0);
        assert_eq!(handler.take_micros(), Some(0));
    }

    #[test]
    fn test_pending_seek_cleared_with_the_stream() {
        let pending = PendingSeek::default();
        pending.defer(7.0);
        pending.clear();
        assert_eq!(pending.take_micros(), None);
    }

    #[test]
    fn test_classify_texture_errors() {
        let corrupt = glib::Error::new(gdk4::TextureError::CorruptImage, "bad");
        assert_eq!(classify_error(&corrupt), MediaErrorCode::Decode);
        let unsupported = glib::Error::new(gdk4::TextureError::UnsupportedFormat, "no");
        assert_eq!(classify_error(&unsupported), MediaErrorCode::SourceNotSupported);
    }
}
