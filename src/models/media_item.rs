use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Stable identifier of a tile, supplied by the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId(Arc<str>);

impl TileId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TileId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TileId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "jpg" | "jpeg" | "png" | "webp" | "gif" | "bmp" | "tiff" | "tif" => Some(Self::Image),
            "webm" | "mp4" | "mkv" | "avi" | "mov" | "m4v" => Some(Self::Video),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }

    pub fn is_video(&self) -> bool {
        *self == Self::Video
    }
}

/// In-memory media bytes (e.g. a freshly generated clip that has not hit disk yet).
#[derive(Clone)]
pub struct BlobSource {
    pub bytes: Arc<[u8]>,
    pub mime: String,
}

impl fmt::Debug for BlobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobSource")
            .field("len", &self.bytes.len())
            .field("mime", &self.mime)
            .finish()
    }
}

impl PartialEq for BlobSource {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes) && self.mime == other.mime
    }
}

/// Every place a tile's media can be fetched from. Any subset may be present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaSource {
    pub local_path: Option<PathBuf>,
    pub blob: Option<BlobSource>,
    pub remote_url: Option<String>,
}

/// The single source an element is pointed at.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedSource {
    Local(PathBuf),
    Blob(BlobSource),
    Remote(String),
}

impl ResolvedSource {
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl MediaSource {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn remote(url: impl Into<String>) -> Self {
        Self {
            remote_url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Picks the preferred source: local path, then in-memory blob, then remote URL.
    pub fn resolve(&self) -> Option<ResolvedSource> {
        if let Some(path) = &self.local_path {
            return Some(ResolvedSource::Local(path.clone()));
        }
        if let Some(blob) = &self.blob {
            return Some(ResolvedSource::Blob(blob.clone()));
        }
        self.remote_url.clone().map(ResolvedSource::Remote)
    }
}

/// File identity signal. A change in either field means the bytes behind the
/// tile may have changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FileSignal {
    pub size: Option<u64>,
    pub mtime: Option<i64>,
}

impl FileSignal {
    pub fn new(size: u64, mtime: i64) -> Self {
        Self {
            size: Some(size),
            mtime: Some(mtime),
        }
    }
}

/// Per-tile input supplied by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct TileInput {
    pub id: TileId,
    pub kind: MediaKind,
    pub source: MediaSource,
    /// Pixel dimensions known before loading, used for a provisional aspect ratio.
    pub size_hint: Option<(u32, u32)>,
    pub signal: FileSignal,
}

impl TileInput {
    pub fn new(id: impl Into<TileId>, kind: MediaKind, source: MediaSource) -> Self {
        Self {
            id: id.into(),
            kind,
            source,
            size_hint: None,
            signal: FileSignal::default(),
        }
    }

    /// Builds an input for a file on disk, deriving the kind from its extension.
    pub fn from_path(id: impl Into<TileId>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let kind = MediaKind::from_path(&path).unwrap_or(MediaKind::Image);
        Self::new(id, kind, MediaSource::local(path))
    }

    pub fn with_size_hint(mut self, width: u32, height: u32) -> Self {
        self.size_hint = Some((width, height));
        self
    }

    pub fn with_signal(mut self, signal: FileSignal) -> Self {
        self.signal = signal;
        self
    }

    pub fn hinted_aspect_ratio(&self) -> Option<f64> {
        match self.size_hint {
            Some((w, h)) if w > 0 && h > 0 => Some(w as f64 / h as f64),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_extension() {
        assert_eq!(MediaKind::from_extension("MP4"), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_extension("jpeg"), Some(MediaKind::Image));
        assert_eq!(MediaKind::from_extension("txt"), None);
        assert_eq!(
            MediaKind::from_path(Path::new("/clips/a.webm")),
            Some(MediaKind::Video)
        );
    }

    #[test]
    fn test_source_preference_order() {
        let blob = BlobSource {
            bytes: Arc::from(vec![1u8, 2, 3]),
            mime: "video/webm".into(),
        };
        let mut source = MediaSource {
            local_path: Some(PathBuf::from("/a.webm")),
            blob: Some(blob.clone()),
            remote_url: Some("https://example.invalid/a.webm".into()),
        };
        assert_eq!(
            source.resolve(),
            Some(ResolvedSource::Local(PathBuf::from("/a.webm")))
        );

        source.local_path = None;
        assert_eq!(source.resolve(), Some(ResolvedSource::Blob(blob)));

        source.blob = None;
        assert!(matches!(source.resolve(), Some(ResolvedSource::Remote(_))));

        source.remote_url = None;
        assert_eq!(source.resolve(), None);
    }

    #[test]
    fn test_hinted_aspect_ratio() {
        let input = TileInput::from_path("a", "/a.png").with_size_hint(1920, 1080);
        let ar = input.hinted_aspect_ratio().unwrap();
        assert!((ar - 16.0 / 9.0).abs() < 1e-9);
        assert_eq!(
            TileInput::from_path("b", "/b.png")
                .with_size_hint(0, 10)
                .hinted_aspect_ratio(),
            None
        );
    }
}
