//! Error types shared across the grid core.
//!
//! Playback failures are classified, not thrown: a [`PlaybackError`] only
//! reaches the host once a tile has exhausted soft recovery and its single
//! retry. [`GridError`] covers host-facing misuse.

use std::fmt;

use thiserror::Error;

use crate::models::TileId;

pub type GridResult<T> = Result<T, GridError>;

#[derive(Debug, Error)]
pub enum GridError {
    #[error("unknown tile: {0}")]
    UnknownTile(TileId),

    #[error("invalid {property} value: {value:?}")]
    StyleParse {
        property: &'static str,
        value: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl GridError {
    pub fn style(property: &'static str, value: impl Into<String>) -> Self {
        Self::StyleParse {
            property,
            value: value.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

/// Failure code reported by a media element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaErrorCode {
    /// Fetch aborted by the element or the user agent.
    Aborted,
    /// Network hiccup while fetching the source.
    Network,
    /// The source was fetched but could not be decoded.
    Decode,
    /// No decoder/demuxer accepts the source.
    SourceNotSupported,
    /// A play request was interrupted (pause during play, missing user gesture).
    Interrupted,
    /// The element never produced a frame within the load timeout.
    Timeout,
}

impl MediaErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aborted => "aborted",
            Self::Network => "network",
            Self::Decode => "decode",
            Self::SourceNotSupported => "source-not-supported",
            Self::Interrupted => "interrupted",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for MediaErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

impl ErrorClass {
    /// Classifies a failure.
    ///
    /// Decode and unsupported-source failures are terminal, except for local
    /// sources that have been attempted fewer than `local_retry_attempts`
    /// times: a file that is still being written looks undecodable for a
    /// moment after it appears.
    pub fn classify(
        code: MediaErrorCode,
        local_source: bool,
        attempts: u32,
        local_retry_attempts: u32,
    ) -> Self {
        match code {
            MediaErrorCode::Aborted
            | MediaErrorCode::Network
            | MediaErrorCode::Interrupted
            | MediaErrorCode::Timeout => Self::Transient,
            MediaErrorCode::Decode | MediaErrorCode::SourceNotSupported => {
                if local_source && attempts < local_retry_attempts {
                    Self::Transient
                } else {
                    Self::Permanent
                }
            }
        }
    }
}

/// A playback failure surfaced to the host.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code} failure after {attempts} attempt(s): {message}")]
pub struct PlaybackError {
    pub code: MediaErrorCode,
    pub class: ErrorClass,
    pub attempts: u32,
    pub message: String,
}
