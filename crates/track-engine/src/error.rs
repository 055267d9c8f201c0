//! Error taxonomy for the playback engine.
//!
//! Packet-level problems are handled close to where they happen; anything left in
//! here that reports [`EngineError::is_fatal`] terminates the track session.

use std::io;

use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Errors raised by sources, demuxers, decoders and the executor.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The container could not be recognized or parsed.
    #[error("format error: {0}")]
    Format(String),

    /// Seeking was requested on a source that cannot seek.
    #[error("seeking is not supported by this source")]
    SeekUnsupported,

    /// A packet failed to decode.
    #[error("decode error: {message}")]
    Decode {
        message: String,
        /// Whether the decoder can resynchronize on the next packet.
        recoverable: bool,
    },

    /// Neither the native nor the software decoder could be created or configured.
    #[error("could not acquire decoder: {0}")]
    ResourceAcquisition(String),

    /// A native decoder handle was used after it was closed.
    #[error("native decoder handle used after close")]
    UseAfterClose,

    /// Reading from the byte source failed.
    #[error("source I/O error: {0}")]
    Io(#[from] io::Error),

    /// A blocking point was woken for stop or seek.
    #[error("interrupted")]
    Interrupted,
}

impl EngineError {
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format(message.into())
    }

    pub fn recoverable_decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
            recoverable: true,
        }
    }

    pub fn fatal_decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
            recoverable: false,
        }
    }

    /// Whether this error ends the track session.
    ///
    /// `SeekUnsupported` and recoverable decode errors leave playback running;
    /// `Interrupted` is control flow, not a failure.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::SeekUnsupported | Self::Interrupted => false,
            Self::Decode { recoverable, .. } => !recoverable,
            Self::Format(_) | Self::ResourceAcquisition(_) | Self::UseAfterClose | Self::Io(_) => {
                true
            }
        }
    }
}

impl From<symphonia::core::errors::Error> for EngineError {
    fn from(err: symphonia::core::errors::Error) -> Self {
        use symphonia::core::errors::Error as SymphoniaError;
        match err {
            SymphoniaError::IoError(e) => Self::Io(e),
            SymphoniaError::DecodeError(msg) => Self::recoverable_decode(msg),
            SymphoniaError::SeekError(kind) => match kind {
                symphonia::core::errors::SeekErrorKind::Unseekable
                | symphonia::core::errors::SeekErrorKind::ForwardOnly => Self::SeekUnsupported,
                other => Self::format(format!("seek failed: {other:?}")),
            },
            SymphoniaError::Unsupported(what) => Self::format(format!("unsupported: {what}")),
            SymphoniaError::LimitError(what) => Self::format(format!("limit reached: {what}")),
            SymphoniaError::ResetRequired => Self::recoverable_decode("decoder reset required"),
        }
    }
}
