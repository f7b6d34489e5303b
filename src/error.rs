//! Error types for tarserve.
//!
//! Errors fall into a few categories, and only the first one may keep the service from
//! starting:
//!
//! - **Configuration**: [`Config`], raised while validating flags at startup
//! - **Traversal**: [`Traversal`], a file or directory could not be read while encoding
//! - **Transport**: [`Transport`] and [`Cancelled`], the archive could not be delivered
//! - **Bridge**: [`Producer`], [`ProducerVanished`] and [`BridgeClosed`], seen by the
//!   consumer side of a [`crate::bridge`]
//!
//! Authentication failures are not part of this enum; see [`crate::auth::AuthFailure`].
//!
//! [`Config`]: Error::Config
//! [`Traversal`]: Error::Traversal
//! [`Transport`]: Error::Transport
//! [`Cancelled`]: Error::Cancelled
//! [`Producer`]: Error::Producer
//! [`ProducerVanished`]: Error::ProducerVanished
//! [`BridgeClosed`]: Error::BridgeClosed

use std::{io, path::PathBuf};

/// Result type alias for operations that may return an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Reading an entry of the served tree failed.
    #[error("failed to read {}: {source}", path.display())]
    Traversal {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Writing the encoded archive failed.
    #[error("failed to write archive: {0}")]
    Transport(#[source] io::Error),

    /// The consumer of the archive stream went away.
    #[error("archive consumer went away")]
    Cancelled,

    /// The producer reported a failure through the bridge.
    #[error("archive producer failed: {0}")]
    Producer(#[source] Box<Error>),

    /// The producer dropped its end of the bridge without finishing the stream.
    #[error("archive producer exited without finishing the stream")]
    ProducerVanished,

    /// The bridge was used after it reached its closed state.
    #[error("stream bridge is closed")]
    BridgeClosed,

    /// Any other I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Classifies an [`io::Error`] that came out of the `tar` crate while encoding `path`.
    ///
    /// Errors raised by our own writers travel through the `tar` crate wrapped in an
    /// [`io::Error`] and are recovered here unchanged; anything else is attributed to reading
    /// `path`.
    pub(crate) fn from_io(path: impl Into<PathBuf>, err: io::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(inner) => inner,
            Err(source) => Error::Traversal {
                path: path.into(),
                source,
            },
        }
    }

    /// Wraps `self` so it can pass through APIs that only speak [`io::Error`].
    pub(crate) fn into_io(self, kind: io::ErrorKind) -> io::Error {
        io::Error::new(kind, self)
    }
}
