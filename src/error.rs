use std::fmt;

use crate::retry::RetryPollError;

/// Boxed error used for causes supplied by callers (hooks, transports, body factories).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input to request building. Never retried.
    #[error("failed to build request: {0}")]
    Construction(String),
    /// A request or response hook failed and aborted the call.
    #[error("failed to execute {phase} hook: {source}")]
    Hook {
        /// Which hook failed.
        phase: HookPhase,
        /// Error returned by the hook.
        source: BoxError,
    },
    /// Network or request execution error from the transport.
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),
    /// The call's cancellation token fired while a transport call was in flight.
    #[error("request cancelled")]
    Cancelled,
    /// A body factory failed to produce a fresh request body.
    #[error("failed to produce request body: {0}")]
    Body(#[source] BoxError),
    /// `br`/`zstd` style encoding without a registered decompressor.
    #[error("no decompressor provided for {0:?}")]
    MissingDecompressor(String),
    /// Content encoding this crate does not know how to decode.
    #[error("incompatible content encoding: {0}")]
    UnsupportedEncoding(String),
    /// Response body exceeded the processor's size limit.
    #[error("response body too large: limit {limit} bytes, got {actual} bytes")]
    BodyTooLarge { limit: usize, actual: usize },
    /// Decompression stream failed to initialize.
    #[error("decompression error: {0}")]
    Decompress(#[source] std::io::Error),
    /// Response decoding (media type, JSON, XML) error.
    #[error("decode error: {0}")]
    Decode(String),
    /// Retry poll limit exhausted without an acceptable outcome.
    #[error(transparent)]
    RetryPoll(#[from] RetryPollError),
}

impl Error {
    /// Wraps any transport failure.
    pub fn transport(err: impl Into<BoxError>) -> Self {
        Self::Transport(err.into())
    }

    /// Returns `true` if the transport reported a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Transport(inner) => inner
                .downcast_ref::<reqwest::Error>()
                .is_some_and(reqwest::Error::is_timeout),
            _ => false,
        }
    }

    /// Returns the hook's own error when this is a [`Error::Hook`] whose cause
    /// is itself an [`Error`] (as produced by [`crate::ResponseProcessor`]).
    pub fn hook_cause(&self) -> Option<&Error> {
        match self {
            Self::Hook { source, .. } => source.downcast_ref::<Error>(),
            _ => None,
        }
    }
}

/// Hook that aborted a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookPhase {
    Request,
    Response,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => f.write_str("request"),
            Self::Response => f.write_str("response"),
        }
    }
}
