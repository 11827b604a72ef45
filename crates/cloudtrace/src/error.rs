/// Errors raised synchronously by client construction.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid sampling configuration: {0}")]
    InvalidSampling(#[from] sampling::Error),
}

/// Terminal outcome of an upload, as delivered to `finish_wait` callers.
///
/// Clonable because every waiter in a bundle receives the same result.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("Failed to reach the trace backend: {0}")]
    Transport(String),

    #[error("Trace backend rejected the upload with status {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("Failed to serialize the trace payload: {0}")]
    Serialize(String),

    /// The trace never made it to the transport, either because the
    /// bundler was at capacity or because the client shut down first.
    #[error("The trace was dropped before its upload completed")]
    Abandoned,
}
