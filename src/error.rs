use std::process::ExitStatus;

use thiserror::Error;

/// Failures the core distinguishes for callers. Transient I/O errors pass
/// through as `std::io::Error` inside `anyhow`; a sequence running out of
/// data is never an error and shows up as `Ok(None)` instead.
#[derive(Debug, Error)]
pub enum Error {
    /// The byte stream does not match the expected record framing.
    /// Processing of the stream is aborted.
    #[error("malformed stream: {0}")]
    MalformedStream(String),

    /// The external transcoder exited unsuccessfully. Carries everything the
    /// process wrote to its diagnostic stream.
    #[error("transcoder exited with {status}: {stderr}")]
    TranscoderFailed { status: ExitStatus, stderr: String },
}
