//! Error types for pipeline stages and pipelines.
//!
//! A handful of variants are sentinels with stable identity:
//! [`Error::FinishEarly`] marks voluntary early success,
//! [`Error::MemoryLimitExceeded`] is the cause recorded when a memory
//! watcher kills a stage, and [`Error::ProcessInfoMissing`] is returned by
//! memory probes that run before a child process exists.

use std::process::ExitStatus;
use std::sync::Arc;
use thiserror::Error;

/// Convenient result alias using the crate error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Predicate over stage errors, used to suppress failures a caller
/// expects (see `Pipeline::add_with_ignored_error`).
pub type ErrorMatcher = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// The error type shared by stages, watchers, and pipelines.
#[derive(Debug, Error)]
pub enum Error {
    /// Returned by a stage that deliberately stopped reading its input.
    /// Treated as success by the pipeline, and suppresses the pipe error
    /// of the stage immediately upstream.
    #[error("finish stage early")]
    FinishEarly,

    /// The cause recorded when a memory watcher kills a stage.
    #[error("memory limit exceeded")]
    MemoryLimitExceeded,

    /// A memory probe ran before the stage had a child process.
    #[error("process information is missing")]
    ProcessInfoMissing,

    /// The context governing the stage was cancelled.
    #[error("context cancelled: {0}")]
    Cancelled(String),

    /// The child process exited unsuccessfully. Captured stderr is
    /// attached.
    #[error("{}", exit_summary(.status, .stderr))]
    Exit {
        /// The child's exit status.
        status: ExitStatus,
        /// Everything the child wrote to stderr.
        stderr: Vec<u8>,
    },

    /// An I/O error from a pipe, a spawn, or a copier task.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A stage could not be started; earlier stages have been torn down.
    #[error("starting pipeline stage {stage:?}: {source}")]
    StartStage {
        /// Name of the stage that failed to start.
        stage: String,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// The canonical error of a pipeline run, named after the stage the
    /// classifier selected.
    #[error("{stage}: {source}")]
    Stage {
        /// Name of the failing stage.
        stage: String,
        /// The stage's own error.
        #[source]
        source: Box<Error>,
    },

    /// A function stage panicked and a panic handler translated it.
    #[error("stage panicked: {0}")]
    Panic(String),

    /// Any other stage failure.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Creates an [`Error::Other`] from any displayable value.
    pub fn other(message: impl Into<String>) -> Self {
        Error::Other(message.into())
    }

    /// True for broken-pipe failures: writing into a closed reader,
    /// or (on unix) a child killed by SIGPIPE. These are usually a side
    /// effect of a downstream stage closing its input and are suppressed
    /// by the pipeline when that downstream stage finished early.
    pub fn is_pipe(&self) -> bool {
        match self {
            Error::Io(err) => err.kind() == std::io::ErrorKind::BrokenPipe,
            #[cfg(unix)]
            Error::Exit { status, .. } => {
                use std::os::unix::process::ExitStatusExt;
                status.signal() == Some(rustix::process::Signal::Pipe as i32)
            }
            Error::Stage { source, .. } | Error::StartStage { source, .. } => source.is_pipe(),
            _ => false,
        }
    }

    /// True for the early-finish sentinel, also when wrapped with a
    /// stage name.
    pub fn is_finish_early(&self) -> bool {
        match self {
            Error::FinishEarly => true,
            Error::Stage { source, .. } | Error::StartStage { source, .. } => {
                source.is_finish_early()
            }
            _ => false,
        }
    }
}

fn exit_summary(status: &ExitStatus, stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.is_empty() {
        format!("command exited with {status}")
    } else {
        format!("command exited with {status}: {text}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_early_is_not_a_pipe_error() {
        assert!(!Error::FinishEarly.is_pipe());
        assert!(Error::FinishEarly.is_finish_early());
    }

    #[test]
    fn test_broken_pipe_io_error_is_a_pipe_error() {
        let err = Error::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(err.is_pipe());
    }

    #[test]
    fn test_other_io_errors_are_not_pipe_errors() {
        let err = Error::from(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(!err.is_pipe());
    }

    #[test]
    fn test_stage_wrapping_preserves_pipe_classification() {
        let err = Error::Stage {
            stage: "cat".to_string(),
            source: Box::new(Error::from(std::io::Error::from(
                std::io::ErrorKind::BrokenPipe,
            ))),
        };
        assert!(err.is_pipe());
    }

    #[cfg(unix)]
    #[test]
    fn test_sigpipe_exit_is_a_pipe_error() {
        use std::os::unix::process::ExitStatusExt;

        let status = ExitStatus::from_raw(rustix::process::Signal::Pipe as i32);
        let err = Error::Exit {
            status,
            stderr: Vec::new(),
        };
        assert!(err.is_pipe());
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_error_display_includes_stderr() {
        use std::os::unix::process::ExitStatusExt;

        let status = ExitStatus::from_raw(1 << 8);
        let err = Error::Exit {
            status,
            stderr: b"no such file\n".to_vec(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("no such file"), "got: {rendered}");
    }

    #[test]
    fn test_stage_wrapping_names_the_stage() {
        let err = Error::Stage {
            stage: "grep".to_string(),
            source: Box::new(Error::other("boom")),
        };
        assert_eq!(err.to_string(), "grep: boom");
    }
}
