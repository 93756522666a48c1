//! Inter-stage connections and the close regimes attached to them.
//!
//! Every endpoint a stage receives is one of a small set of variants,
//! and the variant decides who closes what:
//!
//! * `File` endpoints are kernel pipe ends. The stage owns them;
//!   dropping one closes the descriptor. A command stage hands the
//!   descriptor straight to its child and lets its own copy go at spawn.
//! * `SharedFile` endpoints are caller-owned descriptors. A stage may
//!   duplicate the descriptor for a child but must leave the caller's
//!   handle open.
//! * `Reader`/`Writer` endpoints are in-process halves the stage owns.
//!   Writers are shut down when the stage is done so the reader side
//!   sees end-of-file; readers are simply dropped, which makes further
//!   writes upstream fail with a broken pipe.
//! * `NopReader`/`NopWriter` endpoints belong to the caller. Stages read
//!   and write them but never shut them down; a writer is flushed at
//!   most.
//!
//! The distinction matters for command stages in particular: a child
//! process fed from a non-file endpoint needs a copier task, and that
//! task lives until its source is exhausted. Handing the child a real
//! descriptor avoids the copier entirely, which is why pipes next to a
//! command stage are kernel pipes (see the pipeline's selection rule).

use std::fs::File;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use tokio::io::{AsyncRead, AsyncWrite};

/// Boxed reader used for in-process stage input.
pub type DynRead = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed writer used for in-process stage output.
pub type DynWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Buffer capacity of an in-process pipe.
const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// The stdin end handed to a stage by the pipeline.
pub enum StageInput {
    /// The stage receives no input.
    Null,
    /// A kernel pipe endpoint owned by the stage.
    File(File),
    /// A caller-owned file. The descriptor may be duplicated for a
    /// child process; the caller's handle stays open.
    SharedFile(Arc<File>),
    /// An in-process reader owned by the stage.
    Reader(DynRead),
    /// A caller-owned reader the stage must not shut down.
    NopReader(DynRead),
}

impl StageInput {
    /// True when no input is connected.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, StageInput::Null)
    }

    /// Converts the endpoint into an async reader for in-process use.
    ///
    /// File-backed variants are re-opened as `tokio::fs::File`; shared
    /// files are duplicated first so the caller's handle stays open.
    ///
    /// # Errors
    ///
    /// Fails when a shared descriptor cannot be duplicated.
    pub fn into_reader(self) -> io::Result<Option<DynRead>> {
        match self {
            StageInput::Null => Ok(None),
            StageInput::File(file) => Ok(Some(Box::new(tokio::fs::File::from_std(file)))),
            StageInput::SharedFile(file) => {
                let dup = file.try_clone()?;
                Ok(Some(Box::new(tokio::fs::File::from_std(dup))))
            }
            StageInput::Reader(reader) | StageInput::NopReader(reader) => Ok(Some(reader)),
        }
    }
}

impl std::fmt::Debug for StageInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            StageInput::Null => "Null",
            StageInput::File(_) => "File",
            StageInput::SharedFile(_) => "SharedFile",
            StageInput::Reader(_) => "Reader",
            StageInput::NopReader(_) => "NopReader",
        };
        f.debug_tuple("StageInput").field(&kind).finish()
    }
}

/// The stdout end handed to a stage by the pipeline.
pub enum StageOutput {
    /// The stage produces no output.
    Null,
    /// A kernel pipe endpoint owned by the stage.
    File(File),
    /// A caller-owned file. The descriptor may be duplicated for a
    /// child process; the caller's handle stays open.
    SharedFile(Arc<File>),
    /// An in-process writer owned by the stage. Shut down when the
    /// stage is done, so downstream sees end-of-file.
    Writer(DynWrite),
    /// A caller-owned writer the stage flushes but never shuts down.
    NopWriter(DynWrite),
}

impl StageOutput {
    /// True when no output is connected.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, StageOutput::Null)
    }

    /// Converts the endpoint into an async writer plus its close regime:
    /// `true` means the user of the writer must shut it down when done.
    ///
    /// # Errors
    ///
    /// Fails when a shared descriptor cannot be duplicated.
    pub fn into_writer(self) -> io::Result<Option<(DynWrite, bool)>> {
        match self {
            StageOutput::Null => Ok(None),
            StageOutput::File(file) => Ok(Some((Box::new(tokio::fs::File::from_std(file)), true))),
            StageOutput::SharedFile(file) => {
                let dup = file.try_clone()?;
                Ok(Some((Box::new(tokio::fs::File::from_std(dup)), true)))
            }
            StageOutput::Writer(writer) => Ok(Some((writer, true))),
            StageOutput::NopWriter(writer) => Ok(Some((writer, false))),
        }
    }
}

impl std::fmt::Debug for StageOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            StageOutput::Null => "Null",
            StageOutput::File(_) => "File",
            StageOutput::SharedFile(_) => "SharedFile",
            StageOutput::Writer(_) => "Writer",
            StageOutput::NopWriter(_) => "NopWriter",
        };
        f.debug_tuple("StageOutput").field(&kind).finish()
    }
}

/// Creates a kernel pipe, returning its (read, write) ends as files.
///
/// # Errors
///
/// Fails when the pipe cannot be created, or on platforms without
/// kernel pipes.
pub fn os_pipe() -> io::Result<(File, File)> {
    #[cfg(unix)]
    {
        let (read, write) = rustix::pipe::pipe()?;
        Ok((File::from(read), File::from(write)))
    }
    #[cfg(not(unix))]
    {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "kernel pipes require a unix platform",
        ))
    }
}

/// Creates an in-process pipe with a bounded buffer.
///
/// Dropping the writer makes the reader see end-of-file; dropping the
/// reader makes further writes fail with a broken pipe.
#[must_use]
pub fn in_process_pipe() -> (DynRead, DynWrite) {
    let (read, write) = tokio::io::simplex(PIPE_BUFFER_SIZE);
    (Box::new(read), Box::new(write))
}

/// An in-memory stdout target that can be read back after the run.
///
/// Cloning shares the underlying buffer, so a caller can keep one handle
/// and give the other to the pipeline.
#[derive(Clone, Debug, Default)]
pub struct SharedBuffer {
    inner: Arc<parking_lot::Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies out the collected bytes.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().clone()
    }

    /// Takes the collected bytes, leaving the buffer empty.
    #[must_use]
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.inner.lock())
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.inner.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
