//! Command stages: pipeline stages backed by child processes.
//!
//! The stage translates its endpoints into child stdio. Real file
//! endpoints go straight to the child; everything else gets a kernel
//! pipe from the standard library plus a copier task on our side.
//! Stderr is always drained into a buffer that is attached to exit
//! errors. The child runs in its own process group where the platform
//! supports it, so a kill reaches the whole tree.

use crate::context::Context;
use crate::errors::{Error, Result};
use crate::io::{DynRead, DynWrite, StageInput, StageOutput};
use crate::isolation::IsolationPolicy;
use crate::pipeline::Env;
use crate::stage::{IoPreference, LimitableStage, Stage, StageMonitor, StagePreferences};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::ffi::OsStr;
use std::io;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A pipeline stage that runs an external command, streaming data
/// through its stdin and stdout.
///
/// Stderr is captured and attached to any exit error. If the stage's
/// context is cancelled while the child runs, the child's process group
/// is terminated and the cancellation cause is reported from [`wait`]
/// instead of the raw signal exit.
///
/// [`wait`]: Stage::wait
pub struct CommandStage {
    name: String,
    cmd: Option<std::process::Command>,
    child: Option<tokio::process::Child>,
    process: Arc<ProcessHandle>,
    ctx: Option<Context>,
    stderr_task: Option<JoinHandle<io::Result<Vec<u8>>>>,
    stdin_copier: Option<JoinHandle<io::Result<()>>>,
    stdout_copier: Option<JoinHandle<io::Result<()>>>,
    done_tx: Option<oneshot::Sender<()>>,
    watchdog: Option<JoinHandle<()>>,
    isolation: Option<Box<dyn IsolationPolicy>>,
}

/// State shared between the stage, its watchdog, and any watchers.
#[derive(Default)]
struct ProcessHandle {
    pid: OnceLock<u32>,
    cause: Mutex<Option<Error>>,
}

impl ProcessHandle {
    /// Records `cause` (first one wins) and terminates the process
    /// group. Does nothing when the child was never spawned.
    fn kill(&self, cause: Error) {
        let Some(&pid) = self.pid.get() else { return };
        {
            let mut slot = self.cause.lock();
            if slot.is_none() {
                *slot = Some(cause);
            }
        }
        terminate_group(pid);
    }

    fn take_cause(&self) -> Option<Error> {
        self.cause.lock().take()
    }
}

#[cfg(unix)]
fn terminate_group(pid: u32) {
    use rustix::process::{kill_process_group, Pid, Signal};

    let Some(pgid) = Pid::from_raw(pid as i32) else {
        return;
    };
    // SIGTERM rather than SIGKILL, so the child can clean up.
    if let Err(err) = kill_process_group(pgid, Signal::Term) {
        tracing::debug!(pid, %err, "failed to signal process group");
    }
}

#[cfg(not(unix))]
fn terminate_group(_pid: u32) {}

#[cfg(unix)]
fn killed_by_us(status: std::process::ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;

    let term = rustix::process::Signal::Term as i32;
    let kill = rustix::process::Signal::Kill as i32;
    matches!(status.signal(), Some(sig) if sig == term || sig == kill)
}

#[cfg(not(unix))]
fn killed_by_us(_status: std::process::ExitStatus) -> bool {
    false
}

impl CommandStage {
    /// Creates a stage that runs `program` with `args`. The stage is
    /// named after the program.
    ///
    /// # Panics
    ///
    /// Panics if `program` is empty.
    pub fn new<S, I, A>(program: S, args: I) -> Self
    where
        S: AsRef<OsStr>,
        I: IntoIterator<Item = A>,
        A: AsRef<OsStr>,
    {
        let program = program.as_ref();
        assert!(
            !program.is_empty(),
            "attempt to create a command stage with an empty program"
        );
        let name = program.to_string_lossy().into_owned();
        let mut cmd = std::process::Command::new(program);
        cmd.args(args);
        Self::from_command(name, cmd)
    }

    /// Wraps a prepared command under an explicit stage name.
    ///
    /// The pipeline fills in the working directory and environment
    /// overrides only where the command does not set its own.
    pub fn from_command(name: impl Into<String>, cmd: std::process::Command) -> Self {
        Self {
            name: name.into(),
            cmd: Some(cmd),
            child: None,
            process: Arc::new(ProcessHandle::default()),
            ctx: None,
            stderr_task: None,
            stdin_copier: None,
            stdout_copier: None,
            done_tx: None,
            watchdog: None,
            isolation: None,
        }
    }

    /// Attaches an isolation policy. Its `setup` runs right after spawn
    /// with the child's pid; a setup failure aborts the stage start and
    /// kills the child. `teardown` runs after the child is reaped.
    #[must_use]
    pub fn with_isolation(mut self, policy: Box<dyn IsolationPolicy>) -> Self {
        self.isolation = Some(policy);
        self
    }

    /// Records `cause` and terminates the child's process group. Does
    /// nothing when the child was never spawned.
    pub fn kill(&self, cause: Error) {
        self.process.kill(cause);
    }

    /// Pid of the spawned child, if any.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.process.pid.get().copied()
    }
}

#[async_trait]
impl Stage for CommandStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn preferences(&self) -> StagePreferences {
        StagePreferences {
            stdin: IoPreference::File,
            stdout: IoPreference::File,
        }
    }

    async fn start(
        &mut self,
        ctx: Context,
        env: Env,
        stdin: StageInput,
        stdout: StageOutput,
    ) -> Result<()> {
        let mut cmd = self.cmd.take().expect("command stage started twice");

        if cmd.get_current_dir().is_none() {
            if let Some(dir) = env.dir() {
                cmd.current_dir(dir);
            }
        }
        // Later overrides replace earlier ones with the same key, and
        // all of them layer over the inherited process environment.
        for var in env.materialize(&ctx) {
            cmd.env(var.key, var.value);
        }

        let mut stdin_source: Option<DynRead> = None;
        match stdin {
            StageInput::Null => {
                cmd.stdin(Stdio::null());
            }
            StageInput::File(file) => {
                // The child gets the descriptor; our copy goes with the
                // spawn.
                cmd.stdin(Stdio::from(file));
            }
            StageInput::SharedFile(file) => {
                let dup = file.try_clone().map_err(Error::from)?;
                cmd.stdin(Stdio::from(dup));
            }
            StageInput::Reader(reader) | StageInput::NopReader(reader) => {
                cmd.stdin(Stdio::piped());
                stdin_source = Some(reader);
            }
        }

        let mut stdout_sink: Option<(DynWrite, bool)> = None;
        match stdout {
            StageOutput::Null => {
                cmd.stdout(Stdio::null());
            }
            StageOutput::File(file) => {
                cmd.stdout(Stdio::from(file));
            }
            StageOutput::SharedFile(file) => {
                let dup = file.try_clone().map_err(Error::from)?;
                cmd.stdout(Stdio::from(dup));
            }
            StageOutput::Writer(writer) => {
                cmd.stdout(Stdio::piped());
                stdout_sink = Some((writer, true));
            }
            StageOutput::NopWriter(writer) => {
                cmd.stdout(Stdio::piped());
                stdout_sink = Some((writer, false));
            }
        }

        cmd.stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = tokio::process::Command::from(cmd).spawn()?;
        let pid = child.id().unwrap_or_default();
        let _ = self.process.pid.set(pid);

        if let Some(policy) = self.isolation.as_mut() {
            if let Err(err) = policy.setup(&ctx, pid).await {
                terminate_group(pid);
                let _ = child.wait().await;
                return Err(err);
            }
        }

        let mut stderr_pipe = child.stderr.take().expect("stderr was piped");
        self.stderr_task = Some(tokio::spawn(async move {
            let mut buf = Vec::new();
            match stderr_pipe.read_to_end(&mut buf).await {
                Ok(_) => Ok(buf),
                Err(err) => Err(err),
            }
        }));

        if let Some(mut source) = stdin_source {
            let mut sink = child.stdin.take().expect("stdin was piped");
            self.stdin_copier = Some(tokio::spawn(async move {
                let copied = tokio::io::copy(&mut source, &mut sink).await;
                let _ = sink.shutdown().await;
                match copied {
                    Ok(_) => Ok(()),
                    // The child stopped reading. That is its business,
                    // not this stage's failure.
                    Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                    Err(err) => Err(err),
                }
            }));
        }

        if let Some((mut sink, close)) = stdout_sink {
            let mut source = child.stdout.take().expect("stdout was piped");
            self.stdout_copier = Some(tokio::spawn(async move {
                let copied = tokio::io::copy(&mut source, &mut sink).await;
                let finished = if close {
                    sink.shutdown().await
                } else {
                    sink.flush().await
                };
                copied.map(drop).and(finished)
            }));
        }

        let (done_tx, done_rx) = oneshot::channel::<()>();
        self.done_tx = Some(done_tx);
        let process = Arc::clone(&self.process);
        let watch_ctx = ctx.clone();
        self.watchdog = Some(tokio::spawn(async move {
            tokio::select! {
                () = watch_ctx.cancelled() => {
                    let cause = watch_ctx
                        .err()
                        .unwrap_or_else(|| Error::Cancelled("context cancelled".into()));
                    process.kill(cause);
                }
                _ = done_rx => {}
            }
        }));

        self.ctx = Some(ctx);
        self.child = Some(child);
        Ok(())
    }

    async fn wait(&mut self) -> Result<()> {
        let mut child = self.child.take().expect("wait called before start");

        // Stderr must be fully drained before the exit error is built.
        let drained = match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_else(|_| Ok(Vec::new())),
            None => Ok(Vec::new()),
        };
        let (stderr_buf, drain_err) = match drained {
            Ok(buf) => (buf, None),
            Err(err) => (Vec::new(), Some(Error::from(err))),
        };

        let status = child.wait().await;

        if let Some(done) = self.done_tx.take() {
            let _ = done.send(());
        }
        if let Some(watchdog) = self.watchdog.take() {
            let _ = watchdog.await;
        }

        // The stdout copier ends at the child's EOF; the stdin copier
        // ends once the child's stdin collapses.
        let mut copier_err: Option<Error> = None;
        for task in [self.stdout_copier.take(), self.stdin_copier.take()]
            .into_iter()
            .flatten()
        {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if copier_err.is_none() {
                        copier_err = Some(Error::from(err));
                    }
                }
                Err(_) => {}
            }
        }

        let mut result = match status {
            Err(err) => Err(Error::from(err)),
            Ok(status) if status.success() => Ok(()),
            Ok(status) => {
                let cause = if killed_by_us(status) {
                    self.process.take_cause()
                } else {
                    None
                };
                match cause {
                    Some(cause) => Err(cause),
                    None => Err(Error::Exit {
                        status,
                        stderr: stderr_buf,
                    }),
                }
            }
        };

        if result.is_ok() {
            if let Some(err) = drain_err.or(copier_err) {
                result = Err(err);
            }
        }

        if let Some(policy) = self.isolation.as_mut() {
            let ctx = self.ctx.clone().unwrap_or_default();
            let teardown = policy.teardown(&ctx).await;
            if result.is_ok() {
                result = teardown;
            }
        }

        result
    }

    fn into_limitable(
        self: Box<Self>,
    ) -> std::result::Result<Box<dyn LimitableStage>, Box<dyn Stage>> {
        Ok(self)
    }
}

impl LimitableStage for CommandStage {
    fn monitor(&self) -> Arc<dyn StageMonitor> {
        Arc::new(CommandMonitor {
            process: Arc::clone(&self.process),
        })
    }
}

struct CommandMonitor {
    process: Arc<ProcessHandle>,
}

impl StageMonitor for CommandMonitor {
    fn memory_usage(&self, _ctx: &Context) -> Result<u64> {
        let Some(&pid) = self.process.pid.get() else {
            return Err(Error::ProcessInfoMissing);
        };
        #[cfg(target_os = "linux")]
        {
            crate::ptree::process_tree_rss_anon(pid)
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = pid;
            Err(Error::other("memory sampling is only supported on linux"))
        }
    }

    fn kill(&self, cause: Error) {
        self.process.kill(cause);
    }
}
