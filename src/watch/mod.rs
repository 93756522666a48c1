//! Memory watchers: wrap a limitable stage and poll its resident-set
//! size on a timer.
//!
//! Two adapters exist. [`memory_limit`] enforces a byte ceiling and
//! kills the stage when a sample reaches it; [`memory_observer`] only
//! records the peak and reports it when the stage is done. Both poll a
//! detached [`StageMonitor`] handle so the pipeline keeps exclusive
//! ownership of the stage itself.

use crate::context::Context;
use crate::errors::{Error, Result};
use crate::events::{EventSink, PipelineEvent};
use crate::io::{StageInput, StageOutput};
use crate::pipeline::Env;
use crate::stage::{LimitableStage, Stage, StageMonitor, StagePanicHandler, StagePreferences};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How often watchers sample memory usage.
pub const MEMORY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Wraps `stage` so that its memory use is polled every second and the
/// stage is killed with [`Error::MemoryLimitExceeded`] once a sample
/// reaches `byte_limit`.
///
/// Stages without the limitable capability are returned unchanged after
/// a misuse event.
pub fn memory_limit(
    stage: Box<dyn Stage>,
    byte_limit: u64,
    sink: Arc<dyn EventSink>,
) -> Box<dyn Stage> {
    match stage.into_limitable() {
        Ok(inner) => Box::new(MemoryWatchStage::new(
            inner,
            WatchKind::Limit(byte_limit),
            sink,
            " with memory limit",
        )),
        Err(stage) => {
            sink.emit(PipelineEvent::watch_misuse(stage.name()));
            stage
        }
    }
}

/// Wraps `stage` so that its peak memory use is tracked and reported in
/// one summary event when the stage is done.
///
/// Stages without the limitable capability are returned unchanged after
/// a misuse event.
pub fn memory_observer(stage: Box<dyn Stage>, sink: Arc<dyn EventSink>) -> Box<dyn Stage> {
    match stage.into_limitable() {
        Ok(inner) => Box::new(MemoryWatchStage::new(inner, WatchKind::Observe, sink, "")),
        Err(stage) => {
            sink.emit(PipelineEvent::watch_misuse(stage.name()));
            stage
        }
    }
}

enum WatchKind {
    Limit(u64),
    Observe,
}

struct MemoryWatchStage {
    name: String,
    inner: Box<dyn LimitableStage>,
    kind: Option<WatchKind>,
    sink: Arc<dyn EventSink>,
    watch_ctx: Option<Context>,
    watch_task: Option<JoinHandle<()>>,
}

impl MemoryWatchStage {
    fn new(
        inner: Box<dyn LimitableStage>,
        kind: WatchKind,
        sink: Arc<dyn EventSink>,
        name_suffix: &str,
    ) -> Self {
        let name = format!("{}{}", inner.name(), name_suffix);
        Self {
            name,
            inner,
            kind: Some(kind),
            sink,
            watch_ctx: None,
            watch_task: None,
        }
    }

    async fn stop_watching(&mut self) {
        if let Some(ctx) = self.watch_ctx.take() {
            ctx.cancel("stage finished");
        }
        if let Some(task) = self.watch_task.take() {
            let _ = task.await;
        }
    }
}

#[async_trait]
impl Stage for MemoryWatchStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn preferences(&self) -> StagePreferences {
        self.inner.preferences()
    }

    async fn start(
        &mut self,
        ctx: Context,
        env: Env,
        stdin: StageInput,
        stdout: StageOutput,
    ) -> Result<()> {
        self.inner.start(ctx.clone(), env, stdin, stdout).await?;

        let watch_ctx = ctx.child();
        let monitor = self.inner.monitor();
        let kind = self.kind.take().expect("watch stage started twice");
        let sink = Arc::clone(&self.sink);
        let name = self.name.clone();

        self.watch_ctx = Some(watch_ctx.clone());
        self.watch_task = Some(tokio::spawn(async move {
            match kind {
                WatchKind::Limit(limit) => watch_limit(watch_ctx, monitor, &name, limit, &sink).await,
                WatchKind::Observe => watch_peak(watch_ctx, monitor, &name, &sink).await,
            }
        }));
        Ok(())
    }

    async fn wait(&mut self) -> Result<()> {
        let result = self.inner.wait().await;
        self.stop_watching().await;
        result
    }

    fn set_panic_handler(&mut self, handler: StagePanicHandler) {
        self.inner.set_panic_handler(handler);
    }

    fn into_limitable(
        self: Box<Self>,
    ) -> std::result::Result<Box<dyn LimitableStage>, Box<dyn Stage>> {
        Ok(self)
    }
}

impl LimitableStage for MemoryWatchStage {
    fn monitor(&self) -> Arc<dyn StageMonitor> {
        self.inner.monitor()
    }
}

async fn watch_limit(
    ctx: Context,
    monitor: Arc<dyn StageMonitor>,
    name: &str,
    limit: u64,
    sink: &Arc<dyn EventSink>,
) {
    let mut consecutive_errors = 0u32;
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + MEMORY_POLL_INTERVAL,
        MEMORY_POLL_INTERVAL,
    );

    loop {
        tokio::select! {
            () = ctx.cancelled() => return,
            _ = ticker.tick() => match monitor.memory_usage(&ctx) {
                Err(err) => {
                    consecutive_errors += 1;
                    if consecutive_errors == 2 {
                        sink.emit(PipelineEvent::rss_read_error(name, &err));
                    }
                }
                Ok(rss) => {
                    consecutive_errors = 0;
                    if rss >= limit {
                        sink.emit(PipelineEvent::memory_exceeded(name, limit, rss));
                        monitor.kill(Error::MemoryLimitExceeded);
                        return;
                    }
                }
            },
        }
    }
}

async fn watch_peak(
    ctx: Context,
    monitor: Arc<dyn StageMonitor>,
    name: &str,
    sink: &Arc<dyn EventSink>,
) {
    let mut peak = 0u64;
    let mut samples = 0u64;
    let mut errors = 0u64;
    let mut consecutive_errors = 0u32;
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + MEMORY_POLL_INTERVAL,
        MEMORY_POLL_INTERVAL,
    );

    loop {
        tokio::select! {
            () = ctx.cancelled() => {
                sink.emit(PipelineEvent::peak_memory(name, peak, samples, errors));
                return;
            }
            _ = ticker.tick() => match monitor.memory_usage(&ctx) {
                Err(err) => {
                    errors += 1;
                    consecutive_errors += 1;
                    // One event per losing streak, re-armed by a success.
                    if consecutive_errors == 2 {
                        sink.emit(PipelineEvent::rss_read_error(name, &err));
                    }
                }
                Ok(rss) => {
                    consecutive_errors = 0;
                    samples += 1;
                    peak = peak.max(rss);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::stage::function::FunctionStage;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct FakeMonitor {
        rss: AtomicU64,
        fail: std::sync::atomic::AtomicBool,
        killed_with: Mutex<Option<Error>>,
    }

    impl StageMonitor for FakeMonitor {
        fn memory_usage(&self, _ctx: &Context) -> Result<u64> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::other("probe failed"));
            }
            Ok(self.rss.fetch_add(100, Ordering::SeqCst))
        }

        fn kill(&self, cause: Error) {
            *self.killed_with.lock() = Some(cause);
        }
    }

    struct FakeLimitable {
        monitor: Arc<FakeMonitor>,
    }

    #[async_trait]
    impl Stage for FakeLimitable {
        fn name(&self) -> &str {
            "fake"
        }

        fn preferences(&self) -> StagePreferences {
            StagePreferences::default()
        }

        async fn start(
            &mut self,
            _ctx: Context,
            _env: Env,
            _stdin: StageInput,
            _stdout: StageOutput,
        ) -> Result<()> {
            Ok(())
        }

        async fn wait(&mut self) -> Result<()> {
            Ok(())
        }

        fn into_limitable(
            self: Box<Self>,
        ) -> std::result::Result<Box<dyn LimitableStage>, Box<dyn Stage>> {
            Ok(self)
        }
    }

    impl LimitableStage for FakeLimitable {
        fn monitor(&self) -> Arc<dyn StageMonitor> {
            Arc::clone(&self.monitor) as Arc<dyn StageMonitor>
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_watcher_kills_on_breach() {
        let monitor = Arc::new(FakeMonitor::default());
        monitor.rss.store(5_000, Ordering::SeqCst);
        let sink: Arc<CollectingEventSink> = Arc::new(CollectingEventSink::new());

        let ctx = Context::new();
        let watcher = tokio::spawn(watch_limit_owned(
            ctx.clone(),
            Arc::clone(&monitor) as Arc<dyn StageMonitor>,
            1_000,
            Arc::clone(&sink) as Arc<dyn EventSink>,
        ));
        watcher.await.expect("watcher should stop after the kill");

        let killed = monitor.killed_with.lock().take();
        assert!(matches!(killed, Some(Error::MemoryLimitExceeded)));
        let events = sink.with_msg("stage exceeded allowed memory use");
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].context.get("limit"),
            Some(&serde_json::json!(1_000))
        );
    }

    async fn watch_limit_owned(
        ctx: Context,
        monitor: Arc<dyn StageMonitor>,
        limit: u64,
        sink: Arc<dyn EventSink>,
    ) {
        watch_limit(ctx, monitor, "fake", limit, &sink).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_watcher_debounces_probe_errors() {
        let monitor = Arc::new(FakeMonitor::default());
        monitor.fail.store(true, Ordering::SeqCst);
        let sink: Arc<CollectingEventSink> = Arc::new(CollectingEventSink::new());

        let ctx = Context::new();
        let watcher = {
            let ctx = ctx.clone();
            let monitor = Arc::clone(&monitor) as Arc<dyn StageMonitor>;
            let sink = Arc::clone(&sink) as Arc<dyn EventSink>;
            tokio::spawn(async move { watch_limit(ctx, monitor, "fake", 1_000, &sink).await })
        };

        tokio::time::sleep(Duration::from_millis(4_500)).await;
        ctx.cancel("test over");
        watcher.await.expect("watcher should stop on cancel");

        // Four failed samples, one event.
        assert_eq!(sink.with_msg("error reading memory usage").len(), 1);
        assert!(monitor.killed_with.lock().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_reports_peak_on_cancellation() {
        let monitor = Arc::new(FakeMonitor::default());
        monitor.rss.store(1_000, Ordering::SeqCst);
        let sink: Arc<CollectingEventSink> = Arc::new(CollectingEventSink::new());

        let ctx = Context::new();
        let watcher = {
            let ctx = ctx.clone();
            let monitor = Arc::clone(&monitor) as Arc<dyn StageMonitor>;
            let sink = Arc::clone(&sink) as Arc<dyn EventSink>;
            tokio::spawn(async move { watch_peak(ctx, monitor, "fake", &sink).await })
        };

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        ctx.cancel("test over");
        watcher.await.expect("watcher should stop on cancel");

        let events = sink.with_msg("peak memory usage");
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].context.get("samples"),
            Some(&serde_json::json!(3))
        );
        // Samples were 1000, 1100, 1200.
        assert_eq!(
            events[0].context.get("max_rss_bytes"),
            Some(&serde_json::json!(1_200))
        );
    }

    #[tokio::test]
    async fn test_watching_a_function_stage_is_a_misuse() {
        let sink = Arc::new(CollectingEventSink::new());
        let stage = FunctionStage::new("fn", |_ctx, _env, _io| Box::pin(async move { Ok(()) }));

        let wrapped = memory_limit(
            Box::new(stage),
            1_000,
            Arc::clone(&sink) as Arc<dyn EventSink>,
        );

        assert_eq!(wrapped.name(), "fn");
        assert_eq!(sink.with_msg("invalid memory watch usage").len(), 1);
    }

    #[tokio::test]
    async fn test_limit_wrapper_extends_the_stage_name() {
        let sink = Arc::new(CollectingEventSink::new());
        let stage = FakeLimitable {
            monitor: Arc::new(FakeMonitor::default()),
        };

        let wrapped = memory_limit(
            Box::new(stage),
            1_000,
            Arc::clone(&sink) as Arc<dyn EventSink>,
        );
        assert_eq!(wrapped.name(), "fake with memory limit");
        assert!(sink.is_empty());

        let observed = memory_observer(wrapped, Arc::clone(&sink) as Arc<dyn EventSink>);
        assert_eq!(observed.name(), "fake with memory limit");
    }
}
