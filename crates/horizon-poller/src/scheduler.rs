//! Polling scheduler.
//!
//! Keeps exactly one poll task per enabled poll-mode agent. The task set is
//! reconciled against the directory on a fixed cadence and whenever the
//! directory reports a change.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use horizon_core::{
    AgentDirectory, AgentId, AgentIdentity, MetricsSink, Settings, traits::DirectoryError,
};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::client::{MetricsSource, PollError};

/// Scheduler timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Interval for agents that do not set one.
    pub default_interval: Duration,
    /// Bound on a single pull.
    pub poll_timeout: Duration,
    /// Cadence of the reconciliation pass.
    pub reconcile_interval: Duration,
}

impl From<&Settings> for PollConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            default_interval: settings.default_poll_interval(),
            poll_timeout: settings.poll_timeout(),
            reconcile_interval: settings.reconcile_interval(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<AgentId>,
    pub stopped: Vec<AgentId>,
    pub rescheduled: Vec<AgentId>,
}

impl ReconcileReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty() && self.rescheduled.is_empty()
    }
}

/// Parameters a running task was started with.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TaskKey {
    interval: Duration,
    address: String,
    port: Option<u16>,
}

struct PollTask {
    key: TaskKey,
    handle: JoinHandle<()>,
}

/// Polling scheduler.
pub struct PollScheduler {
    directory: Arc<dyn AgentDirectory>,
    source: Arc<dyn MetricsSource>,
    sink: Arc<dyn MetricsSink>,
    config: PollConfig,
    tasks: Mutex<HashMap<AgentId, PollTask>>,
}

impl PollScheduler {
    #[must_use]
    pub fn new(
        directory: Arc<dyn AgentDirectory>,
        source: Arc<dyn MetricsSource>,
        sink: Arc<dyn MetricsSink>,
        config: PollConfig,
    ) -> Self {
        Self {
            directory,
            source,
            sink,
            config,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn key(&self, agent: &AgentIdentity) -> TaskKey {
        TaskKey {
            interval: agent.poll_interval(self.config.default_interval),
            address: agent.address.clone(),
            port: agent.port,
        }
    }

    fn spawn_task(&self, agent: AgentIdentity) -> PollTask {
        let key = self.key(&agent);
        tracing::info!(
            agent_id = agent.id,
            interval_ms = u64::try_from(key.interval.as_millis()).unwrap_or(u64::MAX),
            "Starting poll task"
        );
        let handle = tokio::spawn(poll_loop(
            agent,
            key.interval,
            self.config.poll_timeout,
            Arc::clone(&self.source),
            Arc::clone(&self.sink),
        ));
        PollTask { key, handle }
    }

    /// Bring the task set in line with the directory.
    ///
    /// # Errors
    /// Returns error if the roster cannot be read; running tasks are left
    /// untouched in that case.
    pub async fn reconcile(&self) -> Result<ReconcileReport, DirectoryError> {
        let wanted: HashMap<AgentId, AgentIdentity> = self
            .directory
            .find_enabled()
            .await?
            .into_iter()
            .filter(AgentIdentity::wants_polling)
            .map(|agent| (agent.id, agent))
            .collect();

        let mut report = ReconcileReport::default();
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);

        tasks.retain(|agent_id, task| {
            if wanted.contains_key(agent_id) {
                return true;
            }
            task.handle.abort();
            report.stopped.push(*agent_id);
            false
        });

        for (agent_id, agent) in wanted {
            let unchanged = tasks.get(&agent_id).map(|t| t.key == self.key(&agent));
            match unchanged {
                Some(true) => {}
                Some(false) => {
                    if let Some(old) = tasks.insert(agent_id, self.spawn_task(agent)) {
                        old.handle.abort();
                    }
                    report.rescheduled.push(agent_id);
                }
                None => {
                    tasks.insert(agent_id, self.spawn_task(agent));
                    report.started.push(agent_id);
                }
            }
        }
        drop(tasks);

        report.started.sort_unstable();
        report.stopped.sort_unstable();
        report.rescheduled.sort_unstable();
        for agent_id in &report.stopped {
            tracing::info!(agent_id, "Stopped poll task");
        }
        if !report.is_empty() {
            tracing::debug!(?report, "Poll tasks reconciled");
        }
        Ok(report)
    }

    /// Restart one agent's task from its current directory entry.
    ///
    /// Other agents' tasks are not touched. Returns whether a task is
    /// running for the agent afterwards.
    ///
    /// # Errors
    /// Returns error if the agent cannot be looked up.
    pub async fn reschedule(&self, agent_id: AgentId) -> Result<bool, DirectoryError> {
        let agent = self
            .directory
            .find_by_id(agent_id)
            .await?
            .filter(AgentIdentity::wants_polling);

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = tasks.remove(&agent_id) {
            old.handle.abort();
        }
        let Some(agent) = agent else {
            return Ok(false);
        };
        tasks.insert(agent_id, self.spawn_task(agent));
        Ok(true)
    }

    /// Whether a poll task is running for the agent.
    #[must_use]
    pub fn is_polling(&self, agent_id: AgentId) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&agent_id)
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Agents with a poll task, sorted.
    #[must_use]
    pub fn polled_agents(&self) -> Vec<AgentId> {
        let mut ids: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Abort every poll task.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, task) in tasks.drain() {
            task.handle.abort();
        }
    }

    /// Reconcile now, then on every tick and directory change until cancelled.
    pub fn run(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.reconcile_interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut changes = self.directory.changes();

            self.reconcile_logged().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => self.reconcile_logged().await,
                    alive = next_change(&mut changes) => {
                        if alive {
                            self.reconcile_logged().await;
                        } else {
                            changes = None;
                        }
                    }
                }
            }

            self.shutdown();
            tracing::info!("Poll scheduler stopped");
        })
    }

    async fn reconcile_logged(&self) {
        if let Err(e) = self.reconcile().await {
            tracing::warn!("Poll reconciliation failed: {e}");
        }
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Resolves on the next directory revision; never when there is no feed.
async fn next_change(changes: &mut Option<watch::Receiver<u64>>) -> bool {
    match changes {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

async fn poll_loop(
    agent: AgentIdentity,
    interval: Duration,
    timeout: Duration,
    source: Arc<dyn MetricsSource>,
    sink: Arc<dyn MetricsSink>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        poll_once(&agent, timeout, source.as_ref(), sink.as_ref()).await;
    }
}

/// One bounded pull, written through the sink on success.
///
/// Failures are logged; the caller just waits for its next tick.
pub async fn poll_once(
    agent: &AgentIdentity,
    timeout: Duration,
    source: &dyn MetricsSource,
    sink: &dyn MetricsSink,
) -> bool {
    let fetched = match tokio::time::timeout(timeout, source.fetch(agent)).await {
        Ok(result) => result,
        Err(_) => Err(PollError::Timeout(timeout)),
    };
    let sample = match fetched {
        Ok(sample) => sample,
        Err(e) => {
            tracing::warn!(agent_id = agent.id, address = %agent.address, "Poll failed: {e}");
            return false;
        }
    };

    match sink.ingest(agent.id, sample).await {
        Ok(_) => {
            tracing::debug!(agent_id = agent.id, "Polled metrics ingested");
            true
        }
        Err(e) => {
            tracing::warn!(agent_id = agent.id, "Polled metrics rejected: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use horizon_core::{MetricsError, MetricsSample, RealtimeSnapshot};
    use horizon_session::storage::MemoryDirectory;

    use super::*;

    /// Source answering instantly, optionally failing the first `fail_first` pulls.
    #[derive(Default)]
    struct FakeSource {
        calls: AtomicUsize,
        fail_first: usize,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl MetricsSource for FakeSource {
        async fn fetch(&self, _agent: &AgentIdentity) -> Result<MetricsSample, PollError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if n < self.fail_first {
                return Err(PollError::Status(500));
            }
            Ok(MetricsSample {
                cpu_usage: 10.0,
                ..MetricsSample::default()
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        ingested: Mutex<Vec<AgentId>>,
    }

    impl RecordingSink {
        fn count(&self) -> usize {
            self.ingested.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl MetricsSink for RecordingSink {
        async fn ingest(
            &self,
            agent_id: AgentId,
            sample: MetricsSample,
        ) -> Result<RealtimeSnapshot, MetricsError> {
            self.ingested.lock().unwrap().push(agent_id);
            let identity = AgentIdentity::new(agent_id, "a", "10.0.0.1");
            Ok(RealtimeSnapshot::online(
                &identity,
                &sample,
                chrono::Utc::now(),
            ))
        }
    }

    fn config() -> PollConfig {
        PollConfig {
            default_interval: Duration::from_secs(1),
            poll_timeout: Duration::from_secs(3),
            reconcile_interval: Duration::from_secs(30),
        }
    }

    fn polled(id: AgentId, interval_ms: u64) -> AgentIdentity {
        AgentIdentity::new(id, format!("agent-{id}"), format!("10.0.0.{id}")).polled_every(interval_ms)
    }

    fn scheduler(
        directory: &Arc<MemoryDirectory>,
        source: Arc<FakeSource>,
        sink: &Arc<RecordingSink>,
    ) -> Arc<PollScheduler> {
        Arc::new(PollScheduler::new(
            Arc::clone(directory) as Arc<dyn AgentDirectory>,
            source,
            Arc::clone(sink) as Arc<dyn MetricsSink>,
            config(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_follows_enabled_set() {
        let mut b = polled(2, 1000);
        b.enabled = false;
        let directory = Arc::new(MemoryDirectory::with_agents([polled(1, 1000), b]));
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(&directory, Arc::new(FakeSource::default()), &sink);

        let report = scheduler.reconcile().await.unwrap();
        assert_eq!(report.started, vec![1]);
        assert!(scheduler.is_polling(1));
        assert!(!scheduler.is_polling(2));

        directory.set_enabled(2, true);
        directory.set_enabled(1, false);
        let report = scheduler.reconcile().await.unwrap();
        assert_eq!(report.started, vec![2]);
        assert_eq!(report.stopped, vec![1]);
        assert_eq!(scheduler.polled_agents(), vec![2]);

        assert!(scheduler.reconcile().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_agents_are_not_polled() {
        let directory = Arc::new(MemoryDirectory::with_agents([AgentIdentity::new(
            1, "push", "10.0.0.1",
        )]));
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(&directory, Arc::new(FakeSource::default()), &sink);

        assert!(scheduler.reconcile().await.unwrap().is_empty());
        assert!(scheduler.polled_agents().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_change_reschedules_only_that_agent() {
        let directory = Arc::new(MemoryDirectory::with_agents([
            polled(1, 1000),
            polled(2, 1000),
        ]));
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(&directory, Arc::new(FakeSource::default()), &sink);
        scheduler.reconcile().await.unwrap();

        directory.update(1, |a| a.poll_interval_ms = Some(5000));
        let report = scheduler.reconcile().await.unwrap();
        assert_eq!(report.rescheduled, vec![1]);
        assert!(report.started.is_empty());
        assert!(report.stopped.is_empty());
        assert!(scheduler.is_polling(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_single_agent() {
        let directory = Arc::new(MemoryDirectory::with_agents([
            polled(1, 1000),
            polled(2, 1000),
        ]));
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(&directory, Arc::new(FakeSource::default()), &sink);
        scheduler.reconcile().await.unwrap();

        assert!(scheduler.reschedule(1).await.unwrap());
        assert_eq!(scheduler.polled_agents(), vec![1, 2]);

        directory.set_enabled(1, false);
        assert!(!scheduler.reschedule(1).await.unwrap());
        assert_eq!(scheduler.polled_agents(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_polls_on_its_interval() {
        let directory = Arc::new(MemoryDirectory::with_agents([polled(1, 1000)]));
        let source = Arc::new(FakeSource::default());
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(&directory, Arc::clone(&source), &sink);
        scheduler.reconcile().await.unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
        assert_eq!(sink.count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_task() {
        let directory = Arc::new(MemoryDirectory::with_agents([polled(1, 1000)]));
        let source = Arc::new(FakeSource {
            fail_first: 2,
            ..FakeSource::default()
        });
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(&directory, Arc::clone(&source), &sink);
        scheduler.reconcile().await.unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sink.count(), 1);
        assert!(scheduler.is_polling(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_agent_times_out() {
        let agent = polled(1, 10_000);
        let source = FakeSource {
            delay: Some(Duration::from_secs(10)),
            ..FakeSource::default()
        };
        let sink = RecordingSink::default();

        assert!(!poll_once(&agent, Duration::from_secs(3), &source, &sink).await);
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reacts_to_directory_changes_and_cancel() {
        let directory = Arc::new(MemoryDirectory::new());
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(&directory, Arc::new(FakeSource::default()), &sink);
        let cancel = CancellationToken::new();
        let handle = Arc::clone(&scheduler).run(cancel.clone());

        tokio::time::sleep(Duration::from_millis(10)).await;
        directory.insert(polled(5, 1000));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(scheduler.is_polling(5));

        cancel.cancel();
        handle.await.unwrap();
        assert!(scheduler.polled_agents().is_empty());
    }
}
