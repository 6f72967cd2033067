//! Background replica management.
//!
//! Lock grants on files schedule [`ReplicaTask`]s: popular files gain a
//! replica, written files shed every replica except the one being written.
//! Tasks go through a bounded queue to a dispatcher that runs at most
//! `max_concurrent_tasks` of them at once. Scheduling never blocks; when the
//! queue is full the task is dropped and counted.
//!
//! Tasks run under ordinary path locks, so they serialise with client
//! operations on the same file. Every finished task publishes a
//! [`TaskReport`] to subscribers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dfs_types::status_code::{NamingCode, StatusCode};
use dfs_types::{make_error_msg, ClientId, Path, Result, Status, StorageId};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::ReplicationConfig;
use crate::lock::{LockManager, LockMode, PathLockGuard};
use crate::registry::StorageRegistry;
use crate::tree::{NamespaceTree, NodeKind};

const REPORT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaTask {
    /// Copy the file from `source` to one more storage node.
    Replicate { path: Path, source: StorageId },
    /// Delete every replica except the one on `write_target`.
    Invalidate { path: Path, write_target: StorageId },
}

impl ReplicaTask {
    pub fn path(&self) -> &Path {
        match self {
            ReplicaTask::Replicate { path, .. } | ReplicaTask::Invalidate { path, .. } => path,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ReplicaTask::Replicate { .. } => "replicate",
            ReplicaTask::Invalidate { .. } => "invalidate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("no storage node is left to take another replica of {0}")]
    NoReplicaTarget(Path),
    #[error("{target} refused to copy {path}")]
    CopyRefused { path: Path, target: StorageId },
    #[error("copy of {path} to {target} failed: {status}")]
    CopyFailed {
        path: Path,
        target: StorageId,
        status: Status,
    },
    #[error("{} stale replica(s) of {path} could not be deleted", .failed.len())]
    StaleReplicasLeft {
        path: Path,
        failed: Vec<StorageId>,
    },
    #[error("could not lock {path}: {status}")]
    Lock { path: Path, status: Status },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The file was deleted before the task ran.
    Removed,
    /// The path now names a directory.
    NotAFile,
    /// The write target no longer holds the file.
    WriteTargetGone,
    /// The file has no registered host to copy from.
    NoSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Skipped(SkipReason),
    Failed(TaskError),
}

/// Published once per executed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub task: ReplicaTask,
    pub outcome: TaskOutcome,
}

#[derive(Debug, Default)]
pub struct ReplicationStats {
    scheduled: AtomicU64,
    dropped: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub scheduled: u64,
    pub dropped: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl ReplicationStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &TaskOutcome) {
        let counter = match outcome {
            TaskOutcome::Succeeded => &self.succeeded,
            TaskOutcome::Skipped(_) => &self.skipped,
            TaskOutcome::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Shared state tasks operate on.
#[derive(Clone)]
pub struct ReplicaContext {
    pub tree: Arc<NamespaceTree>,
    pub locks: Arc<LockManager>,
    pub registry: Arc<StorageRegistry>,
}

pub struct ReplicationCoordinator {
    tx: mpsc::Sender<ReplicaTask>,
    reports: broadcast::Sender<TaskReport>,
    stats: Arc<ReplicationStats>,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationCoordinator {
    /// Start the dispatcher. Must be called from within a tokio runtime.
    pub fn start(ctx: ReplicaContext, config: &ReplicationConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(ReplicationStats::default());

        let dispatcher = Dispatcher {
            ctx,
            rx,
            permits: Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1))),
            shutdown: shutdown_rx,
            reports: reports.clone(),
            stats: stats.clone(),
        };
        let handle = tokio::spawn(dispatcher.run());

        Self {
            tx,
            reports,
            stats,
            shutdown_tx,
            dispatcher: Mutex::new(Some(handle)),
        }
    }

    /// Queue a task without waiting. Fails with `QUEUE_FULL` when the queue
    /// is at capacity and `INTERRUPTED` after shutdown.
    pub fn schedule(&self, task: ReplicaTask) -> Result<()> {
        match self.tx.try_send(task) {
            Ok(()) => {
                self.stats.scheduled.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(task)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                make_error_msg(
                    StatusCode::QUEUE_FULL,
                    format!("{} task for {} dropped", task.kind(), task.path()),
                )
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                make_error_msg(
                    StatusCode::INTERRUPTED,
                    format!("replication stopped; {} task for {} dropped", task.kind(), task.path()),
                )
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskReport> {
        self.reports.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the dispatcher and abort tasks still running. Queued tasks are
    /// discarded.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for ReplicationCoordinator {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

struct Dispatcher {
    ctx: ReplicaContext,
    rx: mpsc::Receiver<ReplicaTask>,
    permits: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
    reports: broadcast::Sender<TaskReport>,
    stats: Arc<ReplicationStats>,
}

impl Dispatcher {
    async fn run(mut self) {
        let mut running = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                Some(_) = running.join_next(), if !running.is_empty() => {}
                task = self.rx.recv() => {
                    let Some(task) = task else { break };
                    let permit = tokio::select! {
                        permit = self.permits.clone().acquire_owned() => permit,
                        _ = self.shutdown.changed() => break,
                    };
                    let Ok(permit) = permit else { break };
                    let ctx = self.ctx.clone();
                    let reports = self.reports.clone();
                    let stats = self.stats.clone();
                    running.spawn(async move {
                        let outcome = execute(&ctx, &task).await;
                        log_outcome(&task, &outcome);
                        stats.record(&outcome);
                        // No subscribers is fine.
                        let _ = reports.send(TaskReport { task, outcome });
                        drop(permit);
                    });
                }
            }
        }
        running.abort_all();
        while running.join_next().await.is_some() {}
        tracing::debug!("replication dispatcher stopped");
    }
}

fn log_outcome(task: &ReplicaTask, outcome: &TaskOutcome) {
    match outcome {
        TaskOutcome::Succeeded => {
            tracing::debug!(kind = task.kind(), path = %task.path(), "replica task done")
        }
        TaskOutcome::Skipped(reason) => {
            tracing::debug!(kind = task.kind(), path = %task.path(), ?reason, "replica task skipped")
        }
        TaskOutcome::Failed(err) => {
            tracing::warn!(kind = task.kind(), path = %task.path(), "replica task failed: {}", err)
        }
    }
}

/// Run one task to completion.
pub async fn execute(ctx: &ReplicaContext, task: &ReplicaTask) -> TaskOutcome {
    match task {
        ReplicaTask::Replicate { path, source } => replicate(ctx, path, *source).await,
        ReplicaTask::Invalidate { path, write_target } => {
            invalidate(ctx, path, *write_target).await
        }
    }
}

/// Lock `path` and return the file's current hosts, or the outcome to stop
/// with.
async fn lock_file(
    ctx: &ReplicaContext,
    path: &Path,
    mode: LockMode,
) -> std::result::Result<(PathLockGuard, Vec<StorageId>), TaskOutcome> {
    let guard = match ctx.locks.lock(ClientId::SYSTEM, path, mode).await {
        Ok(guard) => guard,
        Err(status) if status.code() == NamingCode::NOT_FOUND => {
            return Err(TaskOutcome::Skipped(SkipReason::Removed))
        }
        Err(status) => {
            return Err(TaskOutcome::Failed(TaskError::Lock {
                path: path.clone(),
                status,
            }))
        }
    };
    match ctx.tree.kind(guard.target()) {
        Ok(NodeKind::File) => {}
        Ok(NodeKind::Directory) => return Err(TaskOutcome::Skipped(SkipReason::NotAFile)),
        Err(_) => return Err(TaskOutcome::Skipped(SkipReason::Removed)),
    }
    match ctx.tree.hosts(guard.target()) {
        Ok(hosts) => Ok((guard, hosts)),
        Err(_) => Err(TaskOutcome::Skipped(SkipReason::Removed)),
    }
}

async fn replicate(ctx: &ReplicaContext, path: &Path, source: StorageId) -> TaskOutcome {
    let (guard, hosts) = match lock_file(ctx, path, LockMode::Shared).await {
        Ok(locked) => locked,
        Err(outcome) => return outcome,
    };

    // Prefer the requested source; fall back to any current host.
    let source = if hosts.contains(&source) {
        ctx.registry.get(source)
    } else {
        hosts.iter().find_map(|id| ctx.registry.get(*id))
    };
    let Some(source) = source else {
        return TaskOutcome::Skipped(SkipReason::NoSource);
    };
    let Some(target) = ctx.registry.choose_replica_target(&hosts) else {
        return TaskOutcome::Failed(TaskError::NoReplicaTarget(path.clone()));
    };

    match target.command.copy(path, source.client.clone()).await {
        Ok(true) => {
            if let Err(status) = ctx.tree.add_host(guard.target(), target.id) {
                return TaskOutcome::Failed(TaskError::Lock {
                    path: path.clone(),
                    status,
                });
            }
            ctx.registry.record_hosted(target.id, path.clone());
            TaskOutcome::Succeeded
        }
        Ok(false) => TaskOutcome::Failed(TaskError::CopyRefused {
            path: path.clone(),
            target: target.id,
        }),
        Err(status) => TaskOutcome::Failed(TaskError::CopyFailed {
            path: path.clone(),
            target: target.id,
            status,
        }),
    }
}

async fn invalidate(ctx: &ReplicaContext, path: &Path, write_target: StorageId) -> TaskOutcome {
    let (guard, hosts) = match lock_file(ctx, path, LockMode::Exclusive).await {
        Ok(locked) => locked,
        Err(outcome) => return outcome,
    };
    if !hosts.contains(&write_target) {
        return TaskOutcome::Skipped(SkipReason::WriteTargetGone);
    }

    let stale: Vec<StorageId> = hosts.into_iter().filter(|h| *h != write_target).collect();
    let deletions = stale.iter().map(|id| {
        let node = ctx.registry.get(*id);
        async move {
            let deleted = match node {
                Some(node) => node.command.delete(path).await,
                None => make_error_msg(NamingCode::NOT_FOUND, format!("{} is not registered", id)),
            };
            (*id, deleted)
        }
    });
    let results = join_all(deletions).await;

    if let Err(status) = ctx.tree.retain_only_host(guard.target(), write_target) {
        return TaskOutcome::Failed(TaskError::Lock {
            path: path.clone(),
            status,
        });
    }

    let mut failed = Vec::new();
    for (id, deleted) in results {
        ctx.registry.forget_hosted(id, path);
        match deleted {
            Ok(true) => {}
            Ok(false) => failed.push(id),
            Err(status) => {
                tracing::debug!(%path, storage = %id, "stale replica delete failed: {}", status);
                failed.push(id);
            }
        }
    }
    if failed.is_empty() {
        TaskOutcome::Succeeded
    } else {
        TaskOutcome::Failed(TaskError::StaleReplicasLeft {
            path: path.clone(),
            failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfs_stubs::{CommandCall, MockStorageClientStub, MockStorageCommandStub};
    use dfs_types::status_code::RPCCode;
    use dfs_types::{Address, InodeId};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    struct Fixture {
        ctx: ReplicaContext,
        commands: Vec<Arc<MockStorageCommandStub>>,
    }

    /// `n` registered nodes and a file /d/f hosted on `hosts`.
    fn fixture(n: u32, hosts: &[u32]) -> Fixture {
        let tree = Arc::new(NamespaceTree::new());
        let locks = Arc::new(LockManager::new(tree.clone()));
        let registry = Arc::new(StorageRegistry::new());
        let mut commands = Vec::new();
        for i in 1..=n {
            let client = MockStorageClientStub::new(Address::localhost(8000 + i as u16)).into_arc();
            let command =
                MockStorageCommandStub::new(Address::localhost(9000 + i as u16)).into_arc();
            registry
                .add(StorageId(i), client, command.clone())
                .unwrap();
            commands.push(command);
        }
        let d = tree.create_directory(InodeId::ROOT, "d").unwrap();
        let (first, rest) = hosts.split_first().unwrap();
        let f = tree.create_file(d, "f", StorageId(*first)).unwrap();
        for h in rest {
            tree.add_host(f, StorageId(*h)).unwrap();
        }
        for h in hosts {
            registry.record_hosted(StorageId(*h), p("/d/f"));
        }
        Fixture {
            ctx: ReplicaContext {
                tree,
                locks,
                registry,
            },
            commands,
        }
    }

    fn hosts_of(ctx: &ReplicaContext, path: &str) -> Vec<StorageId> {
        ctx.tree.hosts(ctx.tree.lookup(&p(path)).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_replicate_adds_host() {
        let fx = fixture(2, &[1]);
        let task = ReplicaTask::Replicate {
            path: p("/d/f"),
            source: StorageId(1),
        };
        assert_eq!(execute(&fx.ctx, &task).await, TaskOutcome::Succeeded);
        assert_eq!(hosts_of(&fx.ctx, "/d/f"), vec![StorageId(1), StorageId(2)]);
        assert_eq!(
            fx.commands[1].calls(),
            vec![CommandCall::Copy {
                path: p("/d/f"),
                source: Address::localhost(8001),
            }]
        );
        assert_eq!(fx.ctx.registry.hosted_paths(StorageId(2)), vec![p("/d/f")]);
    }

    #[tokio::test]
    async fn test_replicate_single_node_has_no_target() {
        let fx = fixture(1, &[1]);
        let task = ReplicaTask::Replicate {
            path: p("/d/f"),
            source: StorageId(1),
        };
        let outcome = execute(&fx.ctx, &task).await;
        assert_eq!(
            outcome,
            TaskOutcome::Failed(TaskError::NoReplicaTarget(p("/d/f")))
        );
        assert_eq!(hosts_of(&fx.ctx, "/d/f"), vec![StorageId(1)]);
        assert!(fx.commands[0].calls().is_empty());
    }

    #[tokio::test]
    async fn test_replicate_copy_failure_changes_nothing() {
        let fx = fixture(2, &[1]);
        fx.commands[1].on_copy(|_| Err(Status::new(RPCCode::SEND_FAILED)));
        let task = ReplicaTask::Replicate {
            path: p("/d/f"),
            source: StorageId(1),
        };
        let outcome = execute(&fx.ctx, &task).await;
        assert!(matches!(
            outcome,
            TaskOutcome::Failed(TaskError::CopyFailed { target: StorageId(2), .. })
        ));
        assert_eq!(hosts_of(&fx.ctx, "/d/f"), vec![StorageId(1)]);

        fx.commands[1].on_copy(|_| Ok(false));
        let outcome = execute(&fx.ctx, &task).await;
        assert!(matches!(
            outcome,
            TaskOutcome::Failed(TaskError::CopyRefused { .. })
        ));
        assert_eq!(hosts_of(&fx.ctx, "/d/f"), vec![StorageId(1)]);
    }

    #[tokio::test]
    async fn test_replicate_removed_file_is_skipped() {
        let fx = fixture(2, &[1]);
        let task = ReplicaTask::Replicate {
            path: p("/d/gone"),
            source: StorageId(1),
        };
        assert_eq!(
            execute(&fx.ctx, &task).await,
            TaskOutcome::Skipped(SkipReason::Removed)
        );
        let task = ReplicaTask::Replicate {
            path: p("/d"),
            source: StorageId(1),
        };
        assert_eq!(
            execute(&fx.ctx, &task).await,
            TaskOutcome::Skipped(SkipReason::NotAFile)
        );
    }

    #[tokio::test]
    async fn test_invalidate_keeps_only_write_target() {
        let fx = fixture(2, &[1, 2]);
        let task = ReplicaTask::Invalidate {
            path: p("/d/f"),
            write_target: StorageId(1),
        };
        assert_eq!(execute(&fx.ctx, &task).await, TaskOutcome::Succeeded);
        assert_eq!(hosts_of(&fx.ctx, "/d/f"), vec![StorageId(1)]);
        assert_eq!(fx.commands[1].calls(), vec![CommandCall::Delete(p("/d/f"))]);
        assert!(fx.commands[0].calls().is_empty());
        assert!(fx.ctx.registry.hosted_paths(StorageId(2)).is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_reports_failed_deletes() {
        let fx = fixture(3, &[1, 2, 3]);
        fx.commands[2].on_delete(|_| Err(Status::new(RPCCode::CONNECT_FAILED)));
        let task = ReplicaTask::Invalidate {
            path: p("/d/f"),
            write_target: StorageId(1),
        };
        assert_eq!(
            execute(&fx.ctx, &task).await,
            TaskOutcome::Failed(TaskError::StaleReplicasLeft {
                path: p("/d/f"),
                failed: vec![StorageId(3)],
            })
        );
        assert_eq!(hosts_of(&fx.ctx, "/d/f"), vec![StorageId(1)]);
    }

    #[tokio::test]
    async fn test_invalidate_skips_when_write_target_gone() {
        let fx = fixture(2, &[2]);
        let task = ReplicaTask::Invalidate {
            path: p("/d/f"),
            write_target: StorageId(1),
        };
        assert_eq!(
            execute(&fx.ctx, &task).await,
            TaskOutcome::Skipped(SkipReason::WriteTargetGone)
        );
        assert_eq!(hosts_of(&fx.ctx, "/d/f"), vec![StorageId(2)]);
        assert!(fx.commands[1].calls().is_empty());
    }

    #[tokio::test]
    async fn test_coordinator_runs_and_reports() {
        let fx = fixture(2, &[1]);
        let coordinator = ReplicationCoordinator::start(fx.ctx.clone(), &ReplicationConfig::default());
        let mut reports = coordinator.subscribe();

        coordinator
            .schedule(ReplicaTask::Replicate {
                path: p("/d/f"),
                source: StorageId(1),
            })
            .unwrap();
        let report = timeout(Duration::from_secs(5), reports.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.outcome, TaskOutcome::Succeeded);
        assert_eq!(hosts_of(&fx.ctx, "/d/f").len(), 2);

        let stats = coordinator.stats();
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.succeeded, 1);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_file_deleted_after_scheduling_is_skipped() {
        let fx = fixture(2, &[1]);
        let coordinator = ReplicationCoordinator::start(fx.ctx.clone(), &ReplicationConfig::default());
        let mut reports = coordinator.subscribe();

        // A delete holds the file exclusively while the task is queued.
        let deleter = fx
            .ctx
            .locks
            .lock(ClientId(1), &p("/d/f"), LockMode::Exclusive)
            .await
            .unwrap();
        coordinator
            .schedule(ReplicaTask::Replicate {
                path: p("/d/f"),
                source: StorageId(1),
            })
            .unwrap();
        sleep(Duration::from_millis(20)).await;
        assert_eq!(coordinator.stats().skipped, 0);

        fx.ctx.tree.remove(deleter.target(), &p("/d/f")).unwrap();
        drop(deleter);

        let report = timeout(Duration::from_secs(5), reports.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.outcome, TaskOutcome::Skipped(SkipReason::Removed));
        assert!(fx.commands[1].calls().is_empty());
        assert_eq!(coordinator.stats().skipped, 1);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_queue_drops_tasks() {
        let fx = fixture(2, &[1]);
        let config = ReplicationConfig {
            queue_capacity: 1,
            max_concurrent_tasks: 1,
            ..ReplicationConfig::default()
        };
        // Park the file under a writer so the first task cannot finish.
        let holder = fx
            .ctx
            .locks
            .lock(ClientId(1), &p("/d/f"), LockMode::Exclusive)
            .await
            .unwrap();
        let coordinator = ReplicationCoordinator::start(fx.ctx.clone(), &config);

        let task = ReplicaTask::Replicate {
            path: p("/d/f"),
            source: StorageId(1),
        };
        let mut dropped = 0;
        for _ in 0..10 {
            if let Err(status) = coordinator.schedule(task.clone()) {
                assert_eq!(status.code(), StatusCode::QUEUE_FULL);
                dropped += 1;
            }
            tokio::task::yield_now().await;
        }
        assert!(dropped > 0);
        assert_eq!(coordinator.stats().dropped, dropped);

        drop(holder);
        coordinator.shutdown().await;
        let err = coordinator.schedule(task).unwrap_err();
        assert_eq!(err.code(), StatusCode::INTERRUPTED);
    }
}
