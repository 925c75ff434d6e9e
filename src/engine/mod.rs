mod bookings;
mod conflict;
mod credits;
mod energy;
mod error;
mod queries;
mod registry;
mod store;

pub use conflict::find_conflict;
pub use energy::{LEVEL_THRESHOLDS, level_for};
pub use error::{EngineError, ErrorKind, Party, RowRef};
pub use registry::RuleDefinition;

use std::hash::Hash;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, mpsc, oneshot};
use tracing::warn;

use crate::config::EngineConfig;
use crate::model::*;
use crate::wal::Wal;

use store::Tables;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        commits: Vec<Commit>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is already queued,
/// fsync once, then answer every sender in the batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (commit, response) = match cmd {
            WalCommand::Append { commit, response } => (commit, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(commit, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { commit, response }) => batch.push((commit, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Commit, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (commit, _) in batch {
        if let Err(e) = wal.append_buffered(commit) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partially buffered bytes don't leak
    // into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Commit, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { commits, response } => {
            let result = Wal::write_compact_file(wal.path(), &commits)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { commit, response } => {
            let result = wal.append_buffered(&commit).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

// ── Row locks ────────────────────────────────────────────

/// Write-intent locks, one per row key. Holding the guard is the
/// equivalent of `SELECT ... FOR UPDATE` on that row. An entry lives only
/// while someone holds or waits on it.
struct LockTable<K> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Copy> LockTable<K> {
    fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn handle(&self, key: K) -> Arc<Mutex<()>> {
        self.locks.entry(key).or_default().value().clone()
    }

    /// Drop the entry once the table holds the only handle. `handle` clones
    /// under the same shard lock, so no waiter can be cut off.
    fn release(&self, key: K) {
        self.locks.remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// A held row lock; releasing it prunes the table entry.
pub(super) struct RowGuard<'a, K: Eq + Hash + Copy> {
    guard: Option<OwnedMutexGuard<()>>,
    table: &'a LockTable<K>,
    key: K,
}

impl<K: Eq + Hash + Copy> Drop for RowGuard<'_, K> {
    fn drop(&mut self) {
        self.guard.take();
        self.table.release(self.key);
    }
}

/// Locks held for the duration of one booking transaction.
pub(super) struct PartyLocks<'a> {
    _coach: RowGuard<'a, CoachId>,
    _student: RowGuard<'a, StudentId>,
}

pub struct Engine {
    pub(super) tables: Tables,
    pub(super) config: EngineConfig,
    wal_tx: mpsc::Sender<WalCommand>,
    coach_locks: LockTable<CoachId>,
    student_locks: LockTable<StudentId>,
    /// Serializes the compare and the write of one energy CAS statement.
    energy_latches: LockTable<StudentId>,
    /// Shared by commits, exclusive for compaction.
    commit_gate: RwLock<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, config: EngineConfig) -> io::Result<Self> {
        let commits = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let tables = Tables::default();
        for commit in &commits {
            for change in &commit.changes {
                tables.apply(change);
            }
        }

        Ok(Self {
            tables,
            config,
            wal_tx,
            coach_locks: LockTable::new(),
            student_locks: LockTable::new(),
            energy_latches: LockTable::new(),
            commit_gate: RwLock::new(()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Write a commit to the WAL via the background group-commit writer.
    async fn wal_append(&self, commit: &Commit) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                commit: commit.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Make `changes` durable as one transaction, then apply them.
    /// Nothing is applied if the WAL write fails.
    pub(super) async fn commit(&self, changes: Vec<Change>) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let commit = Commit { changes };
        self.wal_append(&commit).await?;
        for change in &commit.changes {
            self.tables.apply(change);
        }
        Ok(())
    }

    async fn acquire<'a, K: Eq + Hash + Copy>(
        &self,
        table: &'a LockTable<K>,
        key: K,
        row: RowRef,
    ) -> Result<RowGuard<'a, K>, EngineError> {
        let started = Instant::now();
        let lock = table.handle(key);
        match tokio::time::timeout(self.config.lock_timeout, lock.lock_owned()).await {
            Ok(guard) => {
                metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS)
                    .record(started.elapsed().as_secs_f64());
                Ok(RowGuard {
                    guard: Some(guard),
                    table,
                    key,
                })
            }
            Err(_) => {
                table.release(key);
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                warn!("lock timeout on {row} after {:?}", self.config.lock_timeout);
                Err(EngineError::LockTimeout(row))
            }
        }
    }

    pub(super) async fn lock_student(&self, id: StudentId) -> Result<RowGuard<'_, StudentId>, EngineError> {
        self.acquire(&self.student_locks, id, RowRef::Student(id)).await
    }

    /// Lock coach, then student. Every path that takes both uses this order.
    pub(super) async fn lock_parties(
        &self,
        coach_id: CoachId,
        student_id: StudentId,
    ) -> Result<PartyLocks<'_>, EngineError> {
        let coach = self
            .acquire(&self.coach_locks, coach_id, RowRef::Coach(coach_id))
            .await?;
        let student = self.lock_student(student_id).await?;
        Ok(PartyLocks {
            _coach: coach,
            _student: student,
        })
    }

    pub(super) async fn lock_energy(&self, id: StudentId) -> RowGuard<'_, StudentId> {
        let guard = self.energy_latches.handle(id).lock_owned().await;
        RowGuard {
            guard: Some(guard),
            table: &self.energy_latches,
            key: id,
        }
    }

    /// Rewrite the WAL as a single snapshot commit of the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let snapshot = self.tables.snapshot();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                commits: vec![snapshot],
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
