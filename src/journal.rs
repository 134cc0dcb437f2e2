use std::io;
use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::model::Event;
use crate::wal::Wal;

/// Durable storage for committed transactions.
///
/// `commit` is all-or-nothing: on `Err` none of the events may be observed
/// after a restart, and the engine leaves its in-memory state untouched.
#[async_trait]
pub trait Journal: Send + Sync {
    async fn commit(&self, events: &[Event]) -> io::Result<()>;

    /// Replace the whole log with `events`, a minimal recreation of current state.
    async fn compact(&self, events: Vec<Event>) -> io::Result<()>;

    async fn commits_since_compact(&self) -> u64;
}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Commit {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    CommitsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// `Journal` backed by a [`Wal`] owned by a background group-commit task.
pub struct WalJournal {
    tx: mpsc::Sender<WalCommand>,
}

impl WalJournal {
    /// Open the WAL at `path` and spawn its writer. Must run inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let wal = Wal::open(path)?;
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, rx));
        Ok(Self { tx })
    }

    async fn request<T>(
        &self,
        cmd: WalCommand,
        rx: oneshot::Receiver<io::Result<T>>,
    ) -> io::Result<T> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| io::Error::other("WAL writer shut down"))?;
        rx.await
            .map_err(|_| io::Error::other("WAL writer dropped response"))?
    }
}

#[async_trait]
impl Journal for WalJournal {
    async fn commit(&self, events: &[Event]) -> io::Result<()> {
        let (response, rx) = oneshot::channel();
        let cmd = WalCommand::Commit {
            events: events.to_vec(),
            response,
        };
        self.request(cmd, rx).await
    }

    async fn compact(&self, events: Vec<Event>) -> io::Result<()> {
        let (response, rx) = oneshot::channel();
        self.request(WalCommand::Compact { events, response }, rx).await
    }

    async fn commits_since_compact(&self) -> u64 {
        let (response, rx) = oneshot::channel();
        if self
            .tx
            .send(WalCommand::CommitsSinceCompact { response })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Background task that owns the WAL and batches commits.
/// 1. Block until the first Commit arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Commits (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Commit { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Commit { events, response }) => batch.push((events, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                if let Err(e) = &result {
                    tracing::warn!("wal flush of {} commits failed: {e}", batch.len());
                }
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_commit(&mut wal, other);
                }
            }
            other => handle_non_commit(&mut wal, other),
        }
    }
}

/// Append and sync a whole batch. On any failure the batch is rolled back
/// off the file, so waiters told it failed never see it replayed.
fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(events, _)| wal.append_buffered(events))
        .and_then(|()| wal.flush_sync());
    if result.is_err() {
        if let Err(e) = wal.rollback() {
            tracing::error!("wal rollback failed, refusing further commits: {e}");
        }
    }
    result
}

fn respond_batch(batch: Vec<Pending>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_commit(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::CommitsSinceCompact { response } => {
            let _ = response.send(wal.commits_since_compact());
        }
        WalCommand::Commit { .. } => unreachable!("commits are batched by the caller"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("seatd_test_journal");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn concurrent_commits_all_land() {
        let path = tmp_path("concurrent.wal");
        let journal = std::sync::Arc::new(WalJournal::open(&path).unwrap());

        let mut handles = Vec::new();
        for _ in 0..32 {
            let j = journal.clone();
            handles.push(tokio::spawn(async move {
                j.commit(&[Event::RequesterRemoved { id: Ulid::new() }]).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(journal.commits_since_compact().await, 32);
        assert_eq!(Wal::replay(&path).unwrap().len(), 32);
    }

    #[tokio::test]
    async fn compact_resets_counter_and_contents() {
        let path = tmp_path("compact.wal");
        let journal = WalJournal::open(&path).unwrap();
        for _ in 0..5 {
            journal
                .commit(&[Event::RequesterRemoved { id: Ulid::new() }])
                .await
                .unwrap();
        }
        let keep = Event::ResourceDeleted { id: Ulid::new() };
        journal.compact(vec![keep.clone()]).await.unwrap();
        assert_eq!(journal.commits_since_compact().await, 0);
        assert_eq!(Wal::replay(&path).unwrap(), vec![keep]);
    }
}
