use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Frames larger than this are treated as corruption rather than allocated.
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Encode one committed transaction to [len][bincode][crc32] format.
/// Returns the frame length in bytes.
fn encode_commit(writer: &mut impl Write, events: &[Event]) -> io::Result<u64> {
    let payload =
        bincode::serialize(events).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "commit too large"));
    }
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(8 + u64::from(len))
}

/// Append-only Write-Ahead Log of transactions.
///
/// Format per frame: `[u32: len][bincode: Vec<Event>][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A frame is one transaction. A torn last frame (crash) is discarded whole
///   via length-prefix + CRC check, so a transaction is never half-replayed.
///
/// Frames appended since the last successful `flush_sync` can be discarded
/// with `rollback`, which also cuts the file back to its durable length.
pub struct Wal {
    file: File,
    /// Encoded frames not yet written to `file`.
    pending: Vec<u8>,
    path: PathBuf,
    commits_since_compact: u64,
    /// File length covered by the last successful `flush_sync`.
    durable_len: u64,
    durable_commits: u64,
    /// Set when a rollback could not restore the file. Every later append fails.
    poisoned: Option<String>,
}

impl Wal {
    /// Open (or create) the WAL file at `path`. A torn or corrupt tail is
    /// truncated first so new frames land directly after the last intact one.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (_, valid_len) = Self::scan(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            tracing::warn!(
                "wal {}: truncating {} bytes of torn tail",
                path.display(),
                on_disk - valid_len
            );
            file.set_len(valid_len)?;
        }
        Ok(Self {
            file,
            pending: Vec::new(),
            path: path.to_path_buf(),
            commits_since_compact: 0,
            durable_len: valid_len,
            durable_commits: 0,
            poisoned: None,
        })
    }

    /// Append a single transaction and fsync. Used by tests only;
    /// production code uses `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, events: &[Event]) -> io::Result<()> {
        self.append_buffered(events)?;
        self.flush_sync()
    }

    /// Buffer a transaction without flushing or syncing.
    /// Call `flush_sync()` after the batch to durably commit everything buffered.
    pub fn append_buffered(&mut self, events: &[Event]) -> io::Result<()> {
        if let Some(reason) = &self.poisoned {
            return Err(io::Error::other(format!("wal unusable until restart: {reason}")));
        }
        encode_commit(&mut self.pending, events)?;
        self.commits_since_compact += 1;
        Ok(())
    }

    /// Write out the buffered frames and fsync the file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.file.write_all(&self.pending)?;
        self.file.sync_all()?;
        self.durable_len += self.pending.len() as u64;
        self.pending.clear();
        self.durable_commits = self.commits_since_compact;
        Ok(())
    }

    /// Discard everything appended since the last successful `flush_sync`,
    /// whether still buffered or already written to the file.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.commits_since_compact = self.durable_commits;
        let result = self
            .file
            .set_len(self.durable_len)
            .and_then(|()| self.file.sync_all());
        if let Err(e) = &result {
            self.poisoned = Some(e.to_string());
        }
        result
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the compacted state as a single transaction to a temp file and fsync.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        if !events.is_empty() {
            encode_commit(&mut writer, events)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.file = file;
        self.pending.clear();
        self.commits_since_compact = 0;
        self.durable_commits = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn commits_since_compact(&self) -> u64 {
        self.commits_since_compact
    }

    /// Replay the WAL from disk, returning the events of every intact
    /// transaction in commit order. Replay stops at the first torn or corrupt frame.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Self::scan(path).map(|(events, _)| events)
    }

    /// Events of the intact prefix, and that prefix's length in bytes.
    fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0u64;

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_FRAME_LEN {
                tracing::warn!("wal {}: implausible frame length {len}, discarding tail", path.display());
                break;
            }

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // torn
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // torn
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                tracing::warn!("wal {}: crc mismatch, discarding tail", path.display());
                break;
            }

            match bincode::deserialize::<Vec<Event>>(&payload) {
                Ok(commit) => events.extend(commit),
                Err(_) => break,
            }
            valid_len += 8 + len as u64;
        }

        Ok((events, valid_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("seatd_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn created(capacity: u32) -> Event {
        Event::ResourceCreated {
            id: Ulid::new(),
            name: "Concert".into(),
            venue: "Arena".into(),
            starts_at: 0,
            capacity,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let rid = Ulid::new();
        let first = vec![created(2)];
        let second = vec![
            Event::AllocationReleased { id: Ulid::new(), resource_id: rid, at: 5 },
            Event::Promoted {
                entry_id: Ulid::new(),
                resource_id: rid,
                requester_id: Ulid::new(),
                allocation_id: Ulid::new(),
                at: 5,
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
            wal.append(&second).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        let expected: Vec<Event> = first.into_iter().chain(second).collect();
        assert_eq!(replayed, expected);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn torn_transaction_is_dropped_whole() {
        let path = tmp_path("torn_commit.wal");
        let _ = fs::remove_file(&path);

        let kept = vec![created(1)];
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&kept).unwrap();
        }

        // Write a two-event commit, then chop off its last bytes.
        let rid = Ulid::new();
        let mut frame = Vec::new();
        encode_commit(
            &mut frame,
            &[
                Event::AllocationReleased { id: Ulid::new(), resource_id: rid, at: 1 },
                Event::WaitlistLeft { resource_id: rid, requester_id: Ulid::new() },
            ],
        )
        .unwrap();
        frame.truncate(frame.len() - 3);
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&frame).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, kept);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn reopen_truncates_torn_tail_before_appending() {
        let path = tmp_path("reopen_torn.wal");
        let _ = fs::remove_file(&path);

        let first = vec![created(1)];
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9, 0, 0, 0, 1, 2]).unwrap();
        }
        let second = vec![created(2)];
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&second).unwrap();
        }

        let expected: Vec<Event> = first.into_iter().chain(second).collect();
        assert_eq!(Wal::replay(&path).unwrap(), expected);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_discards_frames_written_before_a_failed_sync() {
        let path = tmp_path("rollback_written.wal");
        let _ = fs::remove_file(&path);

        let kept = vec![created(1)];
        let later = vec![created(3)];
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&kept).unwrap();

            // Bytes reach the file, then the sync is reported as failed.
            wal.append_buffered(&[created(2)]).unwrap();
            wal.append_buffered(&[created(2), created(2)]).unwrap();
            let pending = std::mem::take(&mut wal.pending);
            wal.file.write_all(&pending).unwrap();
            assert!(fs::metadata(&path).unwrap().len() > wal.durable_len);

            wal.rollback().unwrap();
            assert_eq!(wal.commits_since_compact(), 1);
            assert_eq!(Wal::replay(&path).unwrap(), kept);

            wal.append(&later).unwrap();
        }

        let expected: Vec<Event> = kept.into_iter().chain(later).collect();
        assert_eq!(Wal::replay(&path).unwrap(), expected);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_drops_still_buffered_frames() {
        let path = tmp_path("rollback_buffered.wal");
        let _ = fs::remove_file(&path);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append_buffered(&[created(1)]).unwrap();
            wal.rollback().unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn failed_rollback_refuses_further_appends() {
        let path = tmp_path("rollback_poisoned.wal");
        let _ = fs::remove_file(&path);

        let kept = vec![created(1)];
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&kept).unwrap();
        }

        // A read-only handle fails both the write and the truncate.
        let mut wal = Wal {
            file: File::open(&path).unwrap(),
            pending: Vec::new(),
            path: path.clone(),
            commits_since_compact: 1,
            durable_len: fs::metadata(&path).unwrap().len(),
            durable_commits: 1,
            poisoned: None,
        };
        wal.append_buffered(&[created(2)]).unwrap();
        assert!(wal.flush_sync().is_err());
        assert!(wal.rollback().is_err());
        assert!(wal.append_buffered(&[created(3)]).is_err());
        assert_eq!(Wal::replay(&path).unwrap(), kept);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let _ = fs::remove_file(&path);
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let _ = fs::remove_file(&path);

        {
            let payload = bincode::serialize(&vec![Event::ResourceDeleted { id: Ulid::new() }]).unwrap();
            let len = payload.len() as u32;
            let bad_crc: u32 = 0xDEADBEEF;

            let mut f = File::create(&path).unwrap();
            f.write_all(&len.to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&bad_crc.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let _ = fs::remove_file(&path);

        let snapshot = vec![created(3), created(4)];
        let later = vec![created(5)];

        {
            let mut wal = Wal::open(&path).unwrap();
            for _ in 0..10 {
                wal.append(&[created(1)]).unwrap();
            }
            assert_eq!(wal.commits_since_compact(), 10);
            wal.compact(&snapshot).unwrap();
            assert_eq!(wal.commits_since_compact(), 0);
            wal.append(&later).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        let expected: Vec<Event> = snapshot.into_iter().chain(later).collect();
        assert_eq!(replayed, expected);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let _ = fs::remove_file(&path);

        let commits: Vec<Vec<Event>> = (0..5).map(|i| vec![created(i + 1)]).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for c in &commits {
                wal.append_buffered(c).unwrap();
            }
            assert_eq!(wal.commits_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, commits.concat());

        let _ = fs::remove_file(&path);
    }
}
