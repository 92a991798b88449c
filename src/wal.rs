use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Frames above this size can only come from corruption: payloads are
/// bounded far below it.
const MAX_FRAME_LEN: usize = 64 * 1024;

/// Encode a single event as `[len][bincode][crc32]`, returning the frame size.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(frame_len(payload.len()))
}

fn frame_len(payload_len: usize) -> u64 {
    (4 + payload_len + 4) as u64
}

/// Read `buf.len()` bytes, mapping a clean or torn EOF to `Ok(false)`.
fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Decode the next frame and its size. `None` means end of the valid prefix
/// of the log.
fn decode_next(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(None);
    }

    let mut payload = vec![0u8; len];
    if !read_or_eof(reader, &mut payload)? {
        return Ok(None);
    }

    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }

    Ok(bincode::deserialize::<Event>(&payload)
        .ok()
        .map(|event| (event, frame_len(len))))
}

/// Cut the file at `path` down to `valid_len` bytes and fsync it.
/// Returns how many bytes were dropped.
fn truncate_tail(path: &Path, valid_len: u64) -> io::Result<u64> {
    let file = match OpenOptions::new().write(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let len = file.metadata()?.len();
    if len <= valid_len {
        return Ok(0);
    }
    file.set_len(valid_len)?;
    file.sync_all()?;
    Ok(len - valid_len)
}

/// Append-only reservation log.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn last entry (crash mid-write) is discarded via length-prefix + CRC check,
///   and `recover` truncates it so later appends stay reachable.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length as of the last successful `flush_sync`.
    committed_len: u64,
    pending_len: u64,
    pending_appends: u64,
    /// Set while the writer may still hold bytes from a failed batch.
    poisoned: bool,
}

impl Wal {
    /// Open (or create) the log at `path`. Appends land after whatever the
    /// file already holds; use `recover` for a log that may have a bad tail.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let committed_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            committed_len,
            pending_len: 0,
            pending_appends: 0,
            poisoned: false,
        })
    }

    /// Replay the log, truncate any torn or corrupt tail, then open it for
    /// appending.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, valid_len) = Self::replay_prefix(path)?;
        let dropped = truncate_tail(path, valid_len)?;
        if dropped > 0 {
            tracing::warn!(
                path = %path.display(),
                valid_len,
                dropped,
                "truncated corrupt tail of reservation log"
            );
        }
        Ok((Self::open(path)?, events))
    }

    /// Append and fsync a single event. Production code batches through
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event without flushing. Durable only after `flush_sync()`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("reservation log is waiting on rollback of a failed batch"));
        }
        self.pending_appends += 1;
        self.appends_since_compact += 1;
        self.pending_len += encode_event(&mut self.writer, event)?;
        Ok(())
    }

    /// Flush the buffer and fsync the file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("reservation log is waiting on rollback of a failed batch"));
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.committed_len += self.pending_len;
        self.pending_len = 0;
        self.pending_appends = 0;
        Ok(())
    }

    /// Drop every append since the last successful `flush_sync`: bytes still
    /// in the buffer are discarded and bytes already pushed to the file are
    /// truncated away. Until this succeeds the log refuses new appends.
    pub fn discard_pending(&mut self) -> io::Result<()> {
        self.poisoned = true;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the buffer instead of flushing it on drop.
        let (_stale_file, _unwritten) = stale.into_parts();
        self.writer.get_ref().set_len(self.committed_len)?;
        self.writer.get_ref().sync_all()?;
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.pending_appends);
        self.pending_len = 0;
        self.pending_appends = 0;
        self.poisoned = false;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write the compacted event set to a sibling temp file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path.with_extension("wal.tmp"))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the log and reopen it for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(self.path.with_extension("wal.tmp"), &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.committed_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.pending_len = 0;
        self.pending_appends = 0;
        self.poisoned = false;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Replay every valid event. A missing file is an empty log; replay stops
    /// at the first torn or corrupt entry.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Self::replay_prefix(path).map(|(events, _)| events)
    }

    /// Like `replay`, also returning the byte length of the valid prefix.
    pub fn replay_prefix(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0u64;
        while let Some((event, len)) = decode_next(&mut reader)? {
            events.push(event);
            valid_len += len;
        }
        Ok((events, valid_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TimeWindow;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotguard_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn created(resource_id: Ulid, start: i64, end: i64) -> Event {
        Event::ReservationCreated {
            id: Ulid::new(),
            resource_id,
            window: TimeWindow::new(start, end),
            payload: String::new(),
            created_at: 1,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let rid = Ulid::new();
        let first = created(rid, 1000, 2000);
        let cancel = Event::ReservationCancelled {
            id: Ulid::new(),
            resource_id: rid,
        };
        let events = vec![first, cancel];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_discards_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = created(Ulid::new(), 0, 10);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8; 6]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_rejects_absurd_frame_length() {
        let path = tmp_path("absurd_len.wal");
        let event = created(Ulid::new(), 0, 10);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let event = created(Ulid::new(), 0, 10);
        {
            let payload = bincode::serialize(&event).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compaction_shrinks_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let rid = Ulid::new();
        let survivor = created(rid, 0, 100);

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&survivor).unwrap();
        for i in 0..20 {
            let id = Ulid::new();
            wal.append(&Event::ReservationCreated {
                id,
                resource_id: rid,
                window: TimeWindow::new(1000 + i * 10, 1005 + i * 10),
                payload: String::new(),
                created_at: 1,
            })
            .unwrap();
            wal.append(&Event::ReservationCancelled { id, resource_id: rid })
                .unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 41);
        let before = fs::metadata(&path).unwrap().len();

        wal.compact(std::slice::from_ref(&survivor)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted log should be smaller: {after} < {before}");

        let late = created(rid, 200, 300);
        wal.append(&late).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![survivor, late]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_are_durable_after_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|i| created(Ulid::new(), i, i + 1)).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_truncates_torn_tail_before_appending() {
        let path = tmp_path("recover_torn.wal");
        let first = created(Ulid::new(), 0, 10);
        let clean_len = {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
            fs::metadata(&path).unwrap().len()
        };
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 3]).unwrap();
        }

        let (mut wal, events) = Wal::recover(&path).unwrap();
        assert_eq!(events, vec![first.clone()]);
        assert_eq!(fs::metadata(&path).unwrap().len(), clean_len);

        let second = created(Ulid::new(), 20, 30);
        wal.append(&second).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_prefix_measures_valid_bytes() {
        let path = tmp_path("prefix_len.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&created(Ulid::new(), 0, 10)).unwrap();
            wal.append(&created(Ulid::new(), 10, 20)).unwrap();
        }
        let full = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
        }

        let (events, valid_len) = Wal::replay_prefix(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(valid_len, full);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn discard_pending_drops_unflushed_frames() {
        let path = tmp_path("discard_pending.wal");
        let kept = created(Ulid::new(), 0, 10);
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();

        for i in 0..3 {
            wal.append_buffered(&created(Ulid::new(), 100 + i, 101 + i))
                .unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 4);
        wal.discard_pending().unwrap();
        assert_eq!(wal.appends_since_compact(), 1);

        let late = created(Ulid::new(), 200, 300);
        wal.append(&late).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, late]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn discard_pending_truncates_bytes_already_written() {
        let path = tmp_path("discard_written.wal");
        let kept = created(Ulid::new(), 0, 10);
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();
        let committed = fs::metadata(&path).unwrap().len();

        // Bytes that reached the file but were never acknowledged.
        wal.append_buffered(&created(Ulid::new(), 50, 60)).unwrap();
        wal.writer.flush().unwrap();
        assert!(fs::metadata(&path).unwrap().len() > committed);

        wal.discard_pending().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), committed);
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![kept]);
        let _ = fs::remove_file(&path);
    }
}
