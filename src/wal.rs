use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode one event as `[len][bincode][crc32]`.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Outcome of reading one entry during replay.
enum Entry {
    /// A valid entry and its size on disk.
    Event(Event, u64),
    /// Clean end of file.
    End,
    /// Truncated or corrupt bytes; nothing after this point is trusted.
    Torn,
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_entry(reader: &mut impl BufRead) -> io::Result<Entry> {
    if reader.fill_buf()?.is_empty() {
        return Ok(Entry::End);
    }
    // A partial header is a torn write, not a clean end
    let mut len_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut len_buf)? {
        return Ok(Entry::Torn);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > crate::limits::MAX_LINE_LEN * 16 {
        return Ok(Entry::Torn);
    }

    let mut payload = vec![0u8; len];
    if !read_exact_or_eof(reader, &mut payload)? {
        return Ok(Entry::Torn);
    }
    let mut crc_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut crc_buf)? {
        return Ok(Entry::Torn);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Entry::Torn);
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Entry::Event(event, 8 + len as u64)),
        Err(_) => Ok(Entry::Torn),
    }
}

/// Destination of committed WAL bytes. Lets a failed write be rolled back.
trait LogSink: Write {
    fn committed_len(&self) -> io::Result<u64>;
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
    fn sync(&self) -> io::Result<()>;
}

impl LogSink for File {
    fn committed_len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&self) -> io::Result<()> {
        self.sync_all()
    }
}

/// Write `bytes` and fsync. On failure the sink is cut back to its previous
/// length so a partial batch never reaches replay.
fn write_or_rollback(sink: &mut impl LogSink, bytes: &[u8]) -> io::Result<()> {
    let before = sink.committed_len()?;
    let result = sink.write_all(bytes).and_then(|()| sink.flush()).and_then(|()| sink.sync());
    if result.is_err()
        && let Err(e) = sink.truncate_to(before).and_then(|()| sink.sync())
    {
        tracing::error!("WAL rollback to {before} bytes failed: {e}");
    }
    result
}

/// Append-only log of reservation events.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`, little endian.
/// A torn tail (crash mid-write) is dropped on replay and cut off by [`Wal::recover`].
pub struct Wal {
    file: File,
    /// Encoded entries not yet written; all of them land or none do.
    pending: Vec<u8>,
    pending_count: u64,
    path: PathBuf,
    appends_since_compact: u64,
}

/// Events read from a log and the length of its valid prefix.
struct Scanned {
    events: Vec<Event>,
    valid_len: u64,
    torn: bool,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file,
            pending: Vec::new(),
            pending_count: 0,
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync a single event.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event; durable only after `flush_sync()`.
    /// A failed encode leaves the buffer untouched.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        let mut entry = Vec::new();
        encode_event(&mut entry, event)?;
        self.pending.extend_from_slice(&entry);
        self.pending_count += 1;
        Ok(())
    }

    /// Write every buffered entry and fsync. On error none of them are kept.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        let pending = std::mem::take(&mut self.pending);
        let count = std::mem::take(&mut self.pending_count);
        if pending.is_empty() {
            return self.file.sync_all();
        }
        write_or_rollback(&mut self.file, &pending)?;
        self.appends_since_compact += count;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the compacted event set to `<wal>.tmp` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the WAL and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every valid event from disk. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(Self::scan(path)?.events)
    }

    /// Replay, then cut a torn tail off the file so later appends follow the
    /// last valid entry. Call before [`Wal::open`].
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let scanned = Self::scan(path)?;
        if scanned.torn {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(scanned.valid_len)?;
            file.sync_all()?;
            tracing::warn!(
                "WAL {}: truncated to {} bytes after {} valid events",
                path.display(),
                scanned.valid_len,
                scanned.events.len()
            );
        }
        Ok(scanned.events)
    }

    fn scan(path: &Path) -> io::Result<Scanned> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Scanned { events: Vec::new(), valid_len: 0, torn: false });
            }
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0u64;
        loop {
            match read_entry(&mut reader)? {
                Entry::Event(event, size) => {
                    events.push(event);
                    valid_len += size;
                }
                Entry::End => return Ok(Scanned { events, valid_len, torn: false }),
                Entry::Torn => {
                    tracing::warn!(
                        "WAL {}: discarding torn tail after {} events",
                        path.display(),
                        events.len()
                    );
                    return Ok(Scanned { events, valid_len, torn: true });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HourSpan, ResourceKind};
    use chrono::NaiveDate;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotdesk_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn placed(id: u64, owner: i64) -> Event {
        Event::ReservationPlaced {
            id,
            owner,
            kind: ResourceKind::Console,
            date: NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(),
            span: HourSpan::new(18, 19),
        }
    }

    fn registered(id: i64) -> Event {
        Event::UserRegistered {
            id,
            full_name: "Иван Петров".into(),
            phone: "+70000000000".into(),
            is_student: true,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![registered(1), placed(1, 1)];
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
    fn replay_drops_truncated_tail() {
        let path = tmp_path("truncation.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&placed(1, 1)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8; 6]).unwrap(); // partial length + some bytes
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![placed(1, 1)]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_cuts_torn_tail_so_later_appends_replay() {
        let path = tmp_path("recover_torn.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&placed(1, 1)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 2]).unwrap(); // half a length header
        }
        let valid = fs::metadata(&path).unwrap().len() - 2;

        assert_eq!(Wal::recover(&path).unwrap(), vec![placed(1, 1)]);
        assert_eq!(fs::metadata(&path).unwrap().len(), valid);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&placed(2, 2)).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![placed(1, 1), placed(2, 2)]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_leaves_clean_log_alone() {
        let path = tmp_path("recover_clean.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&registered(3)).unwrap();
        }
        let len = fs::metadata(&path).unwrap().len();
        assert_eq!(Wal::recover(&path).unwrap(), vec![registered(3)]);
        assert_eq!(fs::metadata(&path).unwrap().len(), len);
        let _ = fs::remove_file(&path);
    }

    /// In-memory sink that fails once `room` bytes have been written.
    struct ShortDisk {
        data: Vec<u8>,
        room: usize,
    }

    impl Write for ShortDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.room == 0 {
                return Err(io::Error::other("disk full"));
            }
            let n = self.room.min(buf.len());
            self.data.extend_from_slice(&buf[..n]);
            self.room -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogSink for ShortDisk {
        fn committed_len(&self) -> io::Result<u64> {
            Ok(self.data.len() as u64)
        }

        fn truncate_to(&mut self, len: u64) -> io::Result<()> {
            self.data.truncate(len as usize);
            Ok(())
        }

        fn sync(&self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_write_rolls_back_the_whole_batch() {
        let mut batch = Vec::new();
        encode_event(&mut batch, &placed(1, 1)).unwrap();
        encode_event(&mut batch, &placed(2, 2)).unwrap();

        let mut disk = ShortDisk { data: b"head".to_vec(), room: batch.len() - 3 };
        assert!(write_or_rollback(&mut disk, &batch).is_err());
        assert_eq!(disk.data, b"head");

        let mut disk = ShortDisk { data: b"head".to_vec(), room: batch.len() };
        write_or_rollback(&mut disk, &batch).unwrap();
        assert_eq!(disk.data.len(), 4 + batch.len());
    }

    #[test]
    fn appends_count_only_after_flush() {
        let path = tmp_path("pending_count.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.append_buffered(&placed(1, 1)).unwrap();
        wal.append_buffered(&placed(2, 1)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(Wal::replay(&path).unwrap().is_empty());
        wal.flush_sync().unwrap();
        assert_eq!(wal.appends_since_compact(), 2);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("corrupt_crc.wal");
        {
            let payload = bincode::serialize(&placed(1, 1)).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_shrinks_and_keeps_appending() {
        let path = tmp_path("compact.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&registered(1)).unwrap();
            for id in 0..20 {
                wal.append(&placed(id, 1)).unwrap();
                wal.append(&Event::ReservationCancelled {
                    id,
                    kind: ResourceKind::Console,
                    date: NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(),
                })
                .unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        let compacted = vec![registered(1)];
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&compacted).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&placed(21, 1)).unwrap();
        }
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), vec![registered(1), placed(21, 1)]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_are_durable_after_flush() {
        let path = tmp_path("buffered_flush.wal");
        let events: Vec<Event> = (0..5).map(|i| placed(i, 7)).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            wal.flush_sync().unwrap();
            assert_eq!(wal.appends_since_compact(), 5);
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }
}
