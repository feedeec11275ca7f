use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode a single event to `[len][bincode][crc32]`.
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

/// Fill `buf`, or return `Ok(false)` if the file ends first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next valid event and its encoded size, or `None` at end of file or at the
/// first torn/corrupt entry. `remaining` bounds the length prefix so a garbage
/// prefix cannot trigger a huge allocation.
fn decode_event(reader: &mut impl Read, remaining: u64) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u64::from(u32::from_le_bytes(len_buf));
    let size = len + 8;
    if size > remaining {
        return Ok(None);
    }
    let mut payload = vec![0u8; len as usize];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Event>(&payload).ok().map(|e| (e, size)))
}

/// Append-only write-ahead log of resource and reservation events.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`. A torn last
/// entry (crash mid-write) is dropped on replay via the length prefix and CRC.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer without syncing; `flush_sync` commits the whole group.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the compacted event set to a temp file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let file = File::create(Self::compact_tmp_path(path))?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the log and reopen it for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
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

    /// All valid events on disk; a missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(Self::replay_valid_prefix(path)?.0)
    }

    /// Replay, then cut the file back to the last valid entry so that new
    /// appends are not written behind a torn tail.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let (events, valid_len) = Self::replay_valid_prefix(path)?;
        let file_len = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(events),
            Err(e) => return Err(e),
        };
        if file_len > valid_len {
            tracing::warn!(
                "discarding {} bytes of torn WAL tail in {}",
                file_len - valid_len,
                path.display()
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok(events)
    }

    /// Valid events plus the byte length of the prefix they occupy.
    fn replay_valid_prefix(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut offset = 0u64;
        while let Some((event, size)) = decode_event(&mut reader, file_len - offset)? {
            events.push(event);
            offset += size;
        }
        Ok((events, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Span;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn resource_created(id: Ulid) -> Event {
        Event::ResourceCreated {
            id,
            name: "Centrifuge".into(),
            remarks: String::new(),
            owner: "alice".into(),
            at: 1,
        }
    }

    fn reservation_created(id: Ulid, resource_id: Ulid) -> Event {
        Event::ReservationCreated {
            id,
            resource_id,
            name: "Haruto".into(),
            contact: "haruto@example.com".into(),
            remarks: String::new(),
            span: Span::new(1000, 2000),
            owner: None,
            credential: "9b2d6f1e-8c4a-4e7b-a1d3-5f6e7c8b9a0d".into(),
            at: 2,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let rid = Ulid::new();
        let events = vec![resource_created(rid), reservation_created(Ulid::new(), rid)];

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
    fn replay_drops_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = resource_created(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_truncates_torn_tail_before_new_appends() {
        let path = tmp_path("recover_tail.wal");
        let first = resource_created(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0xFFu8; 7]).unwrap();
        }

        assert_eq!(Wal::recover(&path).unwrap(), vec![first.clone()]);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);

        let second = resource_created(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&second).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_missing_file_is_empty() {
        let path = tmp_path("recover_missing.wal");
        assert!(Wal::recover(&path).unwrap().is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let rid = Ulid::new();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&resource_created(rid)).unwrap();
        }
        {
            let payload = bincode::serialize(&Event::ResourceDeleted { id: rid }).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![resource_created(rid)]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_shrinks_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let rid = Ulid::new();

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&resource_created(rid)).unwrap();
            for _ in 0..20 {
                let id = Ulid::new();
                wal.append(&reservation_created(id, rid)).unwrap();
                wal.append(&Event::ReservationDeleted { id, resource_id: rid }).unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        let kept = reservation_created(Ulid::new(), rid);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&[resource_created(rid)]).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&kept).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), vec![resource_created(rid), kept]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_counted_until_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|_| resource_created(Ulid::new())).collect();

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
}
