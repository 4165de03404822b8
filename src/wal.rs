use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode one record as `[u32 len][bincode Event][u32 crc32]`, returning its size.
fn encode_record(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(8 + u64::from(len))
}

/// Events recovered from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Bytes after the last valid record (torn write or corruption).
    pub discarded_bytes: u64,
}

/// Append-only write-ahead log for one tenant.
///
/// Record layout: `[u32 len][bincode Event][u32 crc32]`, little-endian.
/// Replay stops at the first short or checksum-failing record; everything
/// after it is reported as discarded.
///
/// A batch that fails to append or sync is rolled back to the last synced
/// length, so records nobody was told about never reach replay.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length as of the last successful `flush_sync`.
    committed_len: u64,
    pending_len: u64,
    pending_records: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let committed_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            committed_len,
            pending_len: 0,
            pending_records: 0,
        })
    }

    /// Buffer one record. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.pending_len += encode_record(&mut self.writer, event)?;
        self.pending_records += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush buffered records and fsync.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.committed_len += self.pending_len;
        self.pending_len = 0;
        self.pending_records = 0;
        Ok(())
    }

    /// Drop everything appended since the last successful `flush_sync`,
    /// both still-buffered bytes and any that already reached the file.
    pub fn rollback(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        file.set_len(self.committed_len)?;
        file.sync_all()?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the unflushed buffer instead of writing it.
        let _ = stale.into_parts();
        self.appends_since_compact = self
            .appends_since_compact
            .saturating_sub(self.pending_records);
        self.pending_len = 0;
        self.pending_records = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Cut `bytes` of unreadable tail off the file so later appends stay replayable.
    pub fn truncate_tail(&mut self, bytes: u64) -> io::Result<()> {
        self.writer.flush()?;
        self.committed_len = self.committed_len.saturating_sub(bytes);
        self.rollback()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn snapshot_path(path: &Path) -> PathBuf {
        path.with_extension("wal.snapshot")
    }

    /// Write a snapshot of the live state next to the log and fsync it.
    pub fn write_snapshot(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::snapshot_path(path))?);
        for event in events {
            encode_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the log and reopen it for appends.
    pub fn install_snapshot(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::snapshot_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.committed_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.pending_len = 0;
        self.pending_records = 0;
        Ok(())
    }

    /// Read every intact record. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let total = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();
        let mut consumed = 0u64;

        while let Some((event, size)) = read_record(&mut reader)? {
            replay.events.push(event);
            consumed += size;
        }
        replay.discarded_bytes = total - consumed;
        Ok(replay)
    }
}

/// Read one record. `Ok(None)` on clean EOF, a torn tail or a corrupt record.
fn read_record(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
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
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Some((event, 8 + len as u64))),
        Err(_) => Ok(None),
    }
}

/// `false` when the reader ran out before `buf` was filled.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
