use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

const LEN_BYTES: usize = 4;
const CRC_BYTES: usize = 4;

/// Largest payload a frame may carry. Longer frames are refused on write
/// and read back as corruption.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Frame a single event as `[u32 len][bincode][u32 crc32]`.
/// Nothing is written when the event is too large.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<usize> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("event of {} bytes exceeds the WAL frame limit", payload.len()),
        ));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(LEN_BYTES + payload.len() + CRC_BYTES)
}

/// Read exactly `buf.len()` bytes. `Ok(false)` means the file ended first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Outcome of reading a WAL file back.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Bytes after the last intact frame were dropped.
    pub torn_tail: bool,
    /// Offset just past the last intact frame.
    pub valid_len: u64,
}

/// Append-only write-ahead log for the scheduling engine.
///
/// A crash mid-append leaves at most one torn frame at the end of the file;
/// replay stops at the first frame whose length, checksum or payload is bad.
/// That tail must be cut with [`Wal::truncate`] before the log is reopened,
/// otherwise new frames land behind it and are never read again.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length after the last successful `flush_sync`.
    committed_len: u64,
    committed_appends: u64,
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
            committed_appends: 0,
        })
    }

    /// Cut the file at `len`, dropping a torn tail found by `replay`.
    pub fn truncate(path: &Path, len: u64) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(len)?;
        file.sync_all()
    }

    /// Buffer one event; durable only after `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.committed_len = self.writer.get_ref().metadata()?.len();
        self.committed_appends = self.appends_since_compact;
        Ok(())
    }

    /// Discard everything written since the last successful `flush_sync`,
    /// both still-buffered bytes and bytes that reached the file.
    pub fn rollback(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts returns the unflushed buffer without writing it.
        let (_, _unwritten) = stale.into_parts();
        let file = self.writer.get_ref();
        file.set_len(self.committed_len)?;
        file.sync_all()?;
        self.appends_since_compact = self.committed_appends;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the compacted event set to a sibling temp file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the live log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.committed_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.committed_appends = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Read every intact frame. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();

        loop {
            let mut len_buf = [0u8; LEN_BYTES];
            if !read_full(&mut reader, &mut len_buf)? {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_FRAME_BYTES {
                break;
            }
            let mut payload = vec![0u8; len];
            let mut crc_buf = [0u8; CRC_BYTES];
            if !read_full(&mut reader, &mut payload)? || !read_full(&mut reader, &mut crc_buf)? {
                break;
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => replay.events.push(event),
                Err(_) => break,
            }
            replay.valid_len += (LEN_BYTES + len + CRC_BYTES) as u64;
        }

        // Also catches a partial length header, which read_full reports as a clean end.
        replay.torn_tail = replay.valid_len < file_len;
        if replay.torn_tail {
            tracing::warn!(
                "WAL {}: {} bytes of torn tail after {} events",
                path.display(),
                file_len - replay.valid_len,
                replay.events.len()
            );
        }
        Ok(replay)
    }
}
