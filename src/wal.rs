use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode a single event to [len][bincode][crc32] format.
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

enum Frame {
    Event(Event),
    /// Clean end of file, or a torn/corrupt tail that ends replay.
    End,
}

/// `read_exact` that maps a short read to `Ok(false)`.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    if !fill(reader, &mut len_buf)? {
        return Ok(Frame::End);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    if !fill(reader, &mut payload)? {
        return Ok(Frame::End);
    }
    let mut crc_buf = [0u8; 4];
    if !fill(reader, &mut crc_buf)? {
        return Ok(Frame::End);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Frame::End);
    }
    Ok(bincode::deserialize::<Event>(&payload).map_or(Frame::End, Frame::Event))
}

/// Append-only Write-Ahead Log of slot and booking events.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A truncated or corrupt tail (crash mid-write) ends replay; earlier entries survive.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            writer: BufWriter::new(Self::open_append(path)?),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    /// Append one event and fsync. Production code batches via
    /// `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event without flushing. Durable only after `flush_sync()`.
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

    /// Write compacted events to a temp file and fsync. This is the slow phase.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        self.writer = BufWriter::new(Self::open_append(&self.path)?);
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

    /// Read every intact event from disk. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Frame::Event(event) = read_frame(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }
}
