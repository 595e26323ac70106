//! Streaming ZIP encoder.
//!
//! Entries are written with general-purpose flag bit 3 set: the local header
//! carries zero CRC and sizes, and the real values follow the compressed data
//! in a data descriptor. Nothing is ever rewritten, so the sink only needs
//! [`Write`]. The central directory is emitted by [`ZipStream::finish`]; an
//! archive that is never finished has no central directory.

use std::io::{self, Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::write::DeflateEncoder;
use flate2::Compression;
use time::OffsetDateTime;

use crate::context::RequestContext;
use crate::error::{Result, StorageError};

/// Chunk size for copying entry data.
pub const COPY_CHUNK_SIZE: usize = 64 * 1024;

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const DATA_DESCRIPTOR_SIG: u32 = 0x0807_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const ZIP64_EOCD_SIG: u32 = 0x0606_4b50;
const ZIP64_LOCATOR_SIG: u32 = 0x0706_4b50;
const EOCD_SIG: u32 = 0x0605_4b50;

const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
const FLAG_UTF8: u16 = 1 << 11;
const METHOD_DEFLATE: u16 = 8;
const VERSION_DEFAULT: u16 = 20;
const VERSION_ZIP64: u16 = 45;
// Upper byte 3 = unix, so external attributes carry a mode.
const VERSION_MADE_BY: u16 = (3 << 8) | VERSION_ZIP64;
const ZIP64_EXTRA_ID: u16 = 0x0001;

// Earliest and latest representable DOS timestamps, as (time, date).
const DOS_MIN: (u16, u16) = (0, (1 << 5) | 1);
const DOS_MAX: (u16, u16) = ((23 << 11) | (59 << 5) | 29, (127 << 9) | (12 << 5) | 31);

const MAX_U16: u64 = 0xFFFF;
const MAX_U32: u64 = 0xFFFF_FFFF;

/// Regular file, rw-r--r--.
pub const DEFAULT_FILE_MODE: u32 = 0o100_644;

/// Metadata for one archive entry.
#[derive(Debug, Clone)]
pub struct EntryHeader<'a> {
    /// `/`-separated entry name.
    pub name: &'a str,
    /// Modification time recorded in the archive.
    pub modified: SystemTime,
    /// Unix mode stored in the external attributes.
    pub mode: u32,
    /// Expected uncompressed size; decides whether the entry uses ZIP64.
    pub size_hint: u64,
}

#[derive(Debug)]
struct CentralRecord {
    name: Vec<u8>,
    crc: u32,
    compressed: u64,
    uncompressed: u64,
    offset: u64,
    dos_time: u16,
    dos_date: u16,
    mode: u32,
}

/// Write-only wrapper counting the bytes passed through.
#[derive(Debug)]
struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.count += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A ZIP archive being written to a forward-only sink.
#[derive(Debug)]
pub struct ZipStream<W: Write> {
    out: CountingWriter<W>,
    records: Vec<CentralRecord>,
}

impl<W: Write> ZipStream<W> {
    /// Start an archive on `sink`. Nothing is written until the first entry.
    pub fn new(sink: W) -> Self {
        Self {
            out: CountingWriter {
                inner: sink,
                count: 0,
            },
            records: Vec::new(),
        }
    }

    /// Bytes emitted to the sink so far.
    pub fn bytes_written(&self) -> u64 {
        self.out.count
    }

    /// Entries fully written so far.
    pub fn entries(&self) -> usize {
        self.records.len()
    }

    /// Deflate everything `source` yields into a new entry.
    ///
    /// `ctx` is checked before every chunk. Returns the uncompressed size.
    pub fn write_entry<R: Read>(
        &mut self,
        header: &EntryHeader<'_>,
        source: &mut R,
        ctx: &RequestContext,
    ) -> Result<u64> {
        let name = header.name.as_bytes();
        if name.len() as u64 > MAX_U16 {
            return Err(StorageError::Archive(format!(
                "entry name is {} bytes, limit is {}",
                name.len(),
                MAX_U16
            )));
        }

        let zip64 = header.size_hint >= MAX_U32;
        let offset = self.out.count;
        let (dos_time, dos_date) = dos_datetime(header.modified);

        let mut local = Vec::with_capacity(30 + name.len() + 20);
        put_u32(&mut local, LOCAL_HEADER_SIG);
        put_u16(&mut local, if zip64 { VERSION_ZIP64 } else { VERSION_DEFAULT });
        put_u16(&mut local, FLAG_DATA_DESCRIPTOR | FLAG_UTF8);
        put_u16(&mut local, METHOD_DEFLATE);
        put_u16(&mut local, dos_time);
        put_u16(&mut local, dos_date);
        put_u32(&mut local, 0);
        if zip64 {
            put_u32(&mut local, MAX_U32 as u32);
            put_u32(&mut local, MAX_U32 as u32);
        } else {
            put_u32(&mut local, 0);
            put_u32(&mut local, 0);
        }
        put_u16(&mut local, name.len() as u16);
        put_u16(&mut local, if zip64 { 20 } else { 0 });
        local.extend_from_slice(name);
        if zip64 {
            put_u16(&mut local, ZIP64_EXTRA_ID);
            put_u16(&mut local, 16);
            put_u64(&mut local, 0);
            put_u64(&mut local, 0);
        }
        self.out.write_all(&local)?;

        let data_start = self.out.count;
        let mut hasher = crc32fast::Hasher::new();
        let mut uncompressed: u64 = 0;
        {
            let mut encoder = DeflateEncoder::new(&mut self.out, Compression::default());
            let mut buf = vec![0u8; COPY_CHUNK_SIZE];
            loop {
                ctx.check()?;
                let n = match source.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                };
                hasher.update(&buf[..n]);
                uncompressed += n as u64;
                encoder.write_all(&buf[..n])?;
            }
            encoder.finish()?;
        }
        let compressed = self.out.count - data_start;
        let crc = hasher.finalize();

        if !zip64 && (uncompressed >= MAX_U32 || compressed >= MAX_U32) {
            return Err(StorageError::Archive(format!(
                "entry {} grew past 4 GiB while being archived",
                header.name
            )));
        }

        let mut descriptor = Vec::with_capacity(24);
        put_u32(&mut descriptor, DATA_DESCRIPTOR_SIG);
        put_u32(&mut descriptor, crc);
        if zip64 {
            put_u64(&mut descriptor, compressed);
            put_u64(&mut descriptor, uncompressed);
        } else {
            put_u32(&mut descriptor, compressed as u32);
            put_u32(&mut descriptor, uncompressed as u32);
        }
        self.out.write_all(&descriptor)?;

        self.records.push(CentralRecord {
            name: name.to_vec(),
            crc,
            compressed,
            uncompressed,
            offset,
            dos_time,
            dos_date,
            mode: header.mode,
        });
        Ok(uncompressed)
    }

    /// Write the central directory.
    ///
    /// Returns the sink and the total number of bytes written to it.
    pub fn finish(mut self) -> Result<(W, u64)> {
        let directory_start = self.out.count;

        for record in &self.records {
            let mut extra = Vec::new();
            let uncompressed = clamp_u32(record.uncompressed, &mut extra);
            let compressed = clamp_u32(record.compressed, &mut extra);
            let offset = clamp_u32(record.offset, &mut extra);

            let mut entry = Vec::with_capacity(46 + record.name.len() + 28);
            put_u32(&mut entry, CENTRAL_HEADER_SIG);
            put_u16(&mut entry, VERSION_MADE_BY);
            put_u16(&mut entry, if extra.is_empty() { VERSION_DEFAULT } else { VERSION_ZIP64 });
            put_u16(&mut entry, FLAG_DATA_DESCRIPTOR | FLAG_UTF8);
            put_u16(&mut entry, METHOD_DEFLATE);
            put_u16(&mut entry, record.dos_time);
            put_u16(&mut entry, record.dos_date);
            put_u32(&mut entry, record.crc);
            put_u32(&mut entry, compressed);
            put_u32(&mut entry, uncompressed);
            put_u16(&mut entry, record.name.len() as u16);
            put_u16(&mut entry, if extra.is_empty() { 0 } else { extra.len() as u16 + 4 });
            put_u16(&mut entry, 0); // comment
            put_u16(&mut entry, 0); // disk
            put_u16(&mut entry, 0); // internal attributes
            put_u32(&mut entry, record.mode << 16);
            put_u32(&mut entry, offset);
            entry.extend_from_slice(&record.name);
            if !extra.is_empty() {
                put_u16(&mut entry, ZIP64_EXTRA_ID);
                put_u16(&mut entry, extra.len() as u16);
                entry.extend_from_slice(&extra);
            }
            self.out.write_all(&entry)?;
        }

        let directory_size = self.out.count - directory_start;
        let count = self.records.len() as u64;
        let mut end = Vec::with_capacity(98);

        if count >= MAX_U16 || directory_size >= MAX_U32 || directory_start >= MAX_U32 {
            let record_offset = self.out.count;
            put_u32(&mut end, ZIP64_EOCD_SIG);
            put_u64(&mut end, 44);
            put_u16(&mut end, VERSION_MADE_BY);
            put_u16(&mut end, VERSION_ZIP64);
            put_u32(&mut end, 0);
            put_u32(&mut end, 0);
            put_u64(&mut end, count);
            put_u64(&mut end, count);
            put_u64(&mut end, directory_size);
            put_u64(&mut end, directory_start);

            put_u32(&mut end, ZIP64_LOCATOR_SIG);
            put_u32(&mut end, 0);
            put_u64(&mut end, record_offset);
            put_u32(&mut end, 1);
        }

        put_u32(&mut end, EOCD_SIG);
        put_u16(&mut end, 0);
        put_u16(&mut end, 0);
        put_u16(&mut end, count.min(MAX_U16) as u16);
        put_u16(&mut end, count.min(MAX_U16) as u16);
        put_u32(&mut end, directory_size.min(MAX_U32) as u32);
        put_u32(&mut end, directory_start.min(MAX_U32) as u32);
        put_u16(&mut end, 0);
        self.out.write_all(&end)?;

        self.out.flush()?;
        Ok((self.out.inner, self.out.count))
    }
}

/// Return `value` as a 32-bit header field, spilling it to `extra` if it needs ZIP64.
fn clamp_u32(value: u64, extra: &mut Vec<u8>) -> u32 {
    if value >= MAX_U32 {
        put_u64(extra, value);
        MAX_U32 as u32
    } else {
        value as u32
    }
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// MS-DOS `(time, date)` for `time` in UTC, clamped to 1980..=2107.
pub fn dos_datetime(time: SystemTime) -> (u16, u16) {
    let at = time
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| i64::try_from(d.as_secs()).ok())
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok());
    let Some(at) = at else {
        return if time < UNIX_EPOCH { DOS_MIN } else { DOS_MAX };
    };

    match at.year() {
        year if year < 1980 => DOS_MIN,
        year if year > 2107 => DOS_MAX,
        year => {
            let time = (u16::from(at.hour()) << 11)
                | (u16::from(at.minute()) << 5)
                | u16::from(at.second() / 2);
            let date = (((year - 1980) as u16) << 9)
                | (u16::from(u8::from(at.month())) << 5)
                | u16::from(at.day());
            (time, date)
        }
    }
}
