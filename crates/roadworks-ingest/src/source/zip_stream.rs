//! Central-directory-free zip reading
//!
//! Entries are inflated one by one in archive order as bytes arrive, so the
//! archive is never held on disk or in memory. Names, methods and sizes come
//! from each local header. Deflated entries written with a trailing data
//! descriptor carry no sizes up front: they are inflated until the deflate
//! stream ends, and the descriptor after them supplies the CRC.
//!
//! Two readers are built on [`ZipStream`]:
//!
//! - [`json_entries`]: one record per `.json` entry
//! - [`csv_members`]: one record per kept row of every `.csv` entry

use std::io::{self, BufRead, BufReader, Read};

use flate2::bufread::DeflateDecoder;
use flate2::Crc;
use tokio::io::AsyncRead;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, info, warn};

use super::progress::count_bar;
use super::{spawn_producer, EventSender, ReaderOptions, RecordStream, SourceEvent};
use crate::error::{IngestError, Result};
use crate::record::{RawPayload, RawRecord, RecordOrigin};

const LOCAL_HEADER: u32 = 0x0403_4b50;
const CENTRAL_HEADER: u32 = 0x0201_4b50;
const END_OF_CENTRAL_DIRECTORY: u32 = 0x0605_4b50;
const ZIP64_END_OF_CENTRAL_DIRECTORY: u32 = 0x0606_4b50;
const DATA_DESCRIPTOR: u32 = 0x0807_4b50;

const FLAG_ENCRYPTED: u16 = 1;
const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;

const STORED: u16 = 0;
const DEFLATED: u16 = 8;

const ZIP64_EXTRA: u16 = 0x0001;

const READ_BUFFER: usize = 64 * 1024;

/// Columns of a row read by [`csv_members`]
pub const CSV_MEMBER_COLUMNS: &[&str] = &["source_file", "table_id", "column_values"];

// ============================================================================
// Entry reader
// ============================================================================

/// What a local header says about the entry after it
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LocalEntry {
    pub name: String,
    method: u16,
    flags: u16,
    crc32: u32,
    compressed_size: u64,
    zip64: bool,
}

impl LocalEntry {
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }

    fn has_descriptor(&self) -> bool {
        self.flags & FLAG_DATA_DESCRIPTOR != 0
    }

    fn has_extension(&self, extension: &str) -> bool {
        !self.is_dir() && self.name.to_ascii_lowercase().ends_with(extension)
    }
}

/// Whether an entry's bytes matched what the archive recorded for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EntryStatus {
    Intact,
    /// The entry is unusable but the next one can still be found
    Corrupt(String),
}

/// Walks the local headers of a zip byte stream
pub(crate) struct ZipStream<R> {
    inner: R,
}

impl<R: BufRead> ZipStream<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Header of the next entry, `None` once the central directory or the end
    /// of input is reached
    ///
    /// The previous entry's body must have been finished first.
    pub fn next_entry(&mut self) -> Result<Option<LocalEntry>> {
        if self.inner.fill_buf()?.is_empty() {
            return Ok(None);
        }

        let signature = u32::from_le_bytes(read_array(&mut self.inner, "a record signature")?);
        match signature {
            LOCAL_HEADER => {},
            CENTRAL_HEADER | END_OF_CENTRAL_DIRECTORY | ZIP64_END_OF_CENTRAL_DIRECTORY => {
                return Ok(None)
            },
            other => {
                return Err(IngestError::Archive(format!(
                    "unexpected record signature {:#010x}",
                    other
                )))
            },
        }

        let header: [u8; 26] = read_array(&mut self.inner, "a local header")?;
        let flags = le16(&header, 2);
        let method = le16(&header, 4);
        let crc32 = le32(&header, 10);
        let compressed = le32(&header, 14);
        let uncompressed = le32(&header, 18);
        let name = read_vec(&mut self.inner, usize::from(le16(&header, 22)), "an entry name")?;
        let extra = read_vec(&mut self.inner, usize::from(le16(&header, 24)), "an extra field")?;
        let name = String::from_utf8_lossy(&name).into_owned();

        if flags & FLAG_ENCRYPTED != 0 {
            return Err(IngestError::Archive(format!("entry {} is encrypted", name)));
        }

        let mut compressed_size = u64::from(compressed);
        let zip64 = match zip64_block(&extra) {
            Some(block) => {
                let mut sizes = block
                    .chunks_exact(8)
                    .filter_map(|c| <[u8; 8]>::try_from(c).ok())
                    .map(u64::from_le_bytes);
                if uncompressed == u32::MAX {
                    sizes.next();
                }
                if compressed == u32::MAX {
                    compressed_size = sizes.next().ok_or_else(|| {
                        IngestError::Archive(format!("entry {} has a short zip64 field", name))
                    })?;
                }
                true
            },
            None => false,
        };

        Ok(Some(LocalEntry {
            name,
            method,
            flags,
            crc32,
            compressed_size,
            zip64,
        }))
    }

    /// Reader over the inflated bytes of `entry`
    pub fn body(&mut self, entry: &LocalEntry) -> Result<EntryBody<'_, R>> {
        let descriptor = entry.has_descriptor();
        let limit = if descriptor {
            u64::MAX
        } else {
            entry.compressed_size
        };
        let raw = (&mut self.inner).take(limit);

        let decoder = match entry.method {
            STORED if descriptor => {
                return Err(IngestError::Archive(format!(
                    "stored entry {} has no recorded size",
                    entry.name
                )))
            },
            STORED => Decoder::Stored(raw),
            DEFLATED => Decoder::Deflated(DeflateDecoder::new(raw)),
            method if descriptor => {
                return Err(IngestError::Archive(format!(
                    "entry {} uses compression method {} and has no recorded size",
                    entry.name, method
                )))
            },
            method => Decoder::Unsupported { raw, method },
        };

        Ok(EntryBody {
            name: entry.name.clone(),
            decoder,
            crc: Crc::new(),
            expected_crc: entry.crc32,
            descriptor: descriptor.then_some(entry.zip64),
            failure: None,
        })
    }
}

enum Decoder<T> {
    Stored(T),
    Deflated(DeflateDecoder<T>),
    Unsupported { raw: T, method: u16 },
}

impl<T: BufRead> Decoder<T> {
    fn into_raw(self) -> T {
        match self {
            Decoder::Stored(raw) => raw,
            Decoder::Deflated(decoder) => decoder.into_inner(),
            Decoder::Unsupported { raw, .. } => raw,
        }
    }
}

/// Inflated bytes of one entry
///
/// Call [`EntryBody::finish`] before asking for the next entry.
pub(crate) struct EntryBody<'a, R> {
    name: String,
    decoder: Decoder<io::Take<&'a mut R>>,
    crc: Crc,
    expected_crc: u32,
    /// `Some(zip64)` when a data descriptor follows the entry
    descriptor: Option<bool>,
    failure: Option<String>,
}

impl<R: BufRead> Read for EntryBody<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = match &mut self.decoder {
            Decoder::Stored(raw) => raw.read(buf),
            Decoder::Deflated(decoder) => decoder.read(buf),
            Decoder::Unsupported { method, .. } => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported compression method {}", method),
            )),
        };

        match result {
            Ok(n) => {
                self.crc.update(&buf[..n]);
                Ok(n)
            },
            Err(e) => {
                self.failure.get_or_insert_with(|| e.to_string());
                Err(e)
            },
        }
    }
}

impl<R: BufRead> EntryBody<'_, R> {
    /// Skip whatever is left of the entry and check it against its CRC
    ///
    /// An error means the stream can no longer be followed.
    pub fn finish(mut self) -> Result<EntryStatus> {
        if self.failure.is_none() {
            // A failed read is recorded in `failure`.
            let _ = io::copy(&mut self, &mut io::sink());
        }

        let EntryBody {
            name,
            decoder,
            crc,
            expected_crc,
            descriptor,
            failure,
        } = self;
        let mut raw = decoder.into_raw();

        let expected_crc = match descriptor {
            None => {
                io::copy(&mut raw, &mut io::sink())?;
                if raw.limit() > 0 {
                    return Err(IngestError::Archive(format!("archive ended inside entry {}", name)));
                }
                expected_crc
            },
            Some(zip64) => {
                if let Some(reason) = failure {
                    return Err(IngestError::Archive(format!(
                        "entry {} could not be inflated and its end cannot be found: {}",
                        name, reason
                    )));
                }
                read_descriptor(raw.into_inner(), zip64)?
            },
        };

        if let Some(reason) = failure {
            return Ok(EntryStatus::Corrupt(reason));
        }
        if crc.sum() != expected_crc {
            return Ok(EntryStatus::Corrupt(format!(
                "Invalid checksum: expected {:08x}, found {:08x}",
                expected_crc,
                crc.sum()
            )));
        }
        Ok(EntryStatus::Intact)
    }
}

/// CRC from the descriptor after an entry; its signature is optional
fn read_descriptor<R: BufRead>(inner: &mut R, zip64: bool) -> Result<u32> {
    let first = u32::from_le_bytes(read_array(inner, "a data descriptor")?);
    let crc = if first == DATA_DESCRIPTOR {
        u32::from_le_bytes(read_array(inner, "a data descriptor")?)
    } else {
        first
    };
    read_vec(inner, if zip64 { 16 } else { 8 }, "a data descriptor")?;
    Ok(crc)
}

fn zip64_block(extra: &[u8]) -> Option<&[u8]> {
    let mut rest = extra;
    while rest.len() >= 4 {
        let id = le16(rest, 0);
        let len = usize::from(le16(rest, 2));
        let data = rest.get(4..4 + len)?;
        if id == ZIP64_EXTRA {
            return Some(data);
        }
        rest = &rest[4 + len..];
    }
    None
}

fn le16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn le32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_array<const N: usize, R: Read>(reader: &mut R, what: &str) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf).map_err(|e| truncated(e, what))?;
    Ok(buf)
}

fn read_vec<R: Read>(reader: &mut R, len: usize, what: &str) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).map_err(|e| truncated(e, what))?;
    Ok(buf)
}

fn truncated(err: io::Error, what: &str) -> IngestError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        IngestError::Archive(format!("archive ended inside {}", what))
    } else {
        err.into()
    }
}

// ============================================================================
// JSON entries
// ============================================================================

/// Stream the JSON entries of a zip archive read from `body`
///
/// Must be called from within a Tokio runtime.
pub fn json_entries<R>(body: R, options: &ReaderOptions) -> RecordStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let bridge = SyncIoBridge::new(body);
    let show_progress = options.show_progress;

    spawn_producer(options.channel_capacity, move |events| {
        read_json_entries(BufReader::with_capacity(READ_BUFFER, bridge), events, show_progress)
    })
}

/// Read entries from a zip byte stream until the end of the archive
///
/// An entry that fails to inflate or to match its CRC is reported as skipped.
/// A corrupt header is returned as an error because the reader cannot find
/// the next entry without it.
pub(crate) fn read_json_entries<R: BufRead>(
    reader: R,
    events: &EventSender,
    show_progress: bool,
) -> Result<()> {
    let pb = count_bar(None, "Reading archive entries", show_progress);
    let mut archive = ZipStream::new(reader);
    let mut index = 0u64;

    while let Some(entry) = archive.next_entry()? {
        let mut body = archive.body(&entry)?;
        if !entry.has_extension(".json") {
            if !entry.is_dir() {
                debug!(entry = %entry.name, "Ignoring non-JSON archive entry");
            }
            body.finish()?;
            continue;
        }

        let origin = RecordOrigin::new(index, entry.name);
        index += 1;

        let mut bytes = Vec::new();
        let read = body.read_to_end(&mut bytes);
        let event = match (body.finish()?, read) {
            (EntryStatus::Intact, Ok(_)) => {
                SourceEvent::Record(RawRecord::new(origin, RawPayload::Document(bytes)))
            },
            (EntryStatus::Corrupt(reason), _) => skipped(origin, reason),
            (EntryStatus::Intact, Err(e)) => skipped(origin, e.to_string()),
        };

        if !events.send(event) {
            debug!(entries = index, "Record stream dropped, stopping archive reader");
            return Ok(());
        }
        pb.inc(1);
    }

    pb.finish_and_clear();
    debug!(entries = index, "Reached end of archive");
    Ok(())
}

fn skipped(origin: RecordOrigin, reason: String) -> SourceEvent {
    warn!(entry = %origin.name, reason = %reason, "Skipping unreadable archive entry");
    SourceEvent::Skipped { origin, reason }
}

// ============================================================================
// CSV members
// ============================================================================

/// Stream the rows of every CSV member of a zip archive read from `body`
///
/// Files have no header row and mix record types; the second field names the
/// type. Rows of a type in `record_types` become one record with the member's
/// name, the type, and the whole row as a JSON array of strings (see
/// [`CSV_MEMBER_COLUMNS`]). Other rows are dropped. An archive without a CSV
/// member ends the stream with an error.
pub fn csv_members<R>(
    body: R,
    url: String,
    record_types: Vec<String>,
    options: &ReaderOptions,
) -> RecordStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let bridge = SyncIoBridge::new(body);
    let show_progress = options.show_progress;

    spawn_producer(options.channel_capacity, move |events| {
        read_csv_members(
            BufReader::with_capacity(READ_BUFFER, bridge),
            &url,
            &record_types,
            events,
            show_progress,
        )
    })
}

pub(crate) fn read_csv_members<R: BufRead>(
    reader: R,
    url: &str,
    record_types: &[String],
    events: &EventSender,
    show_progress: bool,
) -> Result<()> {
    let mut archive = ZipStream::new(reader);
    let mut members = 0u32;
    let mut index = 0u64;

    while let Some(entry) = archive.next_entry()? {
        let mut body = archive.body(&entry)?;
        if !entry.has_extension(".csv") {
            body.finish()?;
            continue;
        }

        members += 1;
        info!(member = %entry.name, "Processing CSV member");
        let pb = count_bar(None, format!("Reading {}", entry.name), show_progress);

        let mut rows = ::csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(&mut body);
        let mut record = ::csv::StringRecord::new();
        let mut line = 0u64;
        let mut ignored = 0u64;

        loop {
            let event = match rows.read_record(&mut record) {
                Ok(false) => break,
                Ok(true) => {
                    line += 1;
                    let origin = RecordOrigin::new(index, format!("{}:{}", entry.name, line));
                    match record.get(1) {
                        Some(kind) if record_types.iter().any(|t| t == kind) => {
                            SourceEvent::Record(RawRecord::new(
                                origin,
                                RawPayload::Delimited {
                                    names: CSV_MEMBER_COLUMNS.iter().map(|c| c.to_string()).collect(),
                                    values: vec![
                                        entry.name.clone(),
                                        kind.to_string(),
                                        row_as_json(&record),
                                    ],
                                },
                            ))
                        },
                        Some(_) => {
                            ignored += 1;
                            continue;
                        },
                        None => SourceEvent::Skipped {
                            origin,
                            reason: "row has no record type".to_string(),
                        },
                    }
                },
                // The body records the failure; `finish` decides what it means.
                Err(e) if e.is_io_error() => break,
                Err(e) => {
                    line += 1;
                    let origin = RecordOrigin::new(index, format!("{}:{}", entry.name, line));
                    warn!(row = %origin, error = %e, "Skipping unparsable CSV row");
                    SourceEvent::Skipped {
                        origin,
                        reason: e.to_string(),
                    }
                },
            };

            index += 1;
            if !events.send(event) {
                debug!(rows = index, "Record stream dropped, stopping CSV reader");
                return Ok(());
            }
            pb.inc(1);
        }
        drop(rows);
        pb.finish_and_clear();

        if let EntryStatus::Corrupt(reason) = body.finish()? {
            warn!(member = %entry.name, reason = %reason, "CSV member failed its integrity check");
            let origin = RecordOrigin::new(index, entry.name.clone());
            let message = format!("member failed its integrity check: {}", reason);
            if !events.send(SourceEvent::Warning { origin, message }) {
                return Ok(());
            }
        }
        info!(member = %entry.name, rows = line, ignored, "Finished CSV member");
    }

    if members == 0 {
        return Err(IngestError::MissingArchiveMember {
            url: url.to_string(),
            extension: ".csv".to_string(),
        });
    }
    Ok(())
}

fn row_as_json(record: &::csv::StringRecord) -> String {
    serde_json::Value::Array(
        record
            .iter()
            .map(|field| serde_json::Value::String(field.to_string()))
            .collect(),
    )
    .to_string()
}
