//! Zipped CSV reader
//!
//! The archive is downloaded to scratch, its first `.csv` member extracted and
//! read one row at a time. Column names come from the caller; the file's own
//! header row is discarded because its text is not stable between releases.

use std::io::Read;
use std::path::Path;

use tracing::{debug, info, warn};

use super::http::Scratch;
use super::progress::count_bar;
use super::{spawn_producer, EventSender, ReaderOptions, RecordStream, SourceEvent};
use crate::error::Result;
use crate::record::{RawPayload, RawRecord, RecordOrigin};

/// Stream the rows of the CSV inside a downloaded archive
///
/// The scratch directory is removed once the reader finishes or the stream is
/// dropped.
pub fn zipped_csv_rows(
    scratch: Scratch,
    url: String,
    field_names: Vec<String>,
    options: &ReaderOptions,
) -> RecordStream {
    let show_progress = options.show_progress;

    spawn_producer(options.channel_capacity, move |events| {
        let csv_path = scratch.extract_first(".csv", &url)?;
        let file = std::fs::File::open(&csv_path)?;
        let result = read_csv_rows(file, &display_name(&csv_path), &field_names, events, show_progress);
        drop(scratch);
        result
    })
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Read delimited rows, skipping the first physical row
///
/// Rows with the wrong number of fields, or that fail to parse, are reported
/// as skipped. I/O errors end the stream.
pub(crate) fn read_csv_rows<R: Read>(
    input: R,
    source_name: &str,
    field_names: &[String],
    events: &EventSender,
    show_progress: bool,
) -> Result<()> {
    let mut reader = ::csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(input);

    let pb = count_bar(None, format!("Reading {}", source_name), show_progress);
    let mut record = ::csv::StringRecord::new();
    let mut line = 0u64;
    let mut skipped = 0u64;

    loop {
        let event = match reader.read_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {
                line += 1;
                if line == 1 {
                    debug!(header = ?record, "Discarding header row");
                    continue;
                }

                let origin = RecordOrigin::new(line - 2, format!("{}:{}", source_name, line));
                if record.len() == field_names.len() {
                    SourceEvent::Record(RawRecord::new(
                        origin,
                        RawPayload::Delimited {
                            names: field_names.to_vec(),
                            values: record.iter().map(str::to_string).collect(),
                        },
                    ))
                } else {
                    skipped += 1;
                    let reason = format!(
                        "expected {} fields, found {}",
                        field_names.len(),
                        record.len()
                    );
                    warn!(row = %origin, reason = %reason, "Skipping CSV row");
                    SourceEvent::Skipped { origin, reason }
                }
            },
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(e) => {
                line += 1;
                skipped += 1;
                let origin = RecordOrigin::new(
                    line.saturating_sub(2),
                    format!("{}:{}", source_name, line),
                );
                warn!(row = %origin, error = %e, "Skipping unparsable CSV row");
                SourceEvent::Skipped {
                    origin,
                    reason: e.to_string(),
                }
            },
        };

        if !events.send(event) {
            debug!(rows = line, "Record stream dropped, stopping CSV reader");
            return Ok(());
        }
        pb.inc(1);
    }

    pb.finish_and_clear();
    info!(
        file = %source_name,
        rows = line.saturating_sub(1),
        skipped,
        "Finished reading CSV"
    );
    Ok(())
}
