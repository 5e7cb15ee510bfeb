//! Archive stream readers
//!
//! A [`RecordSource`] opens a remote archive and yields its records one at a
//! time as a [`RecordStream`]. Each call to [`RecordSource::open`] issues a
//! fresh request; a stream is consumed once and cannot be rewound.
//!
//! Archive work (inflating zip entries, parsing CSV, reading SQLite) is
//! blocking, so it runs on a `spawn_blocking` producer that hands events to
//! the async side over a bounded channel. Dropping the stream stops the
//! producer at its next send.
//!
//! # Supported archives
//!
//! - **JSON zip**: many small JSON documents, inflated entry by entry straight
//!   off the network with no central directory lookup
//! - **Zipped CSV**: one CSV member with a fixed column layout
//! - **GeoPackage**: one `.gpkg` member, features read from a named layer
//! - **CSV members**: every `.csv` member of a streamed zip, rows filtered by
//!   record type

pub mod csv;
pub mod gpkg;
pub mod http;
pub mod progress;
pub mod zip_stream;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info};

use crate::config::PipelineConfig;
use crate::error::{IngestError, Result};
use crate::record::{RawRecord, RecordOrigin};

/// One item of a record stream
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// A record ready for flattening
    Record(RawRecord),
    /// A record that could not be read and was left out
    Skipped { origin: RecordOrigin, reason: String },
    /// A record was emitted, but degraded
    Warning { origin: RecordOrigin, message: String },
}

/// Lazily produced events; an `Err` item ends the run
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<SourceEvent>> + Send>>;

/// Something that can be opened as a record stream
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Issue the request and start reading
    async fn open(&self) -> Result<RecordStream>;

    /// Short human-readable description for logs
    fn describe(&self) -> String;
}

/// Layout of the remote archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveKind {
    /// Zip of many JSON documents, one record per entry
    JsonZip,
    /// Zip holding one CSV file; the first row is discarded and columns are
    /// named from `field_names`
    ZippedCsv { field_names: Vec<String> },
    /// Zip holding one GeoPackage; `None` reads the first feature layer
    GeoPackage { layer: Option<String> },
    /// Zip of headerless CSV files read as they stream in; rows whose record
    /// type is listed are kept
    CsvMembers { record_types: Vec<String> },
}

impl ArchiveKind {
    fn label(&self) -> &'static str {
        match self {
            ArchiveKind::JsonZip => "json-zip",
            ArchiveKind::ZippedCsv { .. } => "zipped-csv",
            ArchiveKind::GeoPackage { .. } => "geopackage",
            ArchiveKind::CsvMembers { .. } => "csv-members",
        }
    }
}

/// Settings shared by every reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Events buffered between the producer and the consumer
    pub channel_capacity: usize,
    pub show_progress: bool,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for ReaderOptions {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            channel_capacity: config.channel_capacity.max(1),
            show_progress: config.show_progress,
        }
    }
}

/// How the configured URL leads to the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlResolution {
    /// The URL serves the archive
    Direct,
    /// The URL redirects to the archive
    Redirect,
    /// The URL answers with JSON naming a presigned download link in `url`
    Presigned,
}

/// A remote archive served over HTTP(S)
#[derive(Debug, Clone)]
pub struct ArchiveSource {
    url: String,
    kind: ArchiveKind,
    resolution: UrlResolution,
    options: ReaderOptions,
}

impl ArchiveSource {
    pub fn new(url: impl Into<String>, kind: ArchiveKind) -> Self {
        Self {
            url: url.into(),
            kind,
            resolution: UrlResolution::Direct,
            options: ReaderOptions::default(),
        }
    }

    /// Resolve the URL's redirect target first and log it
    pub fn with_redirect(mut self) -> Self {
        self.resolution = UrlResolution::Redirect;
        self
    }

    /// Fetch a presigned download link from the URL first
    pub fn with_presigned_url(mut self) -> Self {
        self.resolution = UrlResolution::Presigned;
        self
    }

    pub fn with_options(mut self, options: ReaderOptions) -> Self {
        self.options = options;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn kind(&self) -> &ArchiveKind {
        &self.kind
    }

    pub fn resolution(&self) -> UrlResolution {
        self.resolution
    }
}

#[async_trait]
impl RecordSource for ArchiveSource {
    async fn open(&self) -> Result<RecordStream> {
        let client = http::client(&self.options)?;

        let url = match self.resolution {
            UrlResolution::Direct => self.url.clone(),
            UrlResolution::Redirect => http::resolve_redirect(&client, &self.url).await?,
            UrlResolution::Presigned => http::resolve_presigned(&client, &self.url).await?,
        };

        info!(url = %self.url, kind = self.kind.label(), "Opening archive");

        match &self.kind {
            ArchiveKind::JsonZip => {
                let response = http::fetch(&client, &url).await?;
                Ok(zip_stream::json_entries(
                    http::body_reader(response),
                    &self.options,
                ))
            },
            ArchiveKind::ZippedCsv { field_names } => {
                let scratch = http::download_to_scratch(&client, &url, &self.options).await?;
                Ok(csv::zipped_csv_rows(scratch, url, field_names.clone(), &self.options))
            },
            ArchiveKind::GeoPackage { layer } => {
                let scratch = http::download_to_scratch(&client, &url, &self.options).await?;
                Ok(gpkg::geopackage_features(scratch, url, layer.clone(), &self.options))
            },
            ArchiveKind::CsvMembers { record_types } => {
                let response = http::fetch(&client, &url).await?;
                Ok(zip_stream::csv_members(
                    http::body_reader(response),
                    self.url.clone(),
                    record_types.clone(),
                    &self.options,
                ))
            },
        }
    }

    fn describe(&self) -> String {
        format!("{} {}", self.kind.label(), self.url)
    }
}

// ============================================================================
// Blocking producer plumbing
// ============================================================================

/// Sending half handed to a blocking producer
pub(crate) struct EventSender {
    tx: mpsc::Sender<Result<SourceEvent>>,
}

impl EventSender {
    /// Blocks while the channel is full; `false` once the stream was dropped
    pub(crate) fn send(&self, event: SourceEvent) -> bool {
        self.tx.blocking_send(Ok(event)).is_ok()
    }
}

/// Run `produce` on the blocking pool and expose its events as a stream
///
/// An error returned by the producer, or a panic inside it, becomes the last
/// item of the stream.
pub(crate) fn spawn_producer<F>(capacity: usize, produce: F) -> RecordStream
where
    F: FnOnce(&EventSender) -> Result<()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let watcher_tx = tx.clone();

    let handle = tokio::task::spawn_blocking(move || {
        let events = EventSender { tx };
        if let Err(e) = produce(&events) {
            error!(error = %e, "Archive reader failed");
            if events.tx.blocking_send(Err(e)).is_err() {
                debug!("Stream dropped before the reader error could be delivered");
            }
        }
    });

    tokio::spawn(async move {
        if let Err(e) = handle.await {
            let _ = watcher_tx.send(Err(IngestError::from(e))).await;
        }
    });

    Box::pin(ReceiverStream::new(rx))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::record::RawPayload;
    use futures::StreamExt;

    fn record(i: u64) -> SourceEvent {
        SourceEvent::Record(RawRecord::new(
            RecordOrigin::new(i, format!("{}.json", i)),
            RawPayload::Document(b"{}".to_vec()),
        ))
    }

    #[tokio::test]
    async fn test_producer_events_arrive_in_order() {
        let stream = spawn_producer(2, |events| {
            for i in 0..5 {
                events.send(record(i));
            }
            Ok(())
        });

        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 5);
        assert!(matches!(&items[4], Ok(SourceEvent::Record(r)) if r.origin.index == 4));
    }

    #[tokio::test]
    async fn test_producer_error_is_last_item() {
        let mut stream = spawn_producer(4, |events| {
            events.send(record(0));
            Err(IngestError::Decode("truncated archive".into()))
        });

        assert!(matches!(stream.next().await, Some(Ok(_))));
        assert!(matches!(stream.next().await, Some(Err(IngestError::Decode(_)))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_producer_panic_becomes_error() {
        let mut stream = spawn_producer(1, |_| panic!("boom"));
        assert!(matches!(stream.next().await, Some(Err(IngestError::ReaderTask(_)))));
    }

    #[tokio::test]
    async fn test_dropping_stream_stops_producer() {
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let mut stream = spawn_producer(1, move |events| {
            let mut sent = 0u64;
            while events.send(record(sent)) {
                sent += 1;
            }
            done_tx.send(sent).unwrap();
            Ok(())
        });

        stream.next().await;
        drop(stream);

        let sent = tokio::task::spawn_blocking(move || done_rx.recv().unwrap())
            .await
            .unwrap();
        assert!(sent < 10);
    }

    #[test]
    fn test_archive_source_builder() {
        let source = ArchiveSource::new("https://example.com/a.zip", ArchiveKind::JsonZip)
            .with_redirect();
        assert_eq!(source.resolution(), UrlResolution::Redirect);
        assert_eq!(source.describe(), "json-zip https://example.com/a.zip");
        assert_eq!(source.kind(), &ArchiveKind::JsonZip);

        let source = ArchiveSource::new(
            "https://example.com/export/15.zip",
            ArchiveKind::CsvMembers { record_types: vec!["010".into()] },
        )
        .with_presigned_url();
        assert_eq!(source.resolution(), UrlResolution::Presigned);
        assert_eq!(source.describe(), "csv-members https://example.com/export/15.zip");
    }
}
