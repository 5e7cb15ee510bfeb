//! End-to-end tests for feed ingestion
//!
//! These tests serve archives from a mock server and load them into an
//! in-memory DuckDB warehouse:
//! - Street Manager permit archives (JSON zip), including schema drift
//! - Linked identifiers (zipped CSV behind a redirect)
//! - Open USRN (zipped GeoPackage behind a redirect)
//! - Scottish Road Works Register (CSV members behind a presigned link)
//! - Commit retries and batch counts

use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use proptest::prelude::*;
use roadworks_ingest::batch::ColumnarBatch;
use roadworks_ingest::config::WarehouseConfig;
use roadworks_ingest::record::{RawPayload, RawRecord, RecordOrigin};
use roadworks_ingest::source::{RecordSource, RecordStream, SourceEvent};
use roadworks_ingest::warehouse::{DestinationTable, TableDefinition};
use roadworks_ingest::{
    DuckDbWarehouse, FeedCatalog, FeedDefinition, IngestError, IngestPipeline, PipelineConfig,
    Warehouse,
};
use serde_json::json;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};
use zip::write::SimpleFileOptions;

// ============================================================================
// Fixtures
// ============================================================================

fn config(batch_size: usize) -> PipelineConfig {
    PipelineConfig::builder()
        .batch_size(batch_size)
        .sample_size(3)
        .show_progress(false)
        .build()
}

fn warehouse() -> DuckDbWarehouse {
    DuckDbWarehouse::connect(&WarehouseConfig::in_memory()).unwrap()
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
}

fn zip_archive(entries: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let opts = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (name, body) in entries {
        writer.start_file(*name, opts).unwrap();
        writer.write_all(body).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// One permit event as published in the monthly archives
fn permit_event(i: i64) -> serde_json::Value {
    json!({
        "event_reference": 900_000 + i,
        "event_type": "WORK_START",
        "event_time": "2025-02-03T10:00:00.000Z",
        "object_type": "PERMIT",
        "object_reference": format!("TSR1-{}-01", i),
        "version": 1,
        "object_data": {
            "work_reference_number": format!("TSR1-{}", i),
            "permit_reference_number": format!("TSR1-{}-01", i),
            "promoter_swa_code": "7374",
            "promoter_organisation": "Northern Gas Networks",
            "highway_authority": "CITY OF YORK COUNCIL",
            "highway_authority_swa_code": "2741",
            "works_location_coordinates": "POINT(460000 452000)",
            "town": "YORK",
            "usrn": "45201234",
            "is_traffic_sensitive": "No"
        }
    })
}

fn permit_archive(events: &[serde_json::Value]) -> Vec<u8> {
    let entries: Vec<(String, Vec<u8>)> = events
        .iter()
        .enumerate()
        .map(|(i, e)| (format!("2025/02/event_{}.json", i), serde_json::to_vec(e).unwrap()))
        .collect();
    let borrowed: Vec<(&str, Vec<u8>)> = entries.iter().map(|(n, b)| (n.as_str(), b.clone())).collect();
    zip_archive(&borrowed)
}

async fn serve(server: &MockServer, at: &str, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(at))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

async fn redirect(server: &MockServer, from: &str, to: &str) {
    Mock::given(method("GET"))
        .and(path(from))
        .respond_with(
            ResponseTemplate::new(302).insert_header("location", format!("{}{}", server.uri(), to)),
        )
        .mount(server)
        .await;
}

/// GeoPackage point blob: header with no envelope, then little-endian WKB
fn gpkg_point(x: f64, y: f64) -> Vec<u8> {
    let mut blob = vec![b'G', b'P', 0, 0b0000_0001];
    blob.extend_from_slice(&27700i32.to_le_bytes());
    blob.push(1);
    blob.extend_from_slice(&1u32.to_le_bytes());
    blob.extend_from_slice(&x.to_le_bytes());
    blob.extend_from_slice(&y.to_le_bytes());
    blob
}

fn geopackage_bytes(features: &[(Option<Vec<u8>>, &str, i64)]) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("osopenusrn.gpkg");
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE gpkg_spatial_ref_sys (srs_name TEXT, srs_id INTEGER PRIMARY KEY, organization TEXT, organization_coordsys_id INTEGER, definition TEXT, description TEXT);
         INSERT INTO gpkg_spatial_ref_sys VALUES ('OSGB36 / British National Grid', 27700, 'EPSG', 27700, '', NULL);
         CREATE TABLE gpkg_contents (table_name TEXT PRIMARY KEY, data_type TEXT, identifier TEXT, srs_id INTEGER);
         INSERT INTO gpkg_contents VALUES ('openusrn', 'features', 'openusrn', 27700);
         CREATE TABLE gpkg_geometry_columns (table_name TEXT, column_name TEXT, geometry_type_name TEXT, srs_id INTEGER, z INTEGER, m INTEGER);
         INSERT INTO gpkg_geometry_columns VALUES ('openusrn', 'geometry', 'POINT', 27700, 0, 0);
         CREATE TABLE openusrn (fid INTEGER PRIMARY KEY AUTOINCREMENT, geometry BLOB, street_type TEXT, usrn INTEGER);",
    )
    .unwrap();
    for (geometry, street_type, usrn) in features {
        conn.execute(
            "INSERT INTO openusrn (geometry, street_type, usrn) VALUES (?1, ?2, ?3)",
            rusqlite::params![geometry, street_type, usrn],
        )
        .unwrap();
    }
    drop(conn);
    std::fs::read(&path).unwrap()
}

/// Documents held in memory, served fresh on every open
struct MemorySource {
    documents: Vec<Vec<u8>>,
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn open(&self) -> roadworks_ingest::Result<RecordStream> {
        let events: Vec<roadworks_ingest::Result<SourceEvent>> = self
            .documents
            .iter()
            .enumerate()
            .map(|(i, doc)| {
                Ok(SourceEvent::Record(RawRecord::new(
                    RecordOrigin::new(i as u64, format!("{}.json", i)),
                    RawPayload::Document(doc.clone()),
                )))
            })
            .collect();
        Ok(Box::pin(futures::stream::iter(events)))
    }

    fn describe(&self) -> String {
        format!("{} in-memory documents", self.documents.len())
    }
}

fn memory_feed(rows: usize) -> FeedDefinition {
    let documents = (0..rows)
        .map(|i| serde_json::to_vec(&json!({"event_reference": i, "object_data": {"town": "YORK"}})).unwrap())
        .collect();
    FeedDefinition::new(
        "memory",
        Box::new(MemorySource { documents }),
        DestinationTable::new("raw_data_2025", "memory"),
        TableDefinition::varchar(["event_reference", "town"]),
    )
}

// ============================================================================
// Street Manager permits
// ============================================================================

#[tokio::test]
async fn test_permits_latest_loads_previous_month() {
    let server = MockServer::start().await;
    let events: Vec<_> = (0..5).map(permit_event).collect();
    serve(&server, "/permit/2025/02.zip", permit_archive(&events)).await;

    let catalog = FeedCatalog::new(&config(2), today()).with_permit_base_url(format!("{}/permit", server.uri()));
    let feed = catalog.permits_latest();
    let mut pipeline = IngestPipeline::new(warehouse(), config(2));

    let report = pipeline.run(&feed).await.unwrap();

    assert_eq!(report.records_read, 5);
    assert_eq!(report.rows_committed, 5);
    assert_eq!(report.batches_committed, 3);
    assert!(report.errors.is_empty());

    let wh = pipeline.into_warehouse();
    let table = DestinationTable::new("raw_data_2025", "02_2025");
    assert_eq!(wh.row_count(&table).unwrap(), 5);

    let (max_ref, town, usrn): (i64, String, String) = wh
        .connection()
        .query_row(
            r#"SELECT MAX(event_reference), ANY_VALUE(town), ANY_VALUE(usrn) FROM "raw_data_2025"."02_2025""#,
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .unwrap();
    assert_eq!(max_ref, 900_004);
    assert_eq!(town, "YORK");
    assert_eq!(usrn, "45201234");

    let empty_columns: i64 = wh
        .connection()
        .query_row(
            r#"SELECT COUNT(*) FROM "raw_data_2025"."02_2025" WHERE work_category IS NULL"#,
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(empty_columns, 5);
}

#[tokio::test]
async fn test_permit_schema_drift_loads_nothing() {
    let server = MockServer::start().await;
    let events: Vec<_> = (0..4)
        .map(|i| {
            let mut event = permit_event(i);
            event.as_object_mut().unwrap().remove("version");
            event
        })
        .collect();
    serve(&server, "/permit/2025/02.zip", permit_archive(&events)).await;

    let catalog = FeedCatalog::new(&config(2), today()).with_permit_base_url(format!("{}/permit", server.uri()));
    let mut pipeline = IngestPipeline::new(warehouse(), config(2));

    let err = pipeline.run(&catalog.permits_latest()).await.unwrap_err();

    match err {
        IngestError::SchemaDrift(report) => {
            assert_eq!(report.rows_checked, 3);
            assert_eq!(report.len(), 3);
            assert!(report.to_string().contains("missing field 'version'"));
        },
        other => panic!("unexpected error {:?}", other),
    }

    let table = DestinationTable::new("raw_data_2025", "02_2025");
    assert_eq!(pipeline.warehouse().row_count(&table).unwrap(), 0);
}

#[tokio::test]
async fn test_corrupt_permit_entry_is_left_out() {
    let server = MockServer::start().await;
    let events: Vec<_> = (0..5).map(permit_event).collect();
    let mut archive = permit_archive(&events);
    let third = archive
        .windows(4)
        .enumerate()
        .filter(|(_, w)| *w == [0x50, 0x4b, 0x03, 0x04])
        .nth(2)
        .map(|(i, _)| i)
        .unwrap();
    // Local header CRC of the third event
    archive[third + 14] ^= 0xff;
    serve(&server, "/permit/2025/02.zip", archive).await;

    let catalog = FeedCatalog::new(&config(2), today()).with_permit_base_url(format!("{}/permit", server.uri()));
    let mut pipeline = IngestPipeline::new(warehouse(), config(2));

    let report = pipeline.run(&catalog.permits_latest()).await.unwrap();

    assert_eq!(report.records_read, 5);
    assert_eq!(report.rows_committed, 4);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("2025/02/event_2.json"));
    assert!(report.errors[0].contains("Invalid checksum"));

    let table = DestinationTable::new("raw_data_2025", "02_2025");
    assert_eq!(pipeline.warehouse().row_count(&table).unwrap(), 4);
}

#[tokio::test]
async fn test_missing_archive_fails_with_status() {
    let (logs, _guard) = capture_logs();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let catalog = FeedCatalog::new(&config(2), today()).with_permit_base_url(format!("{}/permit", server.uri()));
    let mut pipeline = IngestPipeline::new(warehouse(), config(2));

    let err = pipeline.run(&catalog.permits_latest()).await.unwrap_err();

    assert!(matches!(err, IngestError::HttpStatus { status: 404, .. }));
    assert!(logs.text().contains("Feed failed, 0 rows committed before failure"));
}

// ============================================================================
// OS Open Linked Identifiers
// ============================================================================

#[tokio::test]
async fn test_linked_ids_csv_behind_redirect() {
    let server = MockServer::start().await;
    let csv = "CORRELATION_ID,IDENTIFIER_1,VERSION_NUMBER_1,VERSION_DATE_1,IDENTIFIER_2,VERSION_NUMBER_2,VERSION_DATE_2,CONFIDENCE\n\
               c-1,100,1,20240101,45201234,2,20240102,7 - Matched\n\
               c-2,101,1,20240101,45201234,2,20240102,7 - Matched\n\
               c-3,102,1,20240101,45201235,2,20240102,7 - Matched\n\
               c-4,103,1,20240101,45201235,2,20240102,7 - Matched\n\
               c-5,104,1,,45201236,2,20240102,7 - Matched\n\
               c-6,105\n";
    redirect(&server, "/products/LIDS/downloads", "/files/lids.zip").await;
    serve(&server, "/files/lids.zip", zip_archive(&[("lids_usrn.csv", csv.as_bytes().to_vec())])).await;

    let catalog = FeedCatalog::new(&config(10), today()).with_os_base_url(server.uri());
    let feed = catalog.linked_ids();
    let mut pipeline = IngestPipeline::new(warehouse(), config(10));

    let report = pipeline.run(&feed).await.unwrap();

    assert_eq!(report.records_read, 6);
    assert_eq!(report.rows_committed, 5);
    assert_eq!(report.batches_committed, 1);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("lids_usrn.csv:7"));

    let wh = pipeline.into_warehouse();
    let (sum, null_dates): (i64, i64) = wh
        .connection()
        .query_row(
            r#"SELECT SUM(identifier_1)::BIGINT, COUNT(*) FILTER (WHERE version_date_1 IS NULL)
               FROM "os_open_linked_identifiers"."os_open_linked_identifiers_uprn_usrn_latest""#,
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(sum, 100 + 101 + 102 + 103 + 104);
    assert_eq!(null_dates, 1);
}

// ============================================================================
// OS Open USRN
// ============================================================================

#[tokio::test]
async fn test_open_usrns_geopackage_behind_redirect() {
    let server = MockServer::start().await;
    let gpkg = geopackage_bytes(&[
        (Some(gpkg_point(437_000.5, 115_500.0)), "Designated Street Name", 45201234),
        (None, "Officially Described Street", 45201235),
        (Some(vec![1, 2, 3]), "Unofficial Street Name", 45201236),
    ]);
    redirect(&server, "/products/OpenUSRN/downloads", "/files/osopenusrn.zip").await;
    serve(&server, "/files/osopenusrn.zip", zip_archive(&[("osopenusrn_202502.gpkg", gpkg)])).await;

    let catalog = FeedCatalog::new(&config(2), today()).with_os_base_url(server.uri());
    let mut pipeline = IngestPipeline::new(warehouse(), config(2));

    let report = pipeline.run(&catalog.open_usrns()).await.unwrap();

    assert_eq!(report.records_read, 3);
    assert_eq!(report.rows_committed, 3);
    assert_eq!(report.batches_committed, 2);
    assert_eq!(report.errors.len(), 1);

    let wh = pipeline.into_warehouse();
    let geometry: String = wh
        .connection()
        .query_row(
            r#"SELECT geometry FROM "open_usrns_latest"."os_open_usrns" WHERE usrn = 45201234"#,
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert!(geometry.starts_with("POINT"));

    let null_geometries: i64 = wh
        .connection()
        .query_row(
            r#"SELECT COUNT(*) FROM "open_usrns_latest"."os_open_usrns" WHERE geometry IS NULL"#,
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(null_geometries, 2);
}

// ============================================================================
// Scottish Road Works Register
// ============================================================================

async fn presigned(server: &MockServer, export: &str, signed: &str) {
    Mock::given(method("GET"))
        .and(path(export))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "url": format!("{}{}?X-Amz-Signature=abc", server.uri(), signed) })),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_scottish_permits_behind_presigned_link() {
    let server = MockServer::start().await;
    let csv = "S1,000,SRWR export,20250315\n\
               S1,010,WK-1,Perth and Kinross,\"High St, Perth\"\n\
               S1,010,WK-2,Fife,Cupar Rd\n\
               S1,055,not loaded\n\
               S1,099,3\n";
    presigned(&server, "/export/api/v1/file/15.zip", "/signed/15.zip").await;
    serve(
        &server,
        "/signed/15.zip",
        zip_archive(&[("readme.txt", b"notes".to_vec()), ("srwr_15.csv", csv.as_bytes().to_vec())]),
    )
    .await;

    let catalog = FeedCatalog::new(&config(3), today()).with_srwr_base_url(server.uri());
    let feed = catalog.scottish_permits("15").unwrap();
    let mut pipeline = IngestPipeline::new(warehouse(), config(3));

    let report = pipeline.run(&feed).await.unwrap();

    assert_eq!(report.records_read, 4);
    assert_eq!(report.rows_committed, 4);
    assert_eq!(report.batches_committed, 2);
    assert!(report.errors.is_empty());

    let wh = pipeline.into_warehouse();
    let (works, source_file): (i64, String) = wh
        .connection()
        .query_row(
            r#"SELECT COUNT(*) FILTER (WHERE table_id = '010'), ANY_VALUE(source_file)
               FROM "raw_data_scotland"."srwr_15""#,
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(works, 2);
    assert_eq!(source_file, "srwr_15.csv");

    let first_works: String = wh
        .connection()
        .query_row(
            r#"SELECT column_values FROM "raw_data_scotland"."srwr_15" WHERE column_values LIKE '%WK-1%'"#,
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(first_works, r#"["S1","010","WK-1","Perth and Kinross","High St, Perth"]"#);
}

#[tokio::test]
async fn test_scottish_export_without_csv_fails() {
    let server = MockServer::start().await;
    presigned(&server, "/export/api/v1/file/2023.zip", "/signed/2023.zip").await;
    serve(&server, "/signed/2023.zip", zip_archive(&[("readme.txt", b"notes".to_vec())])).await;

    let catalog = FeedCatalog::new(&config(3), today()).with_srwr_base_url(server.uri());
    let mut pipeline = IngestPipeline::new(warehouse(), config(3));

    let err = pipeline
        .run(&catalog.scottish_permits("2023").unwrap())
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::MissingArchiveMember { ref extension, .. } if extension == ".csv"));
}

// ============================================================================
// Commit retries and batching
// ============================================================================

/// DuckDB warehouse whose first `failures` inserts fail
struct FlakyWarehouse {
    inner: DuckDbWarehouse,
    failures: u32,
}

#[async_trait]
impl Warehouse for FlakyWarehouse {
    async fn ensure_schema(&mut self, schema: &str) -> roadworks_ingest::Result<()> {
        self.inner.ensure_schema(schema).await
    }

    async fn create_or_replace_table(
        &mut self,
        table: &DestinationTable,
        definition: &TableDefinition,
    ) -> roadworks_ingest::Result<()> {
        self.inner.create_or_replace_table(table, definition).await
    }

    async fn insert_batch(
        &mut self,
        table: &DestinationTable,
        batch: &ColumnarBatch,
    ) -> roadworks_ingest::Result<u64> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(IngestError::Destination("connection reset by peer".into()));
        }
        self.inner.insert_batch(table, batch).await
    }
}

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl CapturedLogs {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

/// Capture this thread's log output until the guard drops
fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();
    (logs, tracing::subscriber::set_default(subscriber))
}

#[tokio::test(start_paused = true)]
async fn test_commit_retry_succeeds_on_third_attempt() {
    let (logs, _guard) = capture_logs();

    let flaky = FlakyWarehouse {
        inner: warehouse(),
        failures: 2,
    };
    let feed = memory_feed(4);
    let mut pipeline = IngestPipeline::new(flaky, config(10));
    let start = tokio::time::Instant::now();

    let report = pipeline.run(&feed).await.unwrap();

    assert_eq!(report.rows_committed, 4);
    assert_eq!(report.retried_commits, 1);
    assert_eq!(start.elapsed(), std::time::Duration::from_secs(9));
    assert!(logs.text().contains("Batch commit succeeded on attempt 3"));
    assert_eq!(pipeline.into_warehouse().inner.row_count(&feed.table).unwrap(), 4);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_commit_count_is_rows_over_batch_size_rounded_up(rows in 0usize..40, batch_size in 1usize..12) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let feed = memory_feed(rows);
        let mut pipeline = IngestPipeline::new(warehouse(), config(batch_size));

        let report = runtime.block_on(pipeline.run(&feed)).unwrap();

        prop_assert_eq!(report.batches_committed as usize, rows.div_ceil(batch_size));
        prop_assert_eq!(report.rows_committed as usize, rows);
        prop_assert_eq!(pipeline.warehouse().row_count(&feed.table).unwrap() as usize, rows);
    }
}
