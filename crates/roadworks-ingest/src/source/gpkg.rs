//! GeoPackage feature reader
//!
//! A GeoPackage is an SQLite database. Features of one layer are read row by
//! row; geometry blobs are converted to WKT and every other column becomes a
//! property. A geometry that cannot be converted is emitted as null with a
//! warning rather than dropping the feature.

use std::path::Path;

use geozero::wkb::GpkgWkb;
use geozero::ToWkt;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info, warn};

use super::http::Scratch;
use super::progress::count_bar;
use super::{spawn_producer, EventSender, ReaderOptions, RecordStream, SourceEvent};
use crate::error::{IngestError, Result};
use crate::record::{RawPayload, RawRecord, RecordOrigin, Scalar};
use crate::warehouse::quote_identifier;

/// Stream the features of a GeoPackage inside a downloaded archive
pub fn geopackage_features(
    scratch: Scratch,
    url: String,
    layer: Option<String>,
    options: &ReaderOptions,
) -> RecordStream {
    let show_progress = options.show_progress;

    spawn_producer(options.channel_capacity, move |events| {
        let gpkg_path = scratch.extract_first(".gpkg", &url)?;
        let result = read_features(&gpkg_path, layer.as_deref(), events, show_progress);
        drop(scratch);
        result
    })
}

/// Layer metadata logged before reading
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerInfo {
    pub name: String,
    pub geometry_column: String,
    /// e.g. `EPSG:27700`
    pub crs: String,
    /// Property columns and their declared types, feature id excluded
    pub properties: Vec<(String, String)>,
    pub feature_count: u64,
}

/// Read the layout of a feature layer; `None` picks the first one
pub fn describe_layer(conn: &Connection, layer: Option<&str>) -> Result<LayerInfo> {
    let name: String = match layer {
        Some(requested) => conn
            .query_row(
                "SELECT table_name FROM gpkg_contents WHERE table_name = ?1 AND data_type = 'features'",
                params![requested],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| {
                IngestError::Decode(format!("GeoPackage has no feature layer '{}'", requested))
            })?,
        None => conn
            .query_row(
                "SELECT table_name FROM gpkg_contents WHERE data_type = 'features' ORDER BY table_name LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| IngestError::Decode("GeoPackage has no feature layers".to_string()))?,
    };

    let (geometry_column, srs_id): (String, i64) = conn.query_row(
        "SELECT column_name, srs_id FROM gpkg_geometry_columns WHERE table_name = ?1",
        params![name],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let crs = conn
        .query_row(
            "SELECT organization, organization_coordsys_id FROM gpkg_spatial_ref_sys WHERE srs_id = ?1",
            params![srs_id],
            |row| {
                let organization: String = row.get(0)?;
                let code: i64 = row.get(1)?;
                Ok(format!("{}:{}", organization.to_uppercase(), code))
            },
        )
        .optional()?
        .unwrap_or_else(|| format!("SRS:{}", srs_id));

    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_identifier(&name)))?;
    let properties = stmt
        .query_map([], |row| {
            let column: String = row.get(1)?;
            let declared: String = row.get(2)?;
            let pk: i64 = row.get(5)?;
            Ok((column, declared, pk))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|(column, _, pk)| *pk == 0 && *column != geometry_column)
        .map(|(column, declared, _)| (column, declared))
        .collect();

    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote_identifier(&name)),
        [],
        |row| row.get(0),
    )?;

    Ok(LayerInfo {
        name,
        geometry_column,
        crs,
        properties,
        feature_count: u64::try_from(count).unwrap_or_default(),
    })
}

/// Convert a GeoPackage geometry blob to WKT
pub fn geometry_to_wkt(blob: &[u8]) -> Result<String> {
    Ok(GpkgWkb(blob.to_vec()).to_wkt()?)
}

fn property_value(value: ValueRef<'_>) -> Scalar {
    match value {
        ValueRef::Null => Scalar::Null,
        ValueRef::Integer(i) => Scalar::Integer(i),
        ValueRef::Real(f) => Scalar::Text(f.to_string()),
        ValueRef::Text(t) => Scalar::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Scalar::Text(hex::encode(b)),
    }
}

pub(crate) fn read_features(
    path: &Path,
    layer: Option<&str>,
    events: &EventSender,
    show_progress: bool,
) -> Result<()> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let info = describe_layer(&conn, layer)?;

    info!(layer = %info.name, crs = %info.crs, "The CRS is: {}", info.crs);
    info!(layer = %info.name, schema = ?info.properties, "The schema is: {:?}", info.properties);
    info!(layer = %info.name, features = info.feature_count, "Total features to process");

    let mut columns = vec![quote_identifier(&info.geometry_column)];
    columns.extend(info.properties.iter().map(|(c, _)| quote_identifier(c)));
    let sql = format!(
        "SELECT {} FROM {}",
        columns.join(", "),
        quote_identifier(&info.name)
    );

    let pb = count_bar(
        Some(info.feature_count),
        format!("Processing features of {}", info.name),
        show_progress,
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let mut index = 0u64;
    let mut failed = 0u64;

    while let Some(row) = rows.next()? {
        let origin = RecordOrigin::new(index, format!("{}:{}", info.name, index));
        index += 1;

        let geometry = match row.get_ref(0)? {
            ValueRef::Blob(blob) => match geometry_to_wkt(blob) {
                Ok(wkt) => Some(wkt),
                Err(e) => {
                    failed += 1;
                    let message = format!("Error converting geometry for feature {}: {}", origin.index, e);
                    warn!(feature = %origin, error = %e, "Geometry conversion failed, emitting null geometry");
                    if !events.send(SourceEvent::Warning {
                        origin: origin.clone(),
                        message,
                    }) {
                        return Ok(());
                    }
                    None
                },
            },
            _ => None,
        };

        let mut properties = Vec::with_capacity(info.properties.len());
        for (i, (name, _)) in info.properties.iter().enumerate() {
            properties.push((name.clone(), property_value(row.get_ref(i + 1)?)));
        }

        let record = RawRecord::new(origin, RawPayload::Feature { geometry, properties });
        if !events.send(SourceEvent::Record(record)) {
            debug!(features = index, "Record stream dropped, stopping GeoPackage reader");
            return Ok(());
        }
        pb.inc(1);
    }

    pb.finish_and_clear();
    info!(layer = %info.name, features = index, geometry_errors = failed, "Finished reading GeoPackage");
    Ok(())
}
