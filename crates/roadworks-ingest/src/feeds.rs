//! Feed catalog
//!
//! Each public data product the pipeline loads is described by a
//! [`FeedDefinition`]: where its archive lives, how to read it, which table it
//! lands in and, for feeds with a published data model, the contract a sample
//! must satisfy before loading starts.
//!
//! | Feed | Archive | Destination |
//! |------|---------|-------------|
//! | Street Manager permits | JSON zip | `raw_data_<YYYY>.<MM>_<YYYY>` |
//! | OS Open Linked Identifiers | zipped CSV | `os_open_linked_identifiers.os_open_linked_identifiers_uprn_usrn_latest` |
//! | OS Open USRN | GeoPackage | `open_usrns_latest.os_open_usrns` |
//! | OS Open Roads | GeoPackage (`road_link`) | `os_open_roads.open_roads_latest` |
//! | Scottish Road Works Register | CSV members, presigned link | `raw_data_scotland.srwr_<id>` |

use std::fmt;

use chrono::{Datelike, NaiveDate};
use tracing::info;

use crate::config::PipelineConfig;
use crate::error::{IngestError, Result};
use crate::schema::{FieldType, Optionality, SchemaContract};
use crate::source::zip_stream::CSV_MEMBER_COLUMNS;
use crate::source::{ArchiveKind, ArchiveSource, ReaderOptions, RecordSource};
use crate::warehouse::{ColumnType, DestinationTable, TableDefinition};

/// Street Manager open data permit archives
pub const PERMIT_BASE_URL: &str = "https://opendata.manage-roadworks.service.gov.uk/permit";

/// OS Data Hub downloads API
pub const OS_DOWNLOADS_BASE_URL: &str = "https://api.os.uk/downloads/v1";

/// Scottish Road Works Register exports
pub const SRWR_BASE_URL: &str = "https://downloads.srwr.scot";

/// Register record types kept from an export
pub const SRWR_RECORD_TYPES: &[&str] = &[
    "000", "001", "002", "003", "004", "006", "007", "008", "009", "010", "036", "041", "098", "099",
];

/// Column layout of a monthly permit table
pub const PERMIT_COLUMNS: &[(&str, ColumnType)] = &[
    ("version", ColumnType::BigInt),
    ("event_reference", ColumnType::BigInt),
    ("event_type", ColumnType::Varchar),
    ("event_time", ColumnType::Varchar),
    ("object_type", ColumnType::Varchar),
    ("object_reference", ColumnType::Varchar),
    ("work_reference_number", ColumnType::Varchar),
    ("work_category", ColumnType::Varchar),
    ("work_category_ref", ColumnType::Varchar),
    ("work_status", ColumnType::Varchar),
    ("work_status_ref", ColumnType::Varchar),
    ("activity_type", ColumnType::Varchar),
    ("permit_reference_number", ColumnType::Varchar),
    ("permit_status", ColumnType::Varchar),
    ("permit_conditions", ColumnType::Varchar),
    ("collaborative_working", ColumnType::Varchar),
    ("collaboration_type", ColumnType::Varchar),
    ("collaboration_type_ref", ColumnType::Varchar),
    ("promoter_swa_code", ColumnType::Varchar),
    ("promoter_organisation", ColumnType::Varchar),
    ("highway_authority", ColumnType::Varchar),
    ("highway_authority_swa_code", ColumnType::Varchar),
    ("works_location_coordinates", ColumnType::Varchar),
    ("works_location_type", ColumnType::Varchar),
    ("town", ColumnType::Varchar),
    ("street_name", ColumnType::Varchar),
    ("usrn", ColumnType::Varchar),
    ("road_category", ColumnType::Varchar),
    ("area_name", ColumnType::Varchar),
    ("traffic_management_type", ColumnType::Varchar),
    ("traffic_management_type_ref", ColumnType::Varchar),
    ("current_traffic_management_type", ColumnType::Varchar),
    ("current_traffic_management_type_ref", ColumnType::Varchar),
    ("current_traffic_management_update_date", ColumnType::Varchar),
    ("proposed_start_date", ColumnType::Varchar),
    ("proposed_start_time", ColumnType::Varchar),
    ("proposed_end_date", ColumnType::Varchar),
    ("proposed_end_time", ColumnType::Varchar),
    ("actual_start_date_time", ColumnType::Varchar),
    ("actual_end_date_time", ColumnType::Varchar),
    ("is_ttro_required", ColumnType::Varchar),
    ("is_covid_19_response", ColumnType::Varchar),
    ("is_traffic_sensitive", ColumnType::Varchar),
    ("is_deemed", ColumnType::Varchar),
    ("close_footway", ColumnType::Varchar),
    ("close_footway_ref", ColumnType::Varchar),
];

/// Column layout of the UPRN to USRN linked identifiers CSV, in file order
pub const LINKED_ID_COLUMNS: &[(&str, ColumnType)] = &[
    ("CORRELATION_ID", ColumnType::Varchar),
    ("IDENTIFIER_1", ColumnType::BigInt),
    ("VERSION_NUMBER_1", ColumnType::Varchar),
    ("VERSION_DATE_1", ColumnType::BigInt),
    ("IDENTIFIER_2", ColumnType::BigInt),
    ("VERSION_NUMBER_2", ColumnType::Varchar),
    ("VERSION_DATE_2", ColumnType::BigInt),
    ("CONFIDENCE", ColumnType::Varchar),
];

pub const OPEN_USRN_COLUMNS: &[(&str, ColumnType)] = &[
    ("geometry", ColumnType::Varchar),
    ("street_type", ColumnType::Varchar),
    ("usrn", ColumnType::BigInt),
];

pub const OPEN_ROADS_COLUMNS: &[&str] = &[
    "id",
    "fictitious",
    "road_classification",
    "road_function",
    "form_of_way",
    "road_classification_number",
    "name_1",
    "name_1_lang",
    "name_2",
    "name_2_lang",
    "road_structure",
    "length",
    "length_uom",
    "loop",
    "primary_route",
    "trunk_road",
    "start_node",
    "end_node",
    "road_number_toid",
    "road_name_toid",
    "geometry",
];

/// One loadable feed
pub struct FeedDefinition {
    pub name: String,
    pub source: Box<dyn RecordSource>,
    pub table: DestinationTable,
    pub definition: TableDefinition,
    /// Checked against a sample before loading when present
    pub contract: Option<SchemaContract>,
}

impl FeedDefinition {
    pub fn new(
        name: impl Into<String>,
        source: Box<dyn RecordSource>,
        table: DestinationTable,
        definition: TableDefinition,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            table,
            definition,
            contract: None,
        }
    }

    pub fn with_contract(mut self, contract: SchemaContract) -> Self {
        self.contract = Some(contract);
        self
    }
}

impl fmt::Debug for FeedDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedDefinition")
            .field("name", &self.name)
            .field("source", &self.source.describe())
            .field("table", &self.table)
            .field("columns", &self.definition.columns().len())
            .field("contract", &self.contract.as_ref().map(SchemaContract::len))
            .finish()
    }
}

/// Builds feed definitions for a given run date
///
/// Base URLs can be pointed elsewhere, which is how the integration tests
/// serve archives from a local mock server.
#[derive(Debug, Clone)]
pub struct FeedCatalog {
    today: NaiveDate,
    permit_base_url: String,
    os_base_url: String,
    srwr_base_url: String,
    options: ReaderOptions,
}

impl FeedCatalog {
    pub fn new(config: &PipelineConfig, today: NaiveDate) -> Self {
        Self {
            today,
            permit_base_url: PERMIT_BASE_URL.to_string(),
            os_base_url: OS_DOWNLOADS_BASE_URL.to_string(),
            srwr_base_url: SRWR_BASE_URL.to_string(),
            options: ReaderOptions::from(config),
        }
    }

    pub fn with_permit_base_url(mut self, url: impl Into<String>) -> Self {
        self.permit_base_url = trim_slash(url.into());
        self
    }

    pub fn with_os_base_url(mut self, url: impl Into<String>) -> Self {
        self.os_base_url = trim_slash(url.into());
        self
    }

    pub fn with_srwr_base_url(mut self, url: impl Into<String>) -> Self {
        self.srwr_base_url = trim_slash(url.into());
        self
    }

    pub fn today(&self) -> NaiveDate {
        self.today
    }

    /// Permits for the calendar month before the run date
    pub fn permits_latest(&self) -> FeedDefinition {
        let (year, month) = previous_month(self.today);
        self.permits_for(year, month)
    }

    /// Permits for months `start_month..end_month` of `year`
    ///
    /// `end_month` is exclusive and may be 13 to include December.
    pub fn permits_historic(
        &self,
        year: i32,
        start_month: u32,
        end_month: u32,
    ) -> Result<Vec<FeedDefinition>> {
        if !(1..=12).contains(&start_month) || !(2..=13).contains(&end_month) || start_month >= end_month {
            return Err(IngestError::Config(format!(
                "Invalid month range {}..{}: expected 1 <= start < end <= 13",
                start_month, end_month
            )));
        }

        let feeds: Vec<FeedDefinition> = (start_month..end_month)
            .map(|month| self.permits_for(year, month))
            .collect();

        info!(year, start_month, end_month, feeds = feeds.len(), "Download links generated");
        Ok(feeds)
    }

    fn permits_for(&self, year: i32, month: u32) -> FeedDefinition {
        let url = permit_url(&self.permit_base_url, year, month);
        let source = ArchiveSource::new(url, ArchiveKind::JsonZip).with_options(self.options.clone());

        FeedDefinition::new(
            format!("permits-{}-{:02}", year, month),
            Box::new(source),
            DestinationTable::new(format!("raw_data_{}", year), permit_table_name(year, month)),
            definition(PERMIT_COLUMNS),
        )
        .with_contract(permit_contract())
    }

    /// UPRN to USRN linked identifiers, release named after the run month
    pub fn linked_ids(&self) -> FeedDefinition {
        let url = format!(
            "{}/products/LIDS/downloads?area=GB&format=CSV&fileName=lids-{}-{:02}_csv_BLPU-UPRN-Street-USRN-11.zip&redirect",
            self.os_base_url,
            self.today.year(),
            self.today.month()
        );
        let field_names = LINKED_ID_COLUMNS.iter().map(|(n, _)| n.to_string()).collect();
        let source = ArchiveSource::new(url, ArchiveKind::ZippedCsv { field_names })
            .with_redirect()
            .with_options(self.options.clone());

        FeedDefinition::new(
            "linked-ids",
            Box::new(source),
            DestinationTable::new(
                "os_open_linked_identifiers",
                "os_open_linked_identifiers_uprn_usrn_latest",
            ),
            definition(LINKED_ID_COLUMNS),
        )
    }

    /// Latest OS Open USRN release, first feature layer
    pub fn open_usrns(&self) -> FeedDefinition {
        let url = format!(
            "{}/products/OpenUSRN/downloads?area=GB&format=GeoPackage&redirect",
            self.os_base_url
        );
        let source = ArchiveSource::new(url, ArchiveKind::GeoPackage { layer: None })
            .with_redirect()
            .with_options(self.options.clone());

        FeedDefinition::new(
            "open-usrns",
            Box::new(source),
            DestinationTable::new("open_usrns_latest", "os_open_usrns"),
            definition(OPEN_USRN_COLUMNS),
        )
    }

    /// Latest OS Open Roads release, `road_link` layer
    pub fn open_roads(&self) -> FeedDefinition {
        let url = format!(
            "{}/products/OpenRoads/downloads?area=GB&format=GeoPackage&redirect",
            self.os_base_url
        );
        let source = ArchiveSource::new(
            url,
            ArchiveKind::GeoPackage {
                layer: Some("road_link".to_string()),
            },
        )
        .with_redirect()
        .with_options(self.options.clone());

        FeedDefinition::new(
            "open-roads",
            Box::new(source),
            DestinationTable::new("os_open_roads", "open_roads_latest"),
            TableDefinition::varchar(OPEN_ROADS_COLUMNS.iter().copied()),
        )
    }

    /// One Scottish Road Works Register export
    ///
    /// `identifier` names the export: a year such as `2023`, a month of the
    /// current year such as `APR`, or a day of the current month such as `15`.
    pub fn scottish_permits(&self, identifier: &str) -> Result<FeedDefinition> {
        if identifier.is_empty() || !identifier.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(IngestError::Config(format!(
                "Invalid export identifier {:?}: expected a year, month or day",
                identifier
            )));
        }

        let url = srwr_url(&self.srwr_base_url, identifier);
        let record_types = SRWR_RECORD_TYPES.iter().map(|t| t.to_string()).collect();
        let source = ArchiveSource::new(url, ArchiveKind::CsvMembers { record_types })
            .with_presigned_url()
            .with_options(self.options.clone());

        Ok(FeedDefinition::new(
            format!("scottish-permits-{}", identifier),
            Box::new(source),
            DestinationTable::new(
                "raw_data_scotland",
                format!("srwr_{}", identifier.to_ascii_lowercase()),
            ),
            TableDefinition::varchar(CSV_MEMBER_COLUMNS.iter().copied()),
        ))
    }
}

/// `<base>/export/api/v1/file/<identifier>.zip`
pub fn srwr_url(base: &str, identifier: &str) -> String {
    format!("{}/export/api/v1/file/{}.zip", base, identifier)
}

/// Year and month of the calendar month before `today`
pub fn previous_month(today: NaiveDate) -> (i32, u32) {
    if today.month() == 1 {
        (today.year() - 1, 12)
    } else {
        (today.year(), today.month() - 1)
    }
}

/// `<base>/<YYYY>/<MM>.zip`
pub fn permit_url(base: &str, year: i32, month: u32) -> String {
    format!("{}/{}/{:02}.zip", base, year, month)
}

/// `<MM>_<YYYY>`
pub fn permit_table_name(year: i32, month: u32) -> String {
    format!("{:02}_{}", month, year)
}

/// Data model every permit event must follow
///
/// All fields must be present but any may be null; a handful of events in each
/// monthly archive leave references empty.
pub fn permit_contract() -> SchemaContract {
    let integers = ["event_reference", "version"];
    let texts = [
        "event_type",
        "work_reference_number",
        "permit_reference_number",
        "promoter_swa_code",
        "promoter_organisation",
        "highway_authority",
        "highway_authority_swa_code",
        "event_time",
        "object_type",
        "object_reference",
    ];

    let contract = integers.iter().fold(SchemaContract::new(), |c, name| {
        c.field(*name, Optionality::Nullable, FieldType::Integer)
    });
    texts.iter().fold(contract, |c, name| {
        c.field(*name, Optionality::Nullable, FieldType::Text)
    })
}

fn definition(columns: &[(&str, ColumnType)]) -> TableDefinition {
    columns
        .iter()
        .fold(TableDefinition::new(), |d, (name, ty)| d.column(*name, ty.clone()))
}

fn trim_slash(url: String) -> String {
    url.trim_end_matches('/').to_string()
}
