use anyhow::{anyhow, bail, Context, Result};
use arrow::{
    array::{ArrayRef, Date32Array, Float64Array, StringArray, TimestampMicrosecondArray},
    datatypes::{DataType, Date32Type, Field, Schema, TimeUnit},
    record_batch::RecordBatch,
};
use chrono::{DateTime, NaiveDate, Utc};
use csv::ReaderBuilder;
use flate2::read::GzDecoder;
use std::{collections::BTreeMap, fs::File, io::Read, path::Path, sync::Arc};
use tracing::{debug, info};

/// Physical layout shared by both source files:
/// product, year, region, uf, unit, Jan..Dec, TOTAL.
pub const WIDE_COLUMN_COUNT: usize = 18;

/// Month labels in file order. Date derivation uses this fixed table, never
/// the process locale.
pub const MONTH_LABELS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// One wide row: a product reported for a (region, uf) across one calendar
/// year, with a per-row TOTAL the source maintains as the sum of the months.
#[derive(Debug, Clone)]
pub struct RawRow {
    pub product: String,
    pub year: i32,
    pub region: String,
    pub uf: String,
    pub unit: String,
    /// Jan..Dec volumes; `None` where the source cell is empty.
    pub months: [Option<f64>; 12],
    pub total: Option<f64>,
}

/// The concatenated wide table. Read-only once built; the verifier samples
/// it for ground-truth TOTALs after the reshape.
#[derive(Debug, Default)]
pub struct RawTable {
    pub rows: Vec<RawRow>,
}

impl RawTable {
    /// Stack `other`'s rows under `self`'s. Both sources share the layout by
    /// construction, so there is no column alignment to do.
    pub fn concat(mut self, other: RawTable) -> RawTable {
        self.rows.extend(other.rows);
        self
    }

    pub fn distinct_years(&self) -> Vec<i32> {
        let mut years: Vec<i32> = self.rows.iter().map(|r| r.year).collect();
        years.sort_unstable();
        years.dedup();
        years
    }

    pub fn distinct_ufs(&self) -> Vec<String> {
        let mut ufs: Vec<String> = self.rows.iter().map(|r| r.uf.clone()).collect();
        ufs.sort();
        ufs.dedup();
        ufs
    }

    pub fn distinct_products(&self) -> Vec<String> {
        let mut products: Vec<String> = self.rows.iter().map(|r| r.product.clone()).collect();
        products.sort();
        products.dedup();
        products
    }

    /// The authoritative TOTAL for a (year, uf, product) triple, or `None`
    /// when the product was not reported for that uf and year. A present row
    /// with an empty TOTAL cell counts as zero, matching the zero-fill rule
    /// applied to the month cells.
    pub fn total_for(&self, year: i32, uf: &str, product: &str) -> Option<f64> {
        self.rows
            .iter()
            .find(|r| r.year == year && r.uf == uf && r.product == product)
            .map(|r| r.total.unwrap_or(0.0))
    }
}

/// One long row: a product volume for a single (uf, month).
#[derive(Debug, Clone, PartialEq)]
pub struct TidyRow {
    pub year_month: NaiveDate,
    pub uf: String,
    pub product: String,
    pub unit: String,
    pub volume: f64,
}

#[derive(Debug, Default)]
pub struct TidyTable {
    pub rows: Vec<TidyRow>,
}

impl TidyTable {
    /// Render the table as an Arrow batch in the persisted schema, stamping
    /// every row with the `created_at` ingestion timestamp.
    pub fn to_record_batch(&self, created_at: DateTime<Utc>) -> Result<RecordBatch> {
        let schema = Schema::new(vec![
            Field::new("year_month", DataType::Date32, false),
            Field::new("uf", DataType::Utf8, false),
            Field::new("product", DataType::Utf8, false),
            Field::new("unit", DataType::Utf8, false),
            Field::new("volume", DataType::Float64, false),
            Field::new(
                "created_at",
                DataType::Timestamp(TimeUnit::Microsecond, None),
                false,
            ),
        ]);

        let year_month = Date32Array::from_iter_values(
            self.rows
                .iter()
                .map(|r| Date32Type::from_naive_date(r.year_month)),
        );
        let uf = StringArray::from_iter_values(self.rows.iter().map(|r| r.uf.as_str()));
        let product = StringArray::from_iter_values(self.rows.iter().map(|r| r.product.as_str()));
        let unit = StringArray::from_iter_values(self.rows.iter().map(|r| r.unit.as_str()));
        let volume = Float64Array::from_iter_values(self.rows.iter().map(|r| r.volume));
        let ts = created_at.timestamp_micros();
        let created = TimestampMicrosecondArray::from_iter_values(
            std::iter::repeat(ts).take(self.rows.len()),
        );

        RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(year_month) as ArrayRef,
                Arc::new(uf),
                Arc::new(product),
                Arc::new(unit),
                Arc::new(volume),
                Arc::new(created),
            ],
        )
        .context("building tidy record batch")
    }

    /// Split the table by the value of one dimension column, keyed by the
    /// rendered partition value. `volume` is not a partition column.
    pub fn partition_by(&self, column: &str) -> Result<BTreeMap<String, TidyTable>> {
        let key = |r: &TidyRow| -> Result<String> {
            Ok(match column {
                "year_month" => r.year_month.to_string(),
                "uf" => r.uf.clone(),
                "product" => r.product.clone(),
                "unit" => r.unit.clone(),
                other => bail!("unsupported partition column {:?}", other),
            })
        };

        let mut parts: BTreeMap<String, TidyTable> = BTreeMap::new();
        for row in &self.rows {
            parts
                .entry(key(row)?)
                .or_default()
                .rows
                .push(row.clone());
        }
        Ok(parts)
    }
}

/// ISO-8859-1 maps every byte to the Unicode code point of the same value.
fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Empty cells are "not yet reported" and come back as `None`; a non-empty
/// cell that fails to parse is a layout violation and errors.
fn parse_volume(cell: &str) -> Result<Option<f64>> {
    let cell = cell.trim();
    if cell.is_empty() {
        return Ok(None);
    }
    let value = cell
        .parse::<f64>()
        .with_context(|| format!("invalid numeric cell {:?}", cell))?;
    Ok(Some(value))
}

/// Read one cached `.csv.gz` source: gunzip, decode ISO-8859-1, parse.
#[tracing::instrument(level = "info", skip(path), fields(path = %path.as_ref().display()))]
pub fn load_wide_csv<P: AsRef<Path>>(path: P) -> Result<RawTable> {
    let file = File::open(&path)
        .with_context(|| format!("opening source file {:?}", path.as_ref()))?;
    let mut decoder = GzDecoder::new(file);
    let mut bytes = Vec::new();
    decoder
        .read_to_end(&mut bytes)
        .with_context(|| format!("decompressing {:?}", path.as_ref()))?;
    parse_wide_csv(&decode_latin1(&bytes))
}

/// Parse decoded CSV text into a `RawTable`, binding columns positionally to
/// the fixed wide layout. The header row is present in both sources but its
/// spellings are source-language; only the column count is checked, and a
/// count other than 18 fails the load before any row is mapped.
pub fn parse_wide_csv(text: &str) -> Result<RawTable> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .from_reader(text.as_bytes());

    let headers = rdr.headers().context("reading header row")?;
    if headers.len() != WIDE_COLUMN_COUNT {
        bail!(
            "unexpected column layout: got {} columns, want {}",
            headers.len(),
            WIDE_COLUMN_COUNT
        );
    }

    let mut rows = Vec::new();
    for (idx, result) in rdr.records().enumerate() {
        let record = result.with_context(|| format!("CSV parse error at record {}", idx))?;
        if record.len() != WIDE_COLUMN_COUNT {
            bail!(
                "record {} has {} fields, want {}",
                idx,
                record.len(),
                WIDE_COLUMN_COUNT
            );
        }

        let year: i32 = record[1]
            .trim()
            .parse()
            .with_context(|| format!("invalid year {:?} at record {}", &record[1], idx))?;

        let mut months = [None; 12];
        for (m, slot) in months.iter_mut().enumerate() {
            *slot = parse_volume(&record[5 + m])
                .with_context(|| format!("record {}, month {}", idx, MONTH_LABELS[m]))?;
        }

        rows.push(RawRow {
            product: record[0].trim().to_string(),
            year,
            region: record[2].trim().to_string(),
            uf: record[3].trim().to_string(),
            unit: record[4].trim().to_string(),
            months,
            total: parse_volume(&record[17])
                .with_context(|| format!("record {}, TOTAL", idx))?,
        });
    }

    info!(rows = rows.len(), "parsed wide table");
    Ok(RawTable { rows })
}

/// Parse `"YYYY-Mon"` (4-digit year, literal '-', 3-letter label from the
/// fixed table) into the first day of that month. Returns `None` for
/// anything outside the twelve recognized labels.
pub fn parse_year_month(s: &str) -> Option<NaiveDate> {
    if s.len() != 8 || &s[4..5] != "-" {
        return None;
    }
    let year: i32 = s[0..4].parse().ok()?;
    let month = MONTH_LABELS.iter().position(|&m| m == &s[5..8])? as u32 + 1;
    NaiveDate::from_ymd_opt(year, month, 1)
}

/// Unpivot the wide table: every raw row becomes exactly twelve tidy rows,
/// one per month slot. TOTAL is dropped here and survives only in the raw
/// form, where the verifier reads it back. Empty month cells become 0.0;
/// those are months not yet reported for the most recent year, not errors.
/// An unrecognized month label fails the whole batch rather than just the
/// row.
#[tracing::instrument(level = "info", skip(raw), fields(raw_rows = raw.rows.len()))]
pub fn reshape(raw: &RawTable) -> Result<TidyTable> {
    let mut rows = Vec::with_capacity(raw.rows.len() * MONTH_LABELS.len());
    for r in &raw.rows {
        for (m, label) in MONTH_LABELS.iter().enumerate() {
            let key = format!("{}-{}", r.year, label);
            let year_month = parse_year_month(&key)
                .ok_or_else(|| anyhow!("unparseable year_month {:?}", key))?;
            rows.push(TidyRow {
                year_month,
                uf: r.uf.clone(),
                product: r.product.clone(),
                unit: r.unit.clone(),
                volume: r.months[m].unwrap_or(0.0),
            });
        }
    }

    debug!(tidy_rows = rows.len(), "reshaped wide table");
    Ok(TidyTable { rows })
}
