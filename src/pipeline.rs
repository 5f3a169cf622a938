use anyhow::{Context, Result};
use arrow::record_batch::RecordBatch;
use chrono::Utc;
use glob::glob;
use parquet::{arrow::ArrowWriter, basic::Compression, file::properties::WriterProperties};
use reqwest::Client;
use std::{
    fs,
    fs::File,
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::{info, instrument};

use crate::{
    duck, fetch,
    process::{self, RawTable, TidyTable},
    verify::{Verifier, VerifyReport},
};

/// How `save` treats part files already present at the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Add a new part file next to whatever is already there.
    Append,
    /// Drop previously written part files first.
    Overwrite,
}

/// Persisted representation; parquet is the only supported format today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Parquet,
}

/// The verified dataset: built by load → reshape → verify, in that order,
/// and only constructible when the consistency check passed.
#[derive(Debug)]
pub struct DatasetPipeline {
    tidy: TidyTable,
    report: VerifyReport,
}

impl DatasetPipeline {
    /// Download both sources into `data_dir`, stack them, and build the
    /// verified dataset.
    pub async fn fetch(client: &Client, data_dir: &Path) -> Result<Self> {
        let mut tables = Vec::with_capacity(fetch::SOURCES.len());
        for source in fetch::SOURCES {
            let path = fetch::download_source(client, source, data_dir)
                .await
                .with_context(|| format!("downloading {}", source.file_name))?;
            info!(file = source.file_name, "downloaded source");
            tables.push(process::load_wide_csv(&path)?);
        }
        let raw = tables
            .into_iter()
            .reduce(RawTable::concat)
            .context("no sources configured")?;
        Self::from_raw(raw)
    }

    /// Reshape `raw` and run the consistency check against a fresh DuckDB
    /// session. Fails closed: an unverified dataset never exists.
    #[instrument(level = "info", skip(raw), fields(raw_rows = raw.rows.len()))]
    pub fn from_raw(raw: RawTable) -> Result<Self> {
        let tidy = process::reshape(&raw)?;

        let conn = duck::open_mem_db()?;
        let session = duck::TidySession::register(&conn, &tidy)?;
        let report = Verifier::default().check(&raw, &session, &mut rand::thread_rng())?;

        Ok(Self { tidy, report })
    }

    pub fn tidy(&self) -> &TidyTable {
        &self.tidy
    }

    pub fn report(&self) -> &VerifyReport {
        &self.report
    }

    /// Persist the tidy table under `dest`, stamped with the ingestion
    /// timestamp. `partition_by` names one dimension column and produces
    /// `col=value` subdirectories.
    pub fn save(
        &self,
        dest: &Path,
        partition_by: Option<&str>,
        mode: WriteMode,
        format: OutputFormat,
    ) -> Result<()> {
        match format {
            OutputFormat::Parquet => self.to_parquet(dest, partition_by, mode),
        }
    }

    fn to_parquet(&self, dest: &Path, partition_by: Option<&str>, mode: WriteMode) -> Result<()> {
        let created_at = Utc::now();
        match partition_by {
            None => {
                let batch = self.tidy.to_record_batch(created_at)?;
                write_part(dest, &batch, mode)
            }
            Some(column) => {
                for (value, part) in self.tidy.partition_by(column)? {
                    let batch = part.to_record_batch(created_at)?;
                    write_part(&dest.join(format!("{}={}", column, value)), &batch, mode)?;
                }
                Ok(())
            }
        }
    }
}

static PART_SEQ: AtomicU64 = AtomicU64::new(0);

fn write_part(dir: &Path, batch: &RecordBatch, mode: WriteMode) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("creating output dir {}", dir.display()))?;

    if mode == WriteMode::Overwrite {
        let pattern = format!("{}/part-*.parquet", dir.display());
        for entry in glob(&pattern)?.flatten() {
            fs::remove_file(&entry)
                .with_context(|| format!("removing stale part {}", entry.display()))?;
        }
    }

    let seq = PART_SEQ.fetch_add(1, Ordering::Relaxed);
    let path = dir.join(format!(
        "part-{}-{}.parquet",
        Utc::now().timestamp_micros(),
        seq
    ));
    let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer =
        ArrowWriter::try_new(file, batch.schema(), Some(props)).context("creating parquet writer")?;
    writer.write(batch).context("writing batch to parquet")?;
    writer.close().context("closing parquet writer")?;

    info!(path = %path.display(), rows = batch.num_rows(), "wrote part file");
    Ok(())
}

/// Single orchestrated entry point: build the verified dataset from the two
/// remote sources and persist it under `output_path`. Scheduling is the
/// caller's concern; one invocation is one full run.
pub async fn run(client: &Client, data_dir: &Path, output_path: &Path) -> Result<()> {
    let pipeline = DatasetPipeline::fetch(client, data_dir).await?;
    pipeline.save(output_path, None, WriteMode::Append, OutputFormat::Parquet)?;
    info!(output = %output_path.display(), "dataset saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::RawRow;
    use anyhow::Result;
    use parquet::file::reader::FileReader;
    use parquet::file::serialized_reader::SerializedFileReader;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn raw_with_total(total: f64) -> RawTable {
        let mut months = [None; 12];
        months[0] = Some(10.0);
        months[1] = Some(20.0);
        months[11] = Some(0.0);
        RawTable {
            rows: vec![RawRow {
                product: "DIESEL".to_string(),
                year: 2021,
                region: "SUDESTE".to_string(),
                uf: "SP".to_string(),
                unit: "m3".to_string(),
                months,
                total: Some(total),
            }],
        }
    }

    fn part_files(dir: &Path) -> Vec<PathBuf> {
        let pattern = format!("{}/**/part-*.parquet", dir.display());
        glob(&pattern).unwrap().flatten().collect()
    }

    fn total_rows(files: &[PathBuf]) -> usize {
        files
            .iter()
            .map(|p| {
                let reader = SerializedFileReader::new(File::open(p).unwrap()).unwrap();
                reader.metadata().file_metadata().num_rows() as usize
            })
            .sum()
    }

    #[test]
    fn verified_dataset_saves_twelve_rows() -> Result<()> {
        let pipeline = DatasetPipeline::from_raw(raw_with_total(30.0))?;
        assert_eq!(pipeline.report().expected, 30.0);

        let out = TempDir::new()?;
        pipeline.save(out.path(), None, WriteMode::Append, OutputFormat::Parquet)?;

        let files = part_files(out.path());
        assert_eq!(files.len(), 1);
        assert_eq!(total_rows(&files), 12);
        Ok(())
    }

    #[test]
    fn inconsistent_total_aborts_before_save() {
        let err = DatasetPipeline::from_raw(raw_with_total(31.0)).unwrap_err();
        assert!(err.to_string().contains("consistency check failed"));
    }

    #[test]
    fn save_partitions_by_dimension_column() -> Result<()> {
        let mut raw = raw_with_total(30.0);
        let mut rj = raw.rows[0].clone();
        rj.uf = "RJ".to_string();
        raw.rows.push(rj);

        let pipeline = DatasetPipeline::from_raw(raw)?;
        let out = TempDir::new()?;
        pipeline.save(
            out.path(),
            Some("uf"),
            WriteMode::Append,
            OutputFormat::Parquet,
        )?;

        assert!(out.path().join("uf=SP").is_dir());
        assert!(out.path().join("uf=RJ").is_dir());
        assert_eq!(total_rows(&part_files(out.path())), 24);
        Ok(())
    }

    #[test]
    fn append_accumulates_and_overwrite_replaces() -> Result<()> {
        let pipeline = DatasetPipeline::from_raw(raw_with_total(30.0))?;
        let out = TempDir::new()?;

        pipeline.save(out.path(), None, WriteMode::Append, OutputFormat::Parquet)?;
        pipeline.save(out.path(), None, WriteMode::Append, OutputFormat::Parquet)?;
        assert_eq!(part_files(out.path()).len(), 2);

        pipeline.save(out.path(), None, WriteMode::Overwrite, OutputFormat::Parquet)?;
        let files = part_files(out.path());
        assert_eq!(files.len(), 1);
        assert_eq!(total_rows(&files), 12);
        Ok(())
    }
}
