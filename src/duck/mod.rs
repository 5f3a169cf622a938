use anyhow::{Context, Result};
use duckdb::{params, Connection, ToSql};

use crate::process::TidyTable;
use crate::verify::VolumeSum;

/// Name the tidy table is registered under inside the session.
pub const TIDY_TABLE: &str = "fuel_sales";

/// Open a DuckDB in-memory database.
pub fn open_mem_db() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    Ok(conn)
}

/// A tidy table registered in a DuckDB session. The connection is owned by
/// the caller and handed in explicitly; nothing here is process-global.
pub struct TidySession<'a> {
    conn: &'a Connection,
}

impl<'a> TidySession<'a> {
    /// Create the `fuel_sales` table and bulk-load `tidy` into it via the
    /// appender.
    pub fn register(conn: &'a Connection, tidy: &TidyTable) -> Result<Self> {
        conn.execute_batch(&format!(
            "CREATE TABLE {TIDY_TABLE}(
                year_month DATE,
                uf VARCHAR,
                product VARCHAR,
                unit VARCHAR,
                volume DOUBLE
            );"
        ))
        .context("creating tidy table")?;

        let mut appender = conn.appender(TIDY_TABLE).context("opening appender")?;
        appender
            .append_rows(tidy.rows.iter().map(|r| {
                [
                    &r.year_month as &dyn ToSql,
                    &r.uf as &dyn ToSql,
                    &r.product as &dyn ToSql,
                    &r.unit as &dyn ToSql,
                    &r.volume as &dyn ToSql,
                ]
            }))
            .context("appending tidy rows")?;
        appender.flush().context("flushing appender")?;

        Ok(Self { conn })
    }
}

impl VolumeSum for TidySession<'_> {
    fn sum_volume(&self, year: i32, uf: &str, product: &str) -> Result<Option<f64>> {
        let sql = format!(
            "SELECT SUM(volume) FROM {TIDY_TABLE} \
             WHERE uf = ? AND YEAR(year_month) = ? AND product = ?"
        );
        let sum = self
            .conn
            .query_row(&sql, params![uf, year, product], |row| {
                row.get::<_, Option<f64>>(0)
            })
            .context("executing verification query")?;
        Ok(sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{self, RawRow, RawTable};
    use anyhow::Result;

    fn sample_raw() -> RawTable {
        let mut months = [None; 12];
        months[0] = Some(10.0);
        months[1] = Some(20.0);
        RawTable {
            rows: vec![
                RawRow {
                    product: "DIESEL".to_string(),
                    year: 2021,
                    region: "SUDESTE".to_string(),
                    uf: "SP".to_string(),
                    unit: "m3".to_string(),
                    months,
                    total: Some(30.0),
                },
                RawRow {
                    product: "GASOLINA C".to_string(),
                    year: 2020,
                    region: "SUDESTE".to_string(),
                    uf: "RJ".to_string(),
                    unit: "m3".to_string(),
                    months: [Some(2.5); 12],
                    total: Some(30.0),
                },
            ],
        }
    }

    #[test]
    fn registered_table_answers_the_aggregate() -> Result<()> {
        let tidy = process::reshape(&sample_raw())?;
        let conn = open_mem_db()?;
        let session = TidySession::register(&conn, &tidy)?;

        let sum = session.sum_volume(2021, "SP", "DIESEL")?;
        assert!((sum.unwrap() - 30.0).abs() <= 0.01);

        let sum = session.sum_volume(2020, "RJ", "GASOLINA C")?;
        assert!((sum.unwrap() - 30.0).abs() <= 0.01);
        Ok(())
    }

    #[test]
    fn unmatched_triple_sums_to_null() -> Result<()> {
        let tidy = process::reshape(&sample_raw())?;
        let conn = open_mem_db()?;
        let session = TidySession::register(&conn, &tidy)?;

        assert_eq!(session.sum_volume(2021, "RJ", "DIESEL")?, None);
        Ok(())
    }

    #[test]
    fn year_predicate_filters_by_calendar_year() -> Result<()> {
        let tidy = process::reshape(&sample_raw())?;
        let conn = open_mem_db()?;
        let session = TidySession::register(&conn, &tidy)?;

        // DIESEL exists only in 2021; asking for 2020 must not pick it up.
        assert_eq!(session.sum_volume(2020, "SP", "DIESEL")?, None);
        Ok(())
    }
}
