use anyhow::{bail, Context, Result};
use rand::Rng;
use tracing::info;

use crate::process::RawTable;

/// Evaluates the one aggregate shape the verifier issues against the
/// registered tidy table.
pub trait VolumeSum {
    /// `SUM(volume)` over tidy rows matching (uf, year of year_month,
    /// product). `None` when no rows match.
    fn sum_volume(&self, year: i32, uf: &str, product: &str) -> Result<Option<f64>>;
}

/// Absolute tolerance absorbing float rounding from zero-fill and
/// aggregation; anything past it is a real discrepancy.
pub const TOLERANCE: f64 = 0.01;

/// Product redraw cap for a sampled (year, uf) pair with no reported data.
pub const MAX_REDRAWS: usize = 100;

/// Randomized spot-check of the reshape: one (year, uf, product) triple per
/// pipeline run, summed from the tidy table and compared to the raw TOTAL.
/// A smoke test, not a reconciliation.
#[derive(Debug, Clone, Copy)]
pub struct Verifier {
    pub tolerance: f64,
    pub max_redraws: usize,
}

impl Default for Verifier {
    fn default() -> Self {
        Self {
            tolerance: TOLERANCE,
            max_redraws: MAX_REDRAWS,
        }
    }
}

/// The triple that was checked and both sides of the comparison.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub year: i32,
    pub uf: String,
    pub product: String,
    pub expected: f64,
    pub actual: f64,
}

impl Verifier {
    pub fn check<R: Rng>(
        &self,
        raw: &RawTable,
        engine: &impl VolumeSum,
        rng: &mut R,
    ) -> Result<VerifyReport> {
        let years = raw.distinct_years();
        let ufs = raw.distinct_ufs();
        let products = raw.distinct_products();
        if years.is_empty() || ufs.is_empty() || products.is_empty() {
            bail!("raw table is empty, nothing to verify");
        }

        let year = years[rng.gen_range(0..years.len())];
        let uf = &ufs[rng.gen_range(0..ufs.len())];
        let (product, expected) = self.draw_total(raw, year, uf, &products, rng)?;

        let actual = engine
            .sum_volume(year, uf, &product)
            .context("evaluating verification aggregate")?
            .unwrap_or(0.0);

        let diff = (actual - expected).abs();
        if diff > self.tolerance {
            bail!(
                "data consistency check failed for year {} uf {} product {}: \
                 tidy sum {} vs raw TOTAL {} (|diff| {} > {})",
                year,
                uf,
                product,
                actual,
                expected,
                diff,
                self.tolerance
            );
        }

        info!(year, uf = %uf, product = %product, expected, actual, "consistency check passed");
        Ok(VerifyReport {
            year,
            uf: uf.clone(),
            product,
            expected,
            actual,
        })
    }

    /// Pick a product with a TOTAL for (year, uf). The year and uf stay
    /// fixed; only the product is redrawn, up to `max_redraws` times.
    fn draw_total<R: Rng>(
        &self,
        raw: &RawTable,
        year: i32,
        uf: &str,
        products: &[String],
        rng: &mut R,
    ) -> Result<(String, f64)> {
        let mut product = &products[rng.gen_range(0..products.len())];
        let mut redraws = 0;
        loop {
            if let Some(total) = raw.total_for(year, uf, product) {
                return Ok((product.clone(), total));
            }
            redraws += 1;
            if redraws > self.max_redraws {
                bail!(
                    "verification setup: no reported product for year {} uf {} after {} redraws",
                    year,
                    uf,
                    self.max_redraws
                );
            }
            product = &products[rng.gen_range(0..products.len())];
        }
    }
}
