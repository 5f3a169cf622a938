use anpsales::pipeline;
use anyhow::Result;
use reqwest::Client;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // ─── 1) init logging ─────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();
    info!("startup");

    // ─── 2) configure dirs ───────────────────────────────────────────
    let client = Client::new();
    let data_dir = PathBuf::from("data");
    let output_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("data/fuel_sales_refined_parquet"));
    std::fs::create_dir_all(&data_dir)?;

    // ─── 3) run the pipeline once ────────────────────────────────────
    pipeline::run(&client, &data_dir, &output_path).await?;

    info!("all done");
    Ok(())
}
