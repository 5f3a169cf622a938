use anyhow::Result;
use reqwest::Client;
use std::path::{Path, PathBuf};
use tokio::fs;
use url::Url;

/// A remote wide-format source file and the name it is cached under locally.
#[derive(Debug, Clone, Copy)]
pub struct Source {
    pub url: &'static str,
    pub file_name: &'static str,
}

/// The two ANP sales tables. Both carry the same 18-column wide layout
/// (product, year, region, uf, unit, Jan..Dec, TOTAL), so the loader can
/// stack them without any column alignment.
pub static SOURCES: &[Source] = &[
    Source {
        url: "https://github.com/albertotav/raizen-data-engineering-test/blob/main/raw_data/diesel_by_uf_and_type.csv.gz?raw=true",
        file_name: "diesel_by_uf_and_type.csv.gz",
    },
    Source {
        url: "https://github.com/albertotav/raizen-data-engineering-test/blob/main/raw_data/oil_derivative_fuels_by_uf_and_product.csv.gz?raw=true",
        file_name: "oil_derivative_fuels_by_uf_and_product.csv.gz",
    },
];

/// Download `source` and save it under `dest_dir` using its cache filename.
/// Returns the full path of the saved file.
pub async fn download_source(
    client: &Client,
    source: &Source,
    dest_dir: impl AsRef<Path>,
) -> Result<PathBuf> {
    let url = Url::parse(source.url)?;
    let dest_path = dest_dir.as_ref().join(source.file_name);

    if let Some(parent) = dest_path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let resp = client.get(url.as_str()).send().await?.error_for_status()?;
    let bytes = resp.bytes().await?;
    fs::write(&dest_path, &bytes).await?;

    Ok(dest_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_registry_is_well_formed() {
        assert_eq!(SOURCES.len(), 2);
        for source in SOURCES {
            Url::parse(source.url).expect("source URL must parse");
            assert!(source.file_name.ends_with(".csv.gz"));
        }
        assert_ne!(SOURCES[0].file_name, SOURCES[1].file_name);
    }
}
