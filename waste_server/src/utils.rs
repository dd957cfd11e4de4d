//! Utility functions
//!
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use reqwest::Client;

/// Download a file from a URL to a given filepath.
pub async fn download_file(client: &Client, url: &str, filepath: impl AsRef<Path>) -> Result<()> {
    let resp = client.get(url).send().await?.error_for_status()?;
    let content = resp.bytes().await?;

    if let Some(parent) = filepath.as_ref().parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(filepath, &content).await?;

    Ok(())
}

/// Find a model file, downloading it into the cache directory if needed.
///
/// `path` is used as is when it exists. Otherwise the model is looked up in
/// (or downloaded into) `<cache dir>/waste_server/` under the same file name.
pub async fn resolve_model(path: &Path, url: Option<&str>) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_owned());
    }

    let Some(url) = url else {
        bail!("model {} not found and no download URL given", path.display());
    };

    let file_name = path
        .file_name()
        .with_context(|| format!("model path {} has no file name", path.display()))?;
    let cached = dirs::cache_dir()
        .context("no cache directory available")?
        .join("waste_server")
        .join(file_name);

    if !cached.exists() {
        log::info!("Downloading model from {url} to {}", cached.display());
        download_file(&Client::new(), url, &cached)
            .await
            .with_context(|| format!("failed to download {url}"))?;
    }

    Ok(cached)
}
