//! HTTP access for archive readers

use std::path::PathBuf;

use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, Response};
use serde::Deserialize;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use super::progress::bytes_bar;
use super::ReaderOptions;
use crate::error::{IngestError, Result};

/// File name given to a downloaded archive inside its scratch directory
pub const SCRATCH_ARCHIVE: &str = "archive.zip";

/// Client with the mandatory connect and read timeouts
pub fn client(options: &ReaderOptions) -> Result<Client> {
    Ok(Client::builder()
        .connect_timeout(options.connect_timeout)
        .read_timeout(options.read_timeout)
        .user_agent(concat!("roadworks-ingest/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

/// GET a URL; any non-2xx status is an error
pub async fn fetch(client: &Client, url: &str) -> Result<Response> {
    let response = client.get(url).send().await?;
    let status = response.status();

    if !status.is_success() {
        return Err(IngestError::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    debug!(url = %url, status = status.as_u16(), length = ?response.content_length(), "Response received");
    Ok(response)
}

/// Follow a URL's redirects and return where they end up
///
/// The body is never read.
pub async fn resolve_redirect(client: &Client, url: &str) -> Result<String> {
    let response = fetch(client, url).await?;
    let resolved = response.url().to_string();
    info!(url = %url, resolved = %resolved, "Resolved redirect URL");
    Ok(resolved)
}

#[derive(Debug, Deserialize)]
struct PresignedLink {
    url: String,
}

/// Ask an export endpoint for the presigned link to its archive
///
/// The endpoint answers with a JSON object whose `url` field is the link. The
/// link carries a signature, so only the endpoint is logged.
pub async fn resolve_presigned(client: &Client, url: &str) -> Result<String> {
    let response = fetch(client, url).await?;
    let link: PresignedLink = response.json().await?;
    info!(url = %url, "Presigned URL generated");
    Ok(link.url)
}

/// Response body as an async byte reader
pub fn body_reader(response: Response) -> impl AsyncRead + Send + Unpin + 'static {
    let stream = response
        .bytes_stream()
        .map_err(std::io::Error::other)
        .boxed();
    StreamReader::new(stream)
}

/// A downloaded archive and the directory holding it
///
/// The directory and everything extracted into it are deleted on drop.
#[derive(Debug)]
pub struct Scratch {
    pub dir: TempDir,
    pub archive: PathBuf,
}

impl Scratch {
    /// Extract the first member whose name ends with `extension` next to the
    /// archive, returning its path
    ///
    /// Blocking; call from a producer thread.
    pub fn extract_first(&self, extension: &str, url: &str) -> Result<PathBuf> {
        let file = std::fs::File::open(&self.archive)?;
        let mut archive = zip::ZipArchive::new(std::io::BufReader::new(file))?;
        let extension = extension.to_ascii_lowercase();

        for i in 0..archive.len() {
            let mut member = archive.by_index(i)?;
            if member.is_dir() || !member.name().to_ascii_lowercase().ends_with(&extension) {
                continue;
            }

            let name = member.name().to_string();
            let file_name = name.rsplit('/').next().unwrap_or(&name).to_string();
            let target = self.dir.path().join(&file_name);

            let mut out = std::fs::File::create(&target)?;
            let bytes = std::io::copy(&mut member, &mut out)?;
            info!(member = %name, bytes, "Extracted archive member");
            return Ok(target);
        }

        Err(IngestError::MissingArchiveMember {
            url: url.to_string(),
            extension: extension.to_string(),
        })
    }
}

/// Download a whole archive into a fresh scratch directory
pub async fn download_to_scratch(client: &Client, url: &str, options: &ReaderOptions) -> Result<Scratch> {
    let response = fetch(client, url).await?;
    let dir = tempfile::Builder::new().prefix("roadworks-").tempdir()?;
    let archive = dir.path().join(SCRATCH_ARCHIVE);

    let pb = bytes_bar(
        response.content_length(),
        format!("Downloading {}", url),
        options.show_progress,
    );

    let mut file = tokio::fs::File::create(&archive).await?;
    let mut downloaded = 0u64;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
        pb.set_position(downloaded);
    }
    file.flush().await?;

    pb.finish_and_clear();
    info!(url = %url, bytes = downloaded, "Archive downloaded");

    Ok(Scratch { dir, archive })
}
