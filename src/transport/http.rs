use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tempfile::Builder;

use crate::container::LocalArchive;
use crate::error::KiraError;
use crate::fs_util;
use crate::resolver::{CandidateLocation, RemoteFile};
use crate::transport::AttemptContext;

#[derive(Clone)]
pub struct HttpDownloader {
    client: Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self, KiraError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-sra/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| KiraError::InvalidConfig(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| KiraError::InvalidConfig(err.to_string()))?;
        Ok(Self { client })
    }

    /// aws-http: one object from the open data bucket, saved as `<acc>.sra`.
    pub fn fetch_sra(
        &self,
        location: &CandidateLocation,
        ctx: &AttemptContext<'_>,
    ) -> Result<LocalArchive, KiraError> {
        let file = location
            .files
            .first()
            .ok_or_else(|| KiraError::download("no file in resolved location", false))?;
        let dest = ctx.sra_destination();
        self.fetch(file, &file.locator, &dest, ctx)?;
        Ok(LocalArchive::Sra(dest))
    }

    /// ena-ftp: every FASTQ file listed in the ENA file report.
    pub fn fetch_presplit(
        &self,
        location: &CandidateLocation,
        ctx: &AttemptContext<'_>,
    ) -> Result<LocalArchive, KiraError> {
        if location.files.is_empty() {
            return Err(KiraError::download("ENA lists no FASTQ files", false));
        }
        let mut paths = Vec::with_capacity(location.files.len());
        for file in &location.files {
            let dest = ctx.work_dir.join(file.file_name());
            self.fetch(file, &ftp_url(&file.locator), &dest, ctx)?;
            paths.push(dest);
        }
        Ok(LocalArchive::PresplitFastqGz(paths))
    }

    fn fetch(
        &self,
        file: &RemoteFile,
        url: &str,
        dest: &Path,
        ctx: &AttemptContext<'_>,
    ) -> Result<(), KiraError> {
        tracing::debug!(url, dest = %dest.display(), "http download");
        let mut response = self
            .client
            .get(url)
            .timeout(ctx.remaining()?)
            .send()
            .map_err(|err| request_error(err, ctx.timeout))?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, url));
        }

        let mut temp = Builder::new()
            .prefix(".part-")
            .tempfile_in(ctx.work_dir)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        io::copy(&mut response, temp.as_file_mut()).map_err(|err| {
            if err.kind() == io::ErrorKind::TimedOut {
                KiraError::AttemptTimedOut(ctx.timeout.as_secs())
            } else {
                KiraError::download(format!("{url}: {err}"), true)
            }
        })?;

        verify(file, temp.path(), url)?;
        temp.persist(dest)
            .map_err(|err| KiraError::Filesystem(format!("persist {}: {err}", dest.display())))?;
        Ok(())
    }
}

/// Checks a downloaded file against the size and md5 the resolver reported.
/// A mismatch is a truncated or corrupted transfer, so it is worth a retry.
pub fn verify(file: &RemoteFile, path: &Path, url: &str) -> Result<(), KiraError> {
    if let Some(expected) = file.size {
        let actual = fs::metadata(path)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?
            .len();
        if actual != expected {
            return Err(KiraError::download(
                format!("{url}: size mismatch (expected {expected} bytes, got {actual})"),
                true,
            ));
        }
    }
    if let Some(expected) = &file.md5 {
        let actual = fs_util::md5_file(path)?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(KiraError::download(
                format!("{url}: md5 mismatch (expected {expected}, got {actual})"),
                true,
            ));
        }
    }
    Ok(())
}

/// ENA reports FTP locators without a scheme; the same paths are served over https.
pub fn ftp_url(locator: &str) -> String {
    if locator.contains("://") {
        locator.to_string()
    } else {
        format!("https://{locator}")
    }
}

fn request_error(err: reqwest::Error, timeout: Duration) -> KiraError {
    if err.is_timeout() {
        return KiraError::AttemptTimedOut(timeout.as_secs());
    }
    KiraError::from(err)
}

fn status_error(status: StatusCode, url: &str) -> KiraError {
    let transient = status.is_server_error()
        || matches!(
            status,
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT
        );
    KiraError::download(format!("{url} returned {status}"), transient)
}
