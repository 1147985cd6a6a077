use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};

use crate::domain::{CostTier, Provider, RunAccession};
use crate::error::KiraError;

const ODP_HTTP_BASE: &str = "https://sra-pub-run-odp.s3.amazonaws.com";
const ODP_BUCKET: &str = "sra-pub-run-odp";
const SDL_URL: &str = "https://locate.ncbi.nlm.nih.gov/sdl/2/retrieve";
const ENA_FILEREPORT_URL: &str = "https://www.ebi.ac.uk/ena/portal/api/filereport";
const SDL_S3_LOCATION: &str = "s3.us-east-1";
const SDL_GS_LOCATION: &str = "gs.us-east1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteFile {
    pub locator: String,
    pub md5: Option<String>,
    pub size: Option<u64>,
}

impl RemoteFile {
    pub fn new(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            md5: None,
            size: None,
        }
    }

    /// Last path component of the locator.
    pub fn file_name(&self) -> &str {
        self.locator
            .rsplit(['/', ':'])
            .next()
            .unwrap_or(self.locator.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateLocation {
    pub provider: Provider,
    pub files: Vec<RemoteFile>,
    pub cost_tier: CostTier,
}

/// Maps a run to where a provider hosts it. Always a live lookup.
pub trait LocationResolver: Send + Sync {
    fn resolve(
        &self,
        accession: &RunAccession,
        provider: Provider,
    ) -> Result<CandidateLocation, KiraError>;
}

#[derive(Clone)]
pub struct HttpLocationResolver {
    client: Client,
    odp_base: String,
    sdl_url: String,
    ena_url: String,
}

impl HttpLocationResolver {
    pub fn new() -> Result<Self, KiraError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-sra/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| KiraError::InvalidConfig(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| KiraError::InvalidConfig(err.to_string()))?;
        Ok(Self {
            client,
            odp_base: ODP_HTTP_BASE.to_string(),
            sdl_url: SDL_URL.to_string(),
            ena_url: ENA_FILEREPORT_URL.to_string(),
        })
    }

    pub fn with_endpoints(mut self, odp_base: &str, sdl_url: &str, ena_url: &str) -> Self {
        self.odp_base = odp_base.trim_end_matches('/').to_string();
        self.sdl_url = sdl_url.to_string();
        self.ena_url = ena_url.to_string();
        self
    }

    fn unavailable(provider: Provider, message: impl Into<String>) -> KiraError {
        KiraError::ResolutionUnavailable {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    fn not_found(provider: Provider, accession: &RunAccession) -> KiraError {
        KiraError::ResolutionNotFound {
            provider: provider.to_string(),
            accession: accession.to_string(),
        }
    }

    fn odp_key(accession: &RunAccession) -> String {
        format!("sra/{acc}/{acc}", acc = accession.as_str())
    }

    /// Whether the run sits in the free open-data bucket.
    fn odp_has_run(
        &self,
        accession: &RunAccession,
        provider: Provider,
    ) -> Result<bool, KiraError> {
        let url = format!("{}/{}", self.odp_base, Self::odp_key(accession));
        let response = self
            .client
            .head(&url)
            .send()
            .map_err(|err| Self::unavailable(provider, err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        if matches!(status, StatusCode::NOT_FOUND | StatusCode::FORBIDDEN) {
            return Ok(false);
        }
        Err(Self::unavailable(provider, format!("open data bucket returned {status}")))
    }

    fn sdl_lookup(
        &self,
        accession: &RunAccession,
        provider: Provider,
        location: &str,
    ) -> Result<CandidateLocation, KiraError> {
        let response = self
            .client
            .post(&self.sdl_url)
            .form(&[
                ("acc", accession.as_str()),
                ("location", location),
                ("accept-alternate-locations", "yes"),
            ])
            .send()
            .map_err(|err| Self::unavailable(provider, err.to_string()))?;
        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Self::unavailable(provider, format!("SDL returned {status}")));
        }
        let body = response
            .text()
            .map_err(|err| Self::unavailable(provider, err.to_string()))?;
        let service = match provider {
            Provider::GcpCloud => "gs",
            _ => "s3",
        };
        parse_sdl_response(&body, service, provider)?
            .ok_or_else(|| Self::not_found(provider, accession))
    }

    fn ena_lookup(
        &self,
        accession: &RunAccession,
        provider: Provider,
    ) -> Result<CandidateLocation, KiraError> {
        let response = self
            .client
            .get(&self.ena_url)
            .query(&[
                ("accession", accession.as_str()),
                ("result", "read_run"),
                ("fields", "run_accession,fastq_ftp,fastq_aspera,fastq_md5,fastq_bytes"),
            ])
            .send()
            .map_err(|err| Self::unavailable(provider, err.to_string()))?;
        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Self::unavailable(provider, format!("ENA returned {status}")));
        }
        if !status.is_success() {
            return Err(Self::not_found(provider, accession));
        }
        let body = response
            .text()
            .map_err(|err| Self::unavailable(provider, err.to_string()))?;
        let files = parse_ena_filereport(&body, provider);
        if files.is_empty() {
            return Err(Self::not_found(provider, accession));
        }
        Ok(CandidateLocation {
            provider,
            files,
            cost_tier: CostTier::Free,
        })
    }
}

impl LocationResolver for HttpLocationResolver {
    fn resolve(
        &self,
        accession: &RunAccession,
        provider: Provider,
    ) -> Result<CandidateLocation, KiraError> {
        tracing::debug!(accession = %accession, provider = %provider, "resolving location");
        match provider {
            Provider::AwsOpenData => {
                if !self.odp_has_run(accession, provider)? {
                    return Err(Self::not_found(provider, accession));
                }
                Ok(CandidateLocation {
                    provider,
                    files: vec![RemoteFile::new(format!(
                        "{}/{}",
                        self.odp_base,
                        Self::odp_key(accession)
                    ))],
                    cost_tier: CostTier::Free,
                })
            }
            Provider::AwsCloud => {
                if self.odp_has_run(accession, provider)? {
                    return Ok(CandidateLocation {
                        provider,
                        files: vec![RemoteFile::new(format!(
                            "s3://{ODP_BUCKET}/{}",
                            Self::odp_key(accession)
                        ))],
                        cost_tier: CostTier::Free,
                    });
                }
                self.sdl_lookup(accession, provider, SDL_S3_LOCATION)
            }
            Provider::GcpCloud => self.sdl_lookup(accession, provider, SDL_GS_LOCATION),
            // prefetch resolves the run itself
            Provider::NcbiToolkit => Ok(CandidateLocation {
                provider,
                files: vec![RemoteFile::new(accession.as_str())],
                cost_tier: CostTier::Free,
            }),
            Provider::EnaFtp | Provider::EnaAspera => self.ena_lookup(accession, provider),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SdlResponse {
    #[serde(default)]
    result: Vec<SdlBundle>,
}

#[derive(Debug, Deserialize)]
struct SdlBundle {
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    files: Vec<SdlFile>,
}

#[derive(Debug, Deserialize)]
struct SdlFile {
    #[serde(rename = "type", default)]
    file_type: Option<String>,
    #[serde(default)]
    md5: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    locations: Vec<SdlLocation>,
}

#[derive(Debug, Deserialize)]
struct SdlLocation {
    #[serde(default)]
    service: Option<String>,
    #[serde(default)]
    bucket: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(rename = "payRequired", default)]
    pay_required: bool,
}

/// Picks the `.sra` object hosted on `service` ("s3" or "gs") from an SDL
/// response. `Ok(None)` means the run is not hosted there.
pub fn parse_sdl_response(
    body: &str,
    service: &str,
    provider: Provider,
) -> Result<Option<CandidateLocation>, KiraError> {
    let response: SdlResponse =
        serde_json::from_str(body).map_err(|err| KiraError::ResolutionUnavailable {
            provider: provider.to_string(),
            message: format!("unexpected SDL response: {err}"),
        })?;
    for bundle in response.result {
        match bundle.status {
            Some(200) | None => {}
            Some(404) => continue,
            Some(status) if status >= 500 => {
                return Err(KiraError::ResolutionUnavailable {
                    provider: provider.to_string(),
                    message: bundle
                        .msg
                        .unwrap_or_else(|| format!("SDL bundle status {status}")),
                });
            }
            Some(_) => continue,
        }
        for file in bundle.files {
            if file.file_type.as_deref().is_some_and(|kind| kind != "sra") {
                continue;
            }
            let hosted = file.locations.iter().find_map(|loc| {
                match (loc.service.as_deref(), &loc.bucket, &loc.key) {
                    (Some(svc), Some(bucket), Some(key)) if svc == service => {
                        Some((loc, bucket, key))
                    }
                    _ => None,
                }
            });
            if let Some((location, bucket, key)) = hosted {
                return Ok(Some(CandidateLocation {
                    provider,
                    files: vec![RemoteFile {
                        locator: format!("{service}://{bucket}/{key}"),
                        md5: file.md5.clone(),
                        size: file.size,
                    }],
                    cost_tier: if location.pay_required {
                        CostTier::Paid
                    } else {
                        CostTier::Free
                    },
                }));
            }
        }
    }
    Ok(None)
}

/// Reads the TSV returned by the ENA portal `filereport` endpoint.
pub fn parse_ena_filereport(body: &str, provider: Provider) -> Vec<RemoteFile> {
    let mut lines = body.lines().filter(|line| !line.trim().is_empty());
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let columns: Vec<&str> = header.split('\t').map(str::trim).collect();
    let column = |name: &str| columns.iter().position(|col| *col == name);
    let locator_column = match provider {
        Provider::EnaAspera => column("fastq_aspera"),
        _ => column("fastq_ftp"),
    };
    let Some(locator_column) = locator_column else {
        return Vec::new();
    };
    let md5_column = column("fastq_md5");
    let bytes_column = column("fastq_bytes");

    let Some(row) = lines.next() else {
        return Vec::new();
    };
    let fields: Vec<&str> = row.split('\t').collect();
    let split = |index: Option<usize>| -> Vec<String> {
        index
            .and_then(|index| fields.get(index))
            .map(|value| {
                value
                    .split(';')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };
    let locators = split(Some(locator_column));
    let md5s = split(md5_column);
    let sizes = split(bytes_column);
    locators
        .into_iter()
        .enumerate()
        .map(|(index, locator)| RemoteFile {
            locator,
            md5: md5s.get(index).cloned(),
            size: sizes.get(index).and_then(|value| value.parse().ok()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILEREPORT: &str = "run_accession\tfastq_ftp\tfastq_aspera\tfastq_md5\tfastq_bytes\n\
SRR12118866\tftp.sra.ebi.ac.uk/vol1/fastq/SRR121/066/SRR12118866/SRR12118866_1.fastq.gz;ftp.sra.ebi.ac.uk/vol1/fastq/SRR121/066/SRR12118866/SRR12118866_2.fastq.gz\tfasp.sra.ebi.ac.uk:/vol1/fastq/SRR121/066/SRR12118866/SRR12118866_1.fastq.gz;fasp.sra.ebi.ac.uk:/vol1/fastq/SRR121/066/SRR12118866/SRR12118866_2.fastq.gz\taaa;bbb\t4117481;4945891\n";

    #[test]
    fn filereport_ftp_columns() {
        let files = parse_ena_filereport(FILEREPORT, Provider::EnaFtp);
        assert_eq!(files.len(), 2);
        assert!(files[0].locator.starts_with("ftp.sra.ebi.ac.uk/"));
        assert_eq!(files[1].md5.as_deref(), Some("bbb"));
        assert_eq!(files[0].size, Some(4117481));
        assert_eq!(files[1].file_name(), "SRR12118866_2.fastq.gz");
    }

    #[test]
    fn filereport_aspera_columns() {
        let files = parse_ena_filereport(FILEREPORT, Provider::EnaAspera);
        assert_eq!(files.len(), 2);
        assert!(files[0].locator.starts_with("fasp.sra.ebi.ac.uk:/vol1"));
    }

    #[test]
    fn filereport_without_fastq() {
        let body = "run_accession\tfastq_ftp\tfastq_aspera\tfastq_md5\tfastq_bytes\nSRR1\t\t\t\t\n";
        assert!(parse_ena_filereport(body, Provider::EnaFtp).is_empty());
        assert!(parse_ena_filereport("", Provider::EnaFtp).is_empty());
    }

    #[test]
    fn sdl_paid_location() {
        let body = r#"{"version":"2","result":[{"bundle":"SRR1","status":200,"msg":"ok",
            "files":[{"type":"sra","name":"SRR1","size":12,"md5":"abc",
            "locations":[{"service":"s3","region":"us-east-1","bucket":"sra-pub-src-1",
            "key":"SRR1/SRR1.1","payRequired":true}]}]}]}"#;
        let location = parse_sdl_response(body, "s3", Provider::AwsCloud)
            .unwrap()
            .unwrap();
        assert_eq!(location.cost_tier, CostTier::Paid);
        assert_eq!(location.files[0].locator, "s3://sra-pub-src-1/SRR1/SRR1.1");
        assert_eq!(location.files[0].md5.as_deref(), Some("abc"));

        assert!(parse_sdl_response(body, "gs", Provider::GcpCloud)
            .unwrap()
            .is_none());
    }

    #[test]
    fn sdl_missing_run() {
        let body = r#"{"version":"2","result":[{"bundle":"SRR1","status":404,"msg":"No data"}]}"#;
        assert!(parse_sdl_response(body, "s3", Provider::AwsCloud)
            .unwrap()
            .is_none());
    }
}
