use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{
    ArchiveKind, CostTier, DownloadMethod, FormatRequest, OutputFormat, Provider, RunAccession,
};
use crate::error::KiraError;

pub const DEFAULT_LINUX_ASPERA_SSH_KEY: &str = ".aspera/connect/etc/asperaweb_id_dsa.openssh";
pub const DEFAULT_OSX_ASPERA_SSH_KEY: &str =
    "Applications/Aspera Connect.app/Contents/Resources/asperaweb_id_dsa.openssh";
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Optional JSON file with defaults for `get`. Command line flags win.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub download_methods: Vec<DownloadMethod>,
    #[serde(default)]
    pub output_formats: Vec<OutputFormat>,
    #[serde(default)]
    pub gcp_project: Option<String>,
    #[serde(default)]
    pub gcp_user_key_file: Option<PathBuf>,
    #[serde(default)]
    pub aws_user_key_id: Option<String>,
    #[serde(default)]
    pub aws_user_key_secret: Option<String>,
    #[serde(default)]
    pub allow_paid: bool,
    #[serde(default)]
    pub allow_paid_from_aws: bool,
    #[serde(default)]
    pub allow_paid_from_gcp: bool,
    #[serde(default)]
    pub ascp_ssh_key: Option<String>,
    #[serde(default)]
    pub ascp_args: Option<String>,
    #[serde(default)]
    pub attempt_timeout_secs: Option<u64>,
    #[serde(default)]
    pub retries: Option<usize>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load(path: &str) -> Result<ConfigFile, KiraError> {
        let config_path = PathBuf::from(path);
        let content = fs::read_to_string(&config_path)
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<ConfigFile, KiraError> {
        let config: ConfigFile =
            serde_json::from_str(content).map_err(|err| KiraError::ConfigParse(err.to_string()))?;
        if let Some(version) = config.schema_version
            && version != 1
        {
            return Err(KiraError::ConfigParse(format!(
                "unsupported schema_version {version}"
            )));
        }
        Ok(config)
    }
}

/// Opt-in flags for requester-pays cloud buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaidPolicy {
    pub allow_paid_aws: bool,
    pub allow_paid_gcp: bool,
}

impl PaidPolicy {
    pub fn from_flags(allow_paid: bool, from_aws: bool, from_gcp: bool) -> Self {
        Self {
            allow_paid_aws: allow_paid || from_aws,
            allow_paid_gcp: allow_paid || from_gcp,
        }
    }

    pub fn allows(&self, provider: Provider, tier: CostTier) -> bool {
        match tier {
            CostTier::Free => true,
            CostTier::Paid => match provider {
                Provider::AwsCloud => self.allow_paid_aws,
                Provider::GcpCloud => self.allow_paid_gcp,
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsCredentials {
    pub key_id: String,
    pub secret: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcpCredentials {
    pub project: Option<String>,
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AsperaKey {
    #[default]
    Linux,
    Osx,
    Path(PathBuf),
}

impl AsperaKey {
    pub fn resolve(&self) -> Result<PathBuf, KiraError> {
        let relative = match self {
            AsperaKey::Path(path) => return Ok(path.clone()),
            AsperaKey::Linux => DEFAULT_LINUX_ASPERA_SSH_KEY,
            AsperaKey::Osx => DEFAULT_OSX_ASPERA_SSH_KEY,
        };
        BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(relative))
            .ok_or_else(|| KiraError::InvalidConfig("unable to resolve home directory".to_string()))
    }
}

impl FromStr for AsperaKey {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "" => Err(KiraError::InvalidConfig("empty aspera key path".to_string())),
            "linux" => Ok(AsperaKey::Linux),
            "osx" => Ok(AsperaKey::Osx),
            other => Ok(AsperaKey::Path(PathBuf::from(other))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub aws: Option<AwsCredentials>,
    pub gcp: GcpCredentials,
    pub aspera_key: AsperaKey,
    pub ascp_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: usize) -> Duration {
        self.base_delay * attempt as u32
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

/// Extraction settings shared by `get` and `extract`.
#[derive(Debug, Clone, Default)]
pub struct ExtractionOptions {
    pub formats: FormatRequest,
    pub force: bool,
    pub unsorted: bool,
    pub stdout: bool,
}

impl ExtractionOptions {
    pub fn validate(&self) -> Result<(), KiraError> {
        if self.stdout && !self.unsorted {
            return Err(KiraError::Format(
                "--stdout currently requires --unsorted".to_string(),
            ));
        }
        if self.unsorted {
            if !self.stdout {
                return Err(KiraError::Format(
                    "--unsorted requires --stdout".to_string(),
                ));
            }
            if self.formats.len() != 1 || !self.formats.iter().all(OutputFormat::is_fasta_family) {
                return Err(KiraError::Format(
                    "--unsorted requires exactly one of fasta or fasta.gz".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn stream_format(&self) -> Option<OutputFormat> {
        if self.unsorted && self.stdout {
            self.formats.iter().next()
        } else {
            None
        }
    }
}

/// Everything one `get` run needs. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub accession: RunAccession,
    pub methods: Vec<DownloadMethod>,
    pub extraction: ExtractionOptions,
    pub policy: PaidPolicy,
    pub credentials: Credentials,
    pub output_dir: Utf8PathBuf,
    pub attempt_timeout: Duration,
    pub retry: RetryPolicy,
}

impl RunConfig {
    pub fn new(accession: RunAccession, methods: Vec<DownloadMethod>) -> Self {
        Self {
            accession,
            methods,
            extraction: ExtractionOptions::default(),
            policy: PaidPolicy::default(),
            credentials: Credentials::default(),
            output_dir: Utf8PathBuf::from("."),
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    /// Fail-fast checks that run before any network or process activity.
    pub fn validate(&self) -> Result<(), KiraError> {
        if self.methods.is_empty() {
            return Err(KiraError::InvalidConfig(
                "at least one download method is required".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(KiraError::InvalidConfig(
                "retry count must be at least 1".to_string(),
            ));
        }
        self.extraction.validate()?;

        let any_sra = self
            .methods
            .iter()
            .any(|method| method.delivers() == ArchiveKind::Sra);
        if self.requires_sra_archive() && !any_sra {
            let reason = if self.extraction.unsorted {
                "--unsorted needs a streaming archive, which ENA methods do not provide"
            } else {
                "sra output needs an .sra archive, which ENA methods do not provide"
            };
            return Err(KiraError::Format(reason.to_string()));
        }
        Ok(())
    }

    /// Whether only an `.sra` archive can satisfy this run.
    pub fn requires_sra_archive(&self) -> bool {
        self.extraction.unsorted || self.extraction.formats.is_sra_only()
    }

    /// Methods in caller order with repeats dropped.
    pub fn ordered_methods(&self) -> Vec<DownloadMethod> {
        let mut seen = Vec::new();
        for method in &self.methods {
            if !seen.contains(method) {
                seen.push(*method);
            }
        }
        seen
    }
}
