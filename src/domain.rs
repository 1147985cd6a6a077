use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::KiraError;

fn run_accession_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[SED]RR[0-9]{6,}$").expect("valid run accession regex"))
}

/// Public run identifier such as `SRR12118866` or `ERR1739691`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunAccession(String);

impl RunAccession {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunAccession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunAccession {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        if !run_accession_regex().is_match(&normalized) {
            return Err(KiraError::InvalidRunAccession(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
pub enum OutputFormat {
    #[serde(rename = "sra")]
    #[value(name = "sra")]
    Sra,
    #[serde(rename = "fastq")]
    #[value(name = "fastq")]
    Fastq,
    #[serde(rename = "fastq.gz")]
    #[value(name = "fastq.gz")]
    FastqGz,
    #[serde(rename = "fasta")]
    #[value(name = "fasta")]
    Fasta,
    #[serde(rename = "fasta.gz")]
    #[value(name = "fasta.gz")]
    FastaGz,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Sra => "sra",
            OutputFormat::Fastq => "fastq",
            OutputFormat::FastqGz => "fastq.gz",
            OutputFormat::Fasta => "fasta",
            OutputFormat::FastaGz => "fasta.gz",
        }
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, OutputFormat::FastqGz | OutputFormat::FastaGz)
    }

    /// The plain variant a compressed format is derived from.
    pub fn uncompressed(self) -> OutputFormat {
        match self {
            OutputFormat::FastqGz => OutputFormat::Fastq,
            OutputFormat::FastaGz => OutputFormat::Fasta,
            other => other,
        }
    }

    pub fn is_fasta_family(self) -> bool {
        matches!(self, OutputFormat::Fasta | OutputFormat::FastaGz)
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sra" => Ok(OutputFormat::Sra),
            "fastq" => Ok(OutputFormat::Fastq),
            "fastq.gz" => Ok(OutputFormat::FastqGz),
            "fasta" => Ok(OutputFormat::Fasta),
            "fasta.gz" => Ok(OutputFormat::FastaGz),
            other => Err(KiraError::Format(format!("unknown output format: {other}"))),
        }
    }
}

/// The set of output formats requested for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatRequest(BTreeSet<OutputFormat>);

impl FormatRequest {
    pub fn new(formats: impl IntoIterator<Item = OutputFormat>) -> Result<Self, KiraError> {
        let formats: BTreeSet<OutputFormat> = formats.into_iter().collect();
        if formats.is_empty() {
            return Err(KiraError::Format(
                "at least one output format is required".to_string(),
            ));
        }
        if formats.contains(&OutputFormat::Sra) && formats.len() > 1 {
            return Err(KiraError::Format(
                "sra cannot be combined with formats that require extraction".to_string(),
            ));
        }
        Ok(Self(formats))
    }

    pub fn contains(&self, format: OutputFormat) -> bool {
        self.0.contains(&format)
    }

    pub fn iter(&self) -> impl Iterator<Item = OutputFormat> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_sra_only(&self) -> bool {
        self.0.len() == 1 && self.contains(OutputFormat::Sra)
    }
}

impl Default for FormatRequest {
    fn default() -> Self {
        Self(BTreeSet::from([OutputFormat::FastqGz]))
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadMethod {
    AwsHttp,
    Prefetch,
    AwsCp,
    GcpCp,
    EnaAscp,
    EnaFtp,
}

impl DownloadMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadMethod::AwsHttp => "aws-http",
            DownloadMethod::Prefetch => "prefetch",
            DownloadMethod::AwsCp => "aws-cp",
            DownloadMethod::GcpCp => "gcp-cp",
            DownloadMethod::EnaAscp => "ena-ascp",
            DownloadMethod::EnaFtp => "ena-ftp",
        }
    }

    pub fn provider(self) -> Provider {
        match self {
            DownloadMethod::AwsHttp => Provider::AwsOpenData,
            DownloadMethod::Prefetch => Provider::NcbiToolkit,
            DownloadMethod::AwsCp => Provider::AwsCloud,
            DownloadMethod::GcpCp => Provider::GcpCloud,
            DownloadMethod::EnaAscp => Provider::EnaAspera,
            DownloadMethod::EnaFtp => Provider::EnaFtp,
        }
    }

    /// Cost tier known without any lookup. `None` means it depends on where
    /// the run is hosted.
    pub fn static_cost_tier(self) -> Option<CostTier> {
        match self {
            DownloadMethod::GcpCp => Some(CostTier::Paid),
            DownloadMethod::AwsCp => None,
            _ => Some(CostTier::Free),
        }
    }

    pub fn delivers(self) -> ArchiveKind {
        match self {
            DownloadMethod::EnaAscp | DownloadMethod::EnaFtp => ArchiveKind::PresplitFastqGz,
            _ => ArchiveKind::Sra,
        }
    }
}

impl fmt::Display for DownloadMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadMethod {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "aws-http" => Ok(DownloadMethod::AwsHttp),
            "prefetch" => Ok(DownloadMethod::Prefetch),
            "aws-cp" => Ok(DownloadMethod::AwsCp),
            "gcp-cp" => Ok(DownloadMethod::GcpCp),
            "ena-ascp" => Ok(DownloadMethod::EnaAscp),
            "ena-ftp" => Ok(DownloadMethod::EnaFtp),
            other => Err(KiraError::InvalidConfig(format!(
                "unknown download method: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    AwsOpenData,
    AwsCloud,
    GcpCloud,
    NcbiToolkit,
    EnaFtp,
    EnaAspera,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::AwsOpenData => "aws-open-data",
            Provider::AwsCloud => "aws-s3",
            Provider::GcpCloud => "gcp-gs",
            Provider::NcbiToolkit => "ncbi-toolkit",
            Provider::EnaFtp => "ena-ftp",
            Provider::EnaAspera => "ena-aspera",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CostTier {
    Free,
    Paid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveKind {
    /// A single `.sra` container that can be streamed read by read.
    Sra,
    /// Gzipped FASTQ files already split by mate, as served by ENA.
    PresplitFastqGz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionRole {
    Forward,
    Reverse,
    Unpaired,
}

impl PartitionRole {
    pub const ALL: [PartitionRole; 3] = [
        PartitionRole::Forward,
        PartitionRole::Reverse,
        PartitionRole::Unpaired,
    ];

    pub fn file_suffix(self) -> &'static str {
        match self {
            PartitionRole::Forward => "_1",
            PartitionRole::Reverse => "_2",
            PartitionRole::Unpaired => "",
        }
    }

    /// Role implied by a file name such as `SRR1_2.fastq.gz`.
    pub fn from_file_name(stem: &str, file_name: &str) -> Option<PartitionRole> {
        let rest = file_name.strip_prefix(stem)?;
        if rest.starts_with("_1.") {
            Some(PartitionRole::Forward)
        } else if rest.starts_with("_2.") {
            Some(PartitionRole::Reverse)
        } else if rest.starts_with('.') {
            Some(PartitionRole::Unpaired)
        } else {
            None
        }
    }
}

impl fmt::Display for PartitionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionRole::Forward => write!(f, "forward"),
            PartitionRole::Reverse => write!(f, "reverse"),
            PartitionRole::Unpaired => write!(f, "unpaired"),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_run_accession() {
        let acc: RunAccession = " srr12118866 ".parse().unwrap();
        assert_eq!(acc.as_str(), "SRR12118866");
        let err = "GSE102902".parse::<RunAccession>().unwrap_err();
        assert_matches!(err, KiraError::InvalidRunAccession(_));
    }

    #[test]
    fn sra_is_exclusive() {
        let err = FormatRequest::new([OutputFormat::Sra, OutputFormat::Fasta]).unwrap_err();
        assert_matches!(err, KiraError::Format(_));
        assert!(
            FormatRequest::new([OutputFormat::Sra])
                .unwrap()
                .is_sra_only()
        );
    }

    #[test]
    fn role_from_file_name() {
        assert_eq!(
            PartitionRole::from_file_name("SRR1", "SRR1_1.fastq.gz"),
            Some(PartitionRole::Forward)
        );
        assert_eq!(
            PartitionRole::from_file_name("SRR1", "SRR1.fastq.gz"),
            Some(PartitionRole::Unpaired)
        );
        assert_eq!(PartitionRole::from_file_name("SRR1", "SRR10.fastq"), None);
    }
}
