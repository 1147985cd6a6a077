use assert_matches::assert_matches;

use kira_sra_fetch::config::{ConfigLoader, ExtractionOptions, RunConfig};
use kira_sra_fetch::domain::{DownloadMethod, FormatRequest, OutputFormat};
use kira_sra_fetch::error::KiraError;

fn run(methods: Vec<DownloadMethod>, formats: &[OutputFormat]) -> RunConfig {
    let mut config = RunConfig::new("SRR12118866".parse().unwrap(), methods);
    config.extraction.formats = FormatRequest::new(formats.iter().copied()).unwrap();
    config
}

#[test]
fn parse_config_file() {
    let config = ConfigLoader::parse(
        r#"{
            "schema_version": 1,
            "download_methods": ["ena-ftp", "aws-http"],
            "output_formats": ["fasta.gz"],
            "allow_paid_from_gcp": true,
            "ascp_args": "-k 2",
            "retries": 5
        }"#,
    )
    .unwrap();
    assert_eq!(
        config.download_methods,
        vec![DownloadMethod::EnaFtp, DownloadMethod::AwsHttp]
    );
    assert_eq!(config.output_formats, vec![OutputFormat::FastaGz]);
    assert!(config.allow_paid_from_gcp);
    assert!(!config.allow_paid);
    assert_eq!(config.retries, Some(5));
}

#[test]
fn reject_unknown_schema_version() {
    let err = ConfigLoader::parse(r#"{"schema_version": 2}"#).unwrap_err();
    assert_matches!(err, KiraError::ConfigParse(_));
}

#[test]
fn reject_missing_config_file() {
    let err = ConfigLoader::load("/nonexistent/kira-sra.json").unwrap_err();
    assert_matches!(err, KiraError::ConfigRead(_));
}

#[test]
fn stdout_requires_unsorted() {
    let options = ExtractionOptions {
        formats: FormatRequest::new([OutputFormat::Fasta]).unwrap(),
        stdout: true,
        ..ExtractionOptions::default()
    };
    assert_matches!(options.validate(), Err(KiraError::Format(_)));
}

#[test]
fn unsorted_requires_single_fasta_format() {
    let mut options = ExtractionOptions {
        formats: FormatRequest::new([OutputFormat::Fastq]).unwrap(),
        unsorted: true,
        stdout: true,
        force: false,
    };
    assert_matches!(options.validate(), Err(KiraError::Format(_)));

    options.formats = FormatRequest::new([OutputFormat::Fasta, OutputFormat::FastaGz]).unwrap();
    assert_matches!(options.validate(), Err(KiraError::Format(_)));

    options.formats = FormatRequest::new([OutputFormat::FastaGz]).unwrap();
    assert!(options.validate().is_ok());
    assert_eq!(options.stream_format(), Some(OutputFormat::FastaGz));
}

#[test]
fn sra_output_needs_an_sra_method() {
    let config = run(vec![DownloadMethod::EnaFtp], &[OutputFormat::Sra]);
    assert_matches!(config.validate(), Err(KiraError::Format(_)));
    assert!(config.requires_sra_archive());

    let config = run(
        vec![DownloadMethod::EnaFtp, DownloadMethod::Prefetch],
        &[OutputFormat::Sra],
    );
    assert!(config.validate().is_ok());
}

#[test]
fn empty_methods_are_rejected() {
    let config = run(Vec::new(), &[OutputFormat::FastqGz]);
    assert_matches!(config.validate(), Err(KiraError::InvalidConfig(_)));
}
