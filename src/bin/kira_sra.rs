use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_sra_fetch::app::{App, ArchiveConverter, ExtractRequest, ProgressSink, RunResult};
use kira_sra_fetch::config::{
    AwsCredentials, ConfigFile, ConfigLoader, Credentials, ExtractionOptions, GcpCredentials,
    PaidPolicy, RetryPolicy, RunConfig,
};
use kira_sra_fetch::container::SystemArchiveOpener;
use kira_sra_fetch::domain::{DownloadMethod, FormatRequest, OutputFormat, RunAccession};
use kira_sra_fetch::error::KiraError;
use kira_sra_fetch::output::{HumanSummary, JsonOutput, TracingProgress};
use kira_sra_fetch::resolver::HttpLocationResolver;
use kira_sra_fetch::transport::SystemTransport;

#[derive(Parser)]
#[command(name = "kira-sra")]
#[command(about = "Download public sequencing runs from SRA/ENA and convert them to FASTQ/FASTA")]
#[command(version, author)]
struct Cli {
    /// Verbose logging (overridden by RUST_LOG)
    #[arg(long, global = true)]
    debug: bool,

    /// Only log errors (overridden by RUST_LOG)
    #[arg(long, global = true, conflicts_with = "debug")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download a run and extract the requested formats")]
    Get(GetArgs),
    #[command(about = "Extract reads from a local .sra archive or interleaved FASTQ")]
    Extract(ExtractArgs),
}

#[derive(Args, Clone)]
struct OutputArgs {
    /// Output formats to produce [default: fastq.gz]
    #[arg(
        short = 'f',
        long = "output-format-possibilities",
        visible_alias = "output_format_possibilities",
        num_args = 1..,
        value_enum
    )]
    formats: Vec<OutputFormat>,

    #[arg(long = "output-directory", visible_alias = "output_directory", default_value = ".")]
    output_directory: Utf8PathBuf,

    /// Regenerate outputs even if they already exist
    #[arg(long)]
    force: bool,

    /// Emit reads in archive order to a single stream (requires --stdout)
    #[arg(long)]
    unsorted: bool,

    /// Write the single stream to stdout (requires --unsorted)
    #[arg(long)]
    stdout: bool,

    /// Print the run summary as JSON
    #[arg(long, conflicts_with = "stdout")]
    json: bool,
}

#[derive(Args, Clone)]
struct GetArgs {
    #[arg(short = 'r', long = "run-identifier", visible_alias = "run_identifier")]
    run_identifier: String,

    /// Methods to try, in order
    #[arg(
        short = 'm',
        long = "download-methods",
        visible_alias = "download_methods",
        num_args = 1..,
        value_enum
    )]
    download_methods: Vec<DownloadMethod>,

    #[command(flatten)]
    output: OutputArgs,

    /// JSON file with defaults for any of these options
    #[arg(long)]
    config: Option<String>,

    #[arg(long = "gcp-project", visible_alias = "gcp_project")]
    gcp_project: Option<String>,

    #[arg(long = "gcp-user-key-file", visible_alias = "gcp_user_key_file")]
    gcp_user_key_file: Option<PathBuf>,

    #[arg(
        long = "aws-user-key-id",
        visible_alias = "aws_user_key_id",
        requires = "aws_user_key_secret"
    )]
    aws_user_key_id: Option<String>,

    #[arg(
        long = "aws-user-key-secret",
        visible_alias = "aws_user_key_secret",
        requires = "aws_user_key_id"
    )]
    aws_user_key_secret: Option<String>,

    /// Allow requester-pays access on both AWS and GCP
    #[arg(long = "allow-paid", visible_alias = "allow_paid")]
    allow_paid: bool,

    #[arg(long = "allow-paid-from-gcp", visible_alias = "allow_paid_from_gcp")]
    allow_paid_from_gcp: bool,

    #[arg(long = "allow-paid-from-aws", visible_alias = "allow_paid_from_aws")]
    allow_paid_from_aws: bool,

    /// 'linux', 'osx' or a path to the Aspera private key
    #[arg(long = "ascp-ssh-key", visible_alias = "ascp_ssh_key")]
    ascp_ssh_key: Option<String>,

    /// Extra arguments passed to ascp, e.g. '-k 2'
    #[arg(long = "ascp-args", visible_alias = "ascp_args", allow_hyphen_values = true)]
    ascp_args: Option<String>,

    /// Per-attempt timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Tries per method for transient failures
    #[arg(long)]
    retries: Option<usize>,
}

#[derive(Args, Clone)]
struct ExtractArgs {
    /// Local .sra archive or interleaved FASTQ dump
    #[arg(long)]
    sra: PathBuf,

    #[command(flatten)]
    output: OutputArgs,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(kira) = report.downcast_ref::<KiraError>() {
            return ExitCode::from(map_exit_code(kira));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::InvalidRunAccession(_)
        | KiraError::InvalidConfig(_)
        | KiraError::ConfigRead(_)
        | KiraError::ConfigParse(_)
        | KiraError::Format(_)
        | KiraError::Policy(_) => 2,
        KiraError::ResolutionNotFound { .. }
        | KiraError::ResolutionUnavailable { .. }
        | KiraError::Download { .. }
        | KiraError::AttemptTimedOut(_)
        | KiraError::OrchestratorExhausted { .. }
        | KiraError::MissingTool(_) => 3,
        KiraError::Extraction(_) => 4,
        KiraError::Filesystem(_) => 1,
    }
}

fn init_logging(debug: bool, quiet: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if debug {
            "debug"
        } else if quiet {
            "error"
        } else {
            "info"
        })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.quiet);

    let opener = SystemArchiveOpener::new();
    match cli.command {
        Commands::Get(args) => {
            let file = match &args.config {
                Some(path) => ConfigLoader::load(path)?,
                None => ConfigFile::default(),
            };
            let config = build_run_config(&args, file)?;
            let resolver = HttpLocationResolver::new()?;
            let transport = SystemTransport::new()?;
            let app = App::new(resolver, transport, opener);
            let json = args.output.json;
            let result = with_stream(json, |sink, stream| app.get(&config, sink, stream))?;
            report(&result, json)
        }
        Commands::Extract(args) => {
            let request = ExtractRequest {
                archive: args.sra.clone(),
                output_dir: args.output.output_directory.clone(),
                extraction: extraction_options(&args.output, Vec::new())?,
            };
            let converter = ArchiveConverter::new(opener);
            let json = args.output.json;
            let result =
                with_stream(json, |sink, stream| converter.extract(&request, sink, stream))?;
            report(&result, json)
        }
    }
}

fn with_stream<F>(json: bool, run: F) -> Result<RunResult, KiraError>
where
    F: FnOnce(&dyn ProgressSink, &mut dyn io::Write) -> Result<RunResult, KiraError>,
{
    let stdout = io::stdout();
    let mut stream = stdout.lock();
    if json {
        run(&JsonOutput, &mut stream)
    } else {
        run(&TracingProgress, &mut stream)
    }
}

fn report(result: &RunResult, json: bool) -> miette::Result<()> {
    if json {
        JsonOutput::print_run(result).into_diagnostic()
    } else {
        HumanSummary::print(result).into_diagnostic()
    }
}

fn extraction_options(
    output: &OutputArgs,
    fallback_formats: Vec<OutputFormat>,
) -> Result<ExtractionOptions, KiraError> {
    let formats = if !output.formats.is_empty() {
        FormatRequest::new(output.formats.iter().copied())?
    } else if !fallback_formats.is_empty() {
        FormatRequest::new(fallback_formats)?
    } else {
        FormatRequest::default()
    };
    let options = ExtractionOptions {
        formats,
        force: output.force,
        unsorted: output.unsorted,
        stdout: output.stdout,
    };
    options.validate()?;
    Ok(options)
}

/// CLI flags win over the config file.
fn build_run_config(args: &GetArgs, file: ConfigFile) -> Result<RunConfig, KiraError> {
    let accession: RunAccession = args.run_identifier.parse()?;
    let methods = if args.download_methods.is_empty() {
        file.download_methods
    } else {
        args.download_methods.clone()
    };

    let aws = match (
        args.aws_user_key_id.clone().or(file.aws_user_key_id),
        args.aws_user_key_secret.clone().or(file.aws_user_key_secret),
    ) {
        (Some(key_id), Some(secret)) => Some(AwsCredentials { key_id, secret }),
        (None, None) => None,
        _ => {
            return Err(KiraError::InvalidConfig(
                "AWS key id and secret must be given together".to_string(),
            ));
        }
    };
    let aspera_key = match args.ascp_ssh_key.as_ref().or(file.ascp_ssh_key.as_ref()) {
        Some(value) => value.parse()?,
        None => Default::default(),
    };
    let ascp_args = args
        .ascp_args
        .as_ref()
        .or(file.ascp_args.as_ref())
        .map(|value| value.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();

    let mut config = RunConfig::new(accession, methods);
    config.extraction = extraction_options(&args.output, file.output_formats)?;
    config.output_dir = args.output.output_directory.clone();
    config.policy = PaidPolicy::from_flags(
        args.allow_paid || file.allow_paid,
        args.allow_paid_from_aws || file.allow_paid_from_aws,
        args.allow_paid_from_gcp || file.allow_paid_from_gcp,
    );
    config.credentials = Credentials {
        aws,
        gcp: GcpCredentials {
            project: args.gcp_project.clone().or(file.gcp_project),
            key_file: args.gcp_user_key_file.clone().or(file.gcp_user_key_file),
        },
        aspera_key,
        ascp_args,
    };
    if let Some(secs) = args.timeout.or(file.attempt_timeout_secs) {
        config.attempt_timeout = Duration::from_secs(secs);
    }
    if let Some(retries) = args.retries.or(file.retries) {
        config.retry = RetryPolicy {
            max_attempts: retries,
            ..RetryPolicy::default()
        };
    }
    config.validate()?;
    Ok(config)
}
