//! One download attempt per call, reported as a typed outcome.
//!
//! The orchestrator never sees exit codes or HTTP statuses. Each method maps
//! its own failures onto `AttemptOutcome` so fallback stays deterministic.

pub mod aspera;
pub mod cloud;
pub mod http;
pub mod process;
pub mod toolkit;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::config::{AsperaKey, AwsCredentials, Credentials, GcpCredentials};
use crate::container::LocalArchive;
use crate::domain::{DownloadMethod, RunAccession};
use crate::error::KiraError;
use crate::resolver::CandidateLocation;
use crate::transport::process::ToolCommand;

/// Closed set of retrieval methods, each carrying what it needs to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMethod {
    AwsHttp,
    Prefetch,
    AwsCp {
        credentials: Option<AwsCredentials>,
    },
    GcpCp(GcpCredentials),
    EnaAscp {
        ssh_key: AsperaKey,
        extra_args: Vec<String>,
    },
    EnaFtp,
}

impl TransportMethod {
    pub fn from_config(method: DownloadMethod, credentials: &Credentials) -> Self {
        match method {
            DownloadMethod::AwsHttp => TransportMethod::AwsHttp,
            DownloadMethod::Prefetch => TransportMethod::Prefetch,
            DownloadMethod::AwsCp => TransportMethod::AwsCp {
                credentials: credentials.aws.clone(),
            },
            DownloadMethod::GcpCp => TransportMethod::GcpCp(credentials.gcp.clone()),
            DownloadMethod::EnaAscp => TransportMethod::EnaAscp {
                ssh_key: credentials.aspera_key.clone(),
                extra_args: credentials.ascp_args.clone(),
            },
            DownloadMethod::EnaFtp => TransportMethod::EnaFtp,
        }
    }

    pub fn kind(&self) -> DownloadMethod {
        match self {
            TransportMethod::AwsHttp => DownloadMethod::AwsHttp,
            TransportMethod::Prefetch => DownloadMethod::Prefetch,
            TransportMethod::AwsCp { .. } => DownloadMethod::AwsCp,
            TransportMethod::GcpCp(_) => DownloadMethod::GcpCp,
            TransportMethod::EnaAscp { .. } => DownloadMethod::EnaAscp,
            TransportMethod::EnaFtp => DownloadMethod::EnaFtp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success(LocalArchive),
    TransientFailure(String),
    PermanentFailure(String),
    TimedOut,
}

impl AttemptOutcome {
    pub fn from_result(result: Result<LocalArchive, KiraError>) -> Self {
        match result {
            Ok(archive) => AttemptOutcome::Success(archive),
            Err(KiraError::AttemptTimedOut(_)) => AttemptOutcome::TimedOut,
            Err(err) if err.is_transient() => AttemptOutcome::TransientFailure(err.to_string()),
            Err(err) => AttemptOutcome::PermanentFailure(err.to_string()),
        }
    }
}

/// Per-attempt inputs. `work_dir` is private to the run and removed with it.
/// `timeout` bounds the whole attempt, every sub-command and file included.
#[derive(Debug, Clone, Copy)]
pub struct AttemptContext<'a> {
    pub accession: &'a RunAccession,
    pub work_dir: &'a Path,
    pub timeout: Duration,
    deadline: Option<Instant>,
}

impl<'a> AttemptContext<'a> {
    /// Starts the attempt clock now.
    pub fn new(accession: &'a RunAccession, work_dir: &'a Path, timeout: Duration) -> Self {
        Self {
            accession,
            work_dir,
            timeout,
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn sra_destination(&self) -> PathBuf {
        self.work_dir.join(format!("{}.sra", self.accession.as_str()))
    }

    /// Time left before the attempt deadline.
    pub fn remaining(&self) -> Result<Duration, KiraError> {
        let Some(deadline) = self.deadline else {
            return Ok(self.timeout);
        };
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(KiraError::AttemptTimedOut(self.timeout.as_secs()));
        }
        Ok(left)
    }

    /// Runs `command` within what is left of the attempt budget.
    pub fn run_tool(&self, command: &ToolCommand) -> Result<String, KiraError> {
        command
            .run(self.remaining()?)
            .map_err(|err| match err {
                KiraError::AttemptTimedOut(_) => KiraError::AttemptTimedOut(self.timeout.as_secs()),
                other => other,
            })
    }
}

pub trait Transport: Send + Sync {
    fn attempt(
        &self,
        method: &TransportMethod,
        location: &CandidateLocation,
        ctx: &AttemptContext<'_>,
    ) -> AttemptOutcome;
}

#[derive(Debug, Clone, Default)]
pub struct ToolPaths {
    pub aws: Option<PathBuf>,
    pub gsutil: Option<PathBuf>,
    pub gcloud: Option<PathBuf>,
    pub prefetch: Option<PathBuf>,
    pub ascp: Option<PathBuf>,
}

impl ToolPaths {
    pub fn discover() -> Self {
        Self {
            aws: which::which("aws").ok(),
            gsutil: which::which("gsutil").ok(),
            gcloud: which::which("gcloud").ok(),
            prefetch: which::which("prefetch").ok(),
            ascp: which::which("ascp").ok(),
        }
    }
}

pub(crate) fn require_tool<'a>(
    tool: &'a Option<PathBuf>,
    name: &str,
) -> Result<&'a Path, KiraError> {
    tool.as_deref()
        .ok_or_else(|| KiraError::MissingTool(name.to_string()))
}

/// Real transports: HTTP in process, everything else through external tools.
pub struct SystemTransport {
    http: http::HttpDownloader,
    tools: ToolPaths,
}

impl SystemTransport {
    pub fn new() -> Result<Self, KiraError> {
        Ok(Self {
            http: http::HttpDownloader::new()?,
            tools: ToolPaths::discover(),
        })
    }

    pub fn with_tools(mut self, tools: ToolPaths) -> Self {
        self.tools = tools;
        self
    }

    fn run(
        &self,
        method: &TransportMethod,
        location: &CandidateLocation,
        ctx: &AttemptContext<'_>,
    ) -> Result<LocalArchive, KiraError> {
        match method {
            TransportMethod::AwsHttp => self.http.fetch_sra(location, ctx),
            TransportMethod::EnaFtp => self.http.fetch_presplit(location, ctx),
            TransportMethod::Prefetch => {
                toolkit::prefetch(require_tool(&self.tools.prefetch, "prefetch")?, ctx)
            }
            TransportMethod::AwsCp { credentials } => cloud::aws_cp(
                require_tool(&self.tools.aws, "aws")?,
                credentials.as_ref(),
                location,
                ctx,
            ),
            TransportMethod::GcpCp(credentials) => cloud::gcp_cp(
                require_tool(&self.tools.gsutil, "gsutil")?,
                self.tools.gcloud.as_deref(),
                credentials,
                location,
                ctx,
            ),
            TransportMethod::EnaAscp {
                ssh_key,
                extra_args,
            } => aspera::ascp(
                require_tool(&self.tools.ascp, "ascp")?,
                &ssh_key.resolve()?,
                extra_args,
                location,
                ctx,
            ),
        }
    }
}

impl Transport for SystemTransport {
    fn attempt(
        &self,
        method: &TransportMethod,
        location: &CandidateLocation,
        ctx: &AttemptContext<'_>,
    ) -> AttemptOutcome {
        AttemptOutcome::from_result(self.run(method, location, ctx))
    }
}
