//! Ordered fallback over download methods.
//!
//! Methods run strictly in caller order and the first success ends the run.
//! Each method gets its own bounded retry budget for transient failures.
//! Paid locations are gated before the transport is invoked.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde::Serialize;

use crate::config::{PaidPolicy, RetryPolicy};
use crate::container::LocalArchive;
use crate::domain::{ArchiveKind, DownloadMethod, RunAccession};
use crate::error::KiraError;
use crate::resolver::LocationResolver;
use crate::transport::{AttemptContext, AttemptOutcome, Transport, TransportMethod};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
    PolicyBlocked,
}

impl DownloadOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadOutcome::Success => "success",
            DownloadOutcome::TransientFailure => "transient-failure",
            DownloadOutcome::PermanentFailure => "permanent-failure",
            DownloadOutcome::PolicyBlocked => "policy-blocked",
        }
    }
}

/// What happened to one method. `tries` counts transport or resolver calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadAttempt {
    pub method: DownloadMethod,
    pub outcome: DownloadOutcome,
    pub tries: usize,
    pub reason: Option<String>,
    pub local_paths: Vec<PathBuf>,
}

impl DownloadAttempt {
    fn failed(
        method: DownloadMethod,
        outcome: DownloadOutcome,
        tries: usize,
        reason: String,
    ) -> Self {
        Self {
            method,
            outcome,
            tries,
            reason: Some(reason),
            local_paths: Vec::new(),
        }
    }
}

pub fn describe_attempts(attempts: &[DownloadAttempt]) -> String {
    if attempts.is_empty() {
        return "no methods attempted".to_string();
    }
    attempts
        .iter()
        .map(|attempt| match &attempt.reason {
            Some(reason) => format!(
                "{} {} ({reason})",
                attempt.method,
                attempt.outcome.as_str()
            ),
            None => format!("{} {}", attempt.method, attempt.outcome.as_str()),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

pub struct FetchRequest<'a> {
    pub accession: &'a RunAccession,
    pub methods: &'a [TransportMethod],
    pub policy: PaidPolicy,
    /// Only an `.sra` archive is acceptable; presplit deliveries are skipped.
    pub require_sra: bool,
    pub work_dir: &'a Path,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

#[derive(Debug)]
pub struct FetchResult {
    pub archive: LocalArchive,
    pub method: DownloadMethod,
    pub attempts: Vec<DownloadAttempt>,
}

pub struct Orchestrator<R, T> {
    resolver: R,
    transport: T,
}

enum MethodResult {
    Done(LocalArchive, usize),
    Failed(DownloadAttempt),
}

impl<R: LocationResolver, T: Transport> Orchestrator<R, T> {
    pub fn new(resolver: R, transport: T) -> Self {
        Self {
            resolver,
            transport,
        }
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchResult, KiraError> {
        let mut attempts = Vec::with_capacity(request.methods.len());
        for method in request.methods {
            let kind = method.kind();
            tracing::info!(
                method = %kind,
                accession = %request.accession,
                "trying download method"
            );
            match self.run_method(method, request) {
                MethodResult::Done(archive, tries) => {
                    tracing::info!(method = %kind, tries, "download succeeded");
                    attempts.push(DownloadAttempt {
                        method: kind,
                        outcome: DownloadOutcome::Success,
                        tries,
                        reason: None,
                        local_paths: archive.paths().into_iter().map(Path::to_path_buf).collect(),
                    });
                    return Ok(FetchResult {
                        archive,
                        method: kind,
                        attempts,
                    });
                }
                MethodResult::Failed(attempt) => {
                    tracing::warn!(
                        method = %kind,
                        outcome = attempt.outcome.as_str(),
                        reason = attempt.reason.as_deref().unwrap_or(""),
                        "download method failed, moving on"
                    );
                    attempts.push(attempt);
                }
            }
        }

        let all_blocked = !attempts.is_empty()
            && attempts
                .iter()
                .all(|attempt| attempt.outcome == DownloadOutcome::PolicyBlocked);
        if all_blocked {
            return Err(KiraError::Policy(describe_attempts(&attempts)));
        }
        Err(KiraError::OrchestratorExhausted { attempts })
    }

    fn run_method(&self, method: &TransportMethod, request: &FetchRequest<'_>) -> MethodResult {
        let kind = method.kind();
        let provider = kind.provider();

        if request.require_sra && kind.delivers() != ArchiveKind::Sra {
            return MethodResult::Failed(DownloadAttempt::failed(
                kind,
                DownloadOutcome::PermanentFailure,
                0,
                "delivers pre-split FASTQ but an .sra archive is required".to_string(),
            ));
        }
        if let Some(tier) = kind.static_cost_tier()
            && !request.policy.allows(provider, tier)
        {
            return MethodResult::Failed(DownloadAttempt::failed(
                kind,
                DownloadOutcome::PolicyBlocked,
                0,
                format!("{kind} is requester-pays and paid access was not allowed"),
            ));
        }

        let mut last_reason = String::new();
        for attempt in 1..=request.retry.max_attempts {
            if attempt > 1 {
                let delay = request.retry.delay_for(attempt - 1);
                tracing::debug!(
                    method = %kind,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying"
                );
                thread::sleep(delay);
            }

            let location = match self.resolver.resolve(request.accession, provider) {
                Ok(location) => location,
                Err(err) if err.is_transient() => {
                    last_reason = err.to_string();
                    continue;
                }
                Err(err) => {
                    return MethodResult::Failed(DownloadAttempt::failed(
                        kind,
                        DownloadOutcome::PermanentFailure,
                        attempt,
                        err.to_string(),
                    ));
                }
            };
            if !request.policy.allows(provider, location.cost_tier) {
                return MethodResult::Failed(DownloadAttempt::failed(
                    kind,
                    DownloadOutcome::PolicyBlocked,
                    attempt,
                    format!("{provider} only hosts {} as requester-pays", request.accession),
                ));
            }

            let ctx = AttemptContext::new(request.accession, request.work_dir, request.timeout);
            match self.transport.attempt(method, &location, &ctx) {
                AttemptOutcome::Success(archive) => return MethodResult::Done(archive, attempt),
                AttemptOutcome::TransientFailure(reason) => last_reason = reason,
                AttemptOutcome::PermanentFailure(reason) => {
                    return MethodResult::Failed(DownloadAttempt::failed(
                        kind,
                        DownloadOutcome::PermanentFailure,
                        attempt,
                        reason,
                    ));
                }
                AttemptOutcome::TimedOut => {
                    return MethodResult::Failed(DownloadAttempt::failed(
                        kind,
                        DownloadOutcome::TransientFailure,
                        attempt,
                        format!("timed out after {}s", request.timeout.as_secs()),
                    ));
                }
            }
        }
        MethodResult::Failed(DownloadAttempt::failed(
            kind,
            DownloadOutcome::TransientFailure,
            request.retry.max_attempts,
            last_reason,
        ))
    }
}
