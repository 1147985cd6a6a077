use std::io::{self, Write};

use serde::Serialize;

use crate::app::{ProgressEvent, ProgressSink, RunResult};
use crate::orchestrator::DownloadOutcome;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_run(result: &RunResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Plain-text run summary. Goes to stderr so a stream on stdout stays clean.
pub struct HumanSummary;

impl HumanSummary {
    pub fn render(result: &RunResult) -> String {
        let mut lines = Vec::new();
        for attempt in &result.attempts {
            let mut line = format!("  {:<9} {}", attempt.method.as_str(), attempt.outcome.as_str());
            if attempt.outcome != DownloadOutcome::Success
                && let Some(reason) = &attempt.reason
            {
                line.push_str(&format!(": {reason}"));
            }
            lines.push(line);
        }
        if !lines.is_empty() {
            lines.insert(0, "download attempts:".to_string());
        }
        if let Some(records) = result.streamed_records {
            lines.push(format!("streamed {records} reads of {}", result.stem));
        }
        if !result.outputs.is_empty() {
            lines.push(format!("outputs for {}:", result.stem));
            for file in &result.outputs {
                let reused = if result.reused.contains(file) {
                    " (existing)"
                } else {
                    ""
                };
                lines.push(format!("  {} [{}, {}]{reused}", file.path, file.format, file.role));
            }
        } else if result.streamed_records.is_none() {
            lines.push(format!("no outputs produced for {}", result.stem));
        }
        lines.join("\n")
    }

    pub fn print(result: &RunResult) -> io::Result<()> {
        let mut stderr = io::stderr();
        writeln!(stderr, "{}", Self::render(result))
    }
}

/// Forwards progress events to the log.
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => {
                tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message)
            }
            None => tracing::info!("{}", event.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;
    use crate::domain::{DownloadMethod, OutputFormat, PartitionRole};
    use crate::orchestrator::DownloadAttempt;
    use crate::store::OutputFile;

    #[test]
    fn summary_lists_attempts_and_outputs() {
        let file = OutputFile {
            path: Utf8PathBuf::from("out/SRR1_1.fastq.gz"),
            format: OutputFormat::FastqGz,
            role: PartitionRole::Forward,
            compressed: true,
        };
        let result = RunResult {
            stem: "SRR1".to_string(),
            method: Some(DownloadMethod::EnaFtp),
            attempts: vec![
                DownloadAttempt {
                    method: DownloadMethod::GcpCp,
                    outcome: DownloadOutcome::PolicyBlocked,
                    tries: 0,
                    reason: Some("paid".to_string()),
                    local_paths: Vec::new(),
                },
                DownloadAttempt {
                    method: DownloadMethod::EnaFtp,
                    outcome: DownloadOutcome::Success,
                    tries: 1,
                    reason: None,
                    local_paths: Vec::new(),
                },
            ],
            outputs: vec![file],
            reused: Vec::new(),
            partitions: Vec::new(),
            streamed_records: None,
            completed_at: "2026-01-01T00:00:00+00:00".to_string(),
        };
        let text = HumanSummary::render(&result);
        assert!(text.contains("gcp-cp    policy-blocked: paid"));
        assert!(text.contains("ena-ftp   success"));
        assert!(text.contains("out/SRR1_1.fastq.gz [fastq.gz, forward]"));
    }
}
