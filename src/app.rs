use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::config::{ExtractionOptions, RunConfig};
use crate::container::{self, ArchiveOpener, LocalArchive, SequenceContainer};
use crate::domain::{DownloadMethod, OutputFormat, PartitionRole};
use crate::error::KiraError;
use crate::formats::{ArchiveInput, FormatPlan};
use crate::materialize::{self, MaterializeMode, Materialized};
use crate::orchestrator::{DownloadAttempt, FetchRequest, Orchestrator};
use crate::resolver::LocationResolver;
use crate::store::{OutputFile, OutputStore};
use crate::transport::{Transport, TransportMethod};

#[derive(Debug, Clone, Serialize)]
pub struct PartitionSummary {
    pub role: PartitionRole,
    pub records: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub stem: String,
    pub method: Option<DownloadMethod>,
    pub attempts: Vec<DownloadAttempt>,
    pub outputs: Vec<OutputFile>,
    pub reused: Vec<OutputFile>,
    pub partitions: Vec<PartitionSummary>,
    pub streamed_records: Option<u64>,
    pub completed_at: String,
}

impl RunResult {
    fn new(stem: &str) -> Self {
        Self {
            stem: stem.to_string(),
            method: None,
            attempts: Vec::new(),
            outputs: Vec::new(),
            reused: Vec::new(),
            partitions: Vec::new(),
            streamed_records: None,
            completed_at: String::new(),
        }
    }

    fn absorb(&mut self, materialized: Materialized) {
        match materialized {
            Materialized::Files(outcome) => {
                self.outputs = outcome.outputs;
                self.reused = outcome.reused;
                self.partitions = outcome
                    .partitions
                    .iter()
                    .map(|partition| PartitionSummary {
                        role: partition.role,
                        records: partition.records,
                    })
                    .collect();
            }
            Materialized::Streamed { records } => self.streamed_records = Some(records),
        }
    }

    fn complete(mut self) -> Self {
        self.completed_at = chrono::Utc::now().to_rfc3339();
        self
    }
}

/// Inputs of `extract`: a local archive instead of an accession.
#[derive(Debug, Clone)]
pub struct ExtractRequest {
    pub archive: PathBuf,
    pub output_dir: Utf8PathBuf,
    pub extraction: ExtractionOptions,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

fn phase(sink: &dyn ProgressSink, message: String) {
    sink.event(ProgressEvent {
        message,
        elapsed: None,
    });
}

pub struct App<R, T, O> {
    orchestrator: Orchestrator<R, T>,
    converter: ArchiveConverter<O>,
}

impl<R: LocationResolver, T: Transport, O: ArchiveOpener> App<R, T, O> {
    pub fn new(resolver: R, transport: T, opener: O) -> Self {
        Self {
            orchestrator: Orchestrator::new(resolver, transport),
            converter: ArchiveConverter::new(opener),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator<R, T> {
        &self.orchestrator
    }

    pub fn opener(&self) -> &O {
        self.converter.opener()
    }

    /// Download `config.accession` and produce the requested outputs. Stream
    /// mode writes reads to `stream` instead of files.
    pub fn get(
        &self,
        config: &RunConfig,
        sink: &dyn ProgressSink,
        stream: &mut dyn Write,
    ) -> Result<RunResult, KiraError> {
        let started = Instant::now();
        config.validate()?;
        let stem = config.accession.as_str();
        let store = OutputStore::new(config.output_dir.clone(), stem);
        let mode = MaterializeMode::from_options(&config.extraction);
        let plan = FormatPlan::new(&config.extraction.formats, &store, config.extraction.force);
        let mut result = RunResult::new(stem);

        phase(
            sink,
            format!("phase=Plan; {} format(s) for {stem}", config.extraction.formats.len()),
        );
        if mode == MaterializeMode::Partitioned && !plan.needs_archive() {
            if plan.is_satisfied() {
                tracing::info!(
                    accession = %config.accession,
                    "all requested outputs already present"
                );
            }
            phase(sink, "phase=Convert; deriving from existing outputs".to_string());
            let materialized = materialize::materialize(mode, &plan, &store, None, stream)?;
            result.absorb(materialized);
            return Ok(finish(result, sink, started));
        }

        let staging = store.staging_dir()?;
        let methods: Vec<TransportMethod> = config
            .ordered_methods()
            .into_iter()
            .map(|method| TransportMethod::from_config(method, &config.credentials))
            .collect();
        phase(
            sink,
            format!(
                "phase=Download; {}",
                methods
                    .iter()
                    .map(|method| method.kind().as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            ),
        );
        let fetched = self.orchestrator.fetch(&FetchRequest {
            accession: &config.accession,
            methods: &methods,
            policy: config.policy,
            require_sra: config.requires_sra_archive(),
            work_dir: staging.path(),
            timeout: config.attempt_timeout,
            retry: config.retry,
        })?;
        result.method = Some(fetched.method);
        result.attempts = fetched.attempts;

        let container = self
            .converter
            .open_if_needed(&fetched.archive, stem, mode, &plan)?;
        phase(sink, format!("phase=Extract; {}", describe_mode(mode)));
        let materialized = materialize::materialize(
            mode,
            &plan,
            &store,
            Some(ArchiveInput {
                archive: &fetched.archive,
                container: container.as_ref(),
                owned: true,
            }),
            stream,
        )?;
        result.absorb(materialized);
        drop(staging);
        Ok(finish(result, sink, started))
    }

    /// Convert an archive already on disk.
    pub fn extract(
        &self,
        request: &ExtractRequest,
        sink: &dyn ProgressSink,
        stream: &mut dyn Write,
    ) -> Result<RunResult, KiraError> {
        self.converter.extract(request, sink, stream)
    }
}

/// The local half of the pipeline: reads an archive and materializes outputs.
/// Needs no resolver or transport.
pub struct ArchiveConverter<O> {
    opener: O,
}

impl<O: ArchiveOpener> ArchiveConverter<O> {
    pub fn new(opener: O) -> Self {
        Self { opener }
    }

    pub fn opener(&self) -> &O {
        &self.opener
    }

    /// Convert an archive already on disk. The archive itself is never taken
    /// for an output, and a request whose outputs would overwrite it fails
    /// before anything is read.
    pub fn extract(
        &self,
        request: &ExtractRequest,
        sink: &dyn ProgressSink,
        stream: &mut dyn Write,
    ) -> Result<RunResult, KiraError> {
        let started = Instant::now();
        request.extraction.validate()?;
        if !request.archive.is_file() {
            return Err(KiraError::Filesystem(format!(
                "archive not found: {}",
                request.archive.display()
            )));
        }
        if request.extraction.formats.contains(OutputFormat::Sra)
            && container::is_fastq_path(&request.archive)
        {
            return Err(KiraError::Format(
                "sra output needs an .sra archive, not a FASTQ dump".to_string(),
            ));
        }
        let stem = container::archive_stem(&request.archive)?;
        let store = OutputStore::new(request.output_dir.clone(), stem.as_str())
            .excluding_input(&request.archive);
        let mode = MaterializeMode::from_options(&request.extraction);
        if mode == MaterializeMode::Partitioned {
            reject_overwrite(&request.extraction, &store)?;
        }
        let plan = FormatPlan::new(&request.extraction.formats, &store, request.extraction.force);
        let mut result = RunResult::new(&stem);

        phase(sink, format!("phase=Plan; extracting {}", request.archive.display()));
        let archive = LocalArchive::Sra(request.archive.clone());
        let input = if mode == MaterializeMode::Partitioned && !plan.needs_archive() {
            None
        } else {
            Some(archive)
        };
        let container = match &input {
            Some(archive) => self.open_if_needed(archive, &stem, mode, &plan)?,
            None => None,
        };
        phase(sink, format!("phase=Extract; {}", describe_mode(mode)));
        let materialized = materialize::materialize(
            mode,
            &plan,
            &store,
            input.as_ref().map(|archive| ArchiveInput {
                archive,
                container: container.as_ref(),
                owned: false,
            }),
            stream,
        )?;
        result.absorb(materialized);
        Ok(finish(result, sink, started))
    }

    fn open_if_needed(
        &self,
        archive: &LocalArchive,
        stem: &str,
        mode: MaterializeMode,
        plan: &FormatPlan,
    ) -> Result<Option<SequenceContainer>, KiraError> {
        let needs_reads = matches!(mode, MaterializeMode::UnsortedStream(_))
            || !plan.extraction_for(archive.kind()).is_empty();
        if !needs_reads {
            return Ok(None);
        }
        self.opener.open(archive, stem).map(Some)
    }
}

/// A requested output named like the input would replace it. Keeping an
/// `.sra` in place is the one exception.
fn reject_overwrite(extraction: &ExtractionOptions, store: &OutputStore) -> Result<(), KiraError> {
    for format in extraction.formats.iter() {
        if format == OutputFormat::Sra {
            continue;
        }
        for role in PartitionRole::ALL {
            let path = store.output_path(role, format);
            if store.is_input(&path) {
                return Err(KiraError::InvalidConfig(format!(
                    "{format} output {path} would overwrite the input archive; \
                     choose another output directory"
                )));
            }
        }
    }
    Ok(())
}

fn describe_mode(mode: MaterializeMode) -> String {
    match mode {
        MaterializeMode::Partitioned => "partitioned files".to_string(),
        MaterializeMode::UnsortedStream(format) => format!("unsorted {format} stream"),
    }
}

fn finish(result: RunResult, sink: &dyn ProgressSink, started: Instant) -> RunResult {
    sink.event(ProgressEvent {
        message: format!("phase=Store; {} output file(s)", result.outputs.len()),
        elapsed: Some(started.elapsed()),
    });
    result.complete()
}
