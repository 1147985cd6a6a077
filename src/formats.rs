//! Reconciles requested output formats with what is already on disk and
//! derives every missing variant along the cheapest path.
//!
//! Plain FASTQ/FASTA come from one extraction pass. Gzipped variants are
//! compressed from their plain counterpart, which is produced as a temporary
//! intermediate when it was not requested. FASTA can be converted from FASTQ
//! already on disk without touching the archive.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::BufWriter;

use crate::container::{LocalArchive, PresplitFile, SequenceContainer};
use crate::domain::{ArchiveKind, FormatRequest, OutputFormat, PartitionRole};
use crate::error::KiraError;
use crate::extract::{self, ExtractedPartition};
use crate::fs_util;
use crate::store::{OutputFile, OutputStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Already on disk; left untouched.
    Reuse,
    /// The downloaded `.sra` archive itself.
    KeepArchive,
    /// Written during the extraction pass.
    Extract,
    /// FASTA converted from FASTQ already on disk.
    FastqConversion,
    /// Gzip of the plain variant.
    Compress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub format: OutputFormat,
    pub source: Source,
}

#[derive(Debug, Clone)]
pub struct FormatPlan {
    targets: Vec<Target>,
    reused: Vec<OutputFile>,
    extract: BTreeSet<OutputFormat>,
    intermediates: BTreeSet<OutputFormat>,
    fasta_from_fastq: bool,
}

impl FormatPlan {
    /// Plans `request` against the files in `store`. With `force` nothing on
    /// disk is trusted, neither as an output nor as a derivation source.
    pub fn new(request: &FormatRequest, store: &OutputStore, force: bool) -> Self {
        let on_disk = |format: OutputFormat| {
            if force {
                Vec::new()
            } else {
                store.existing(format)
            }
        };
        let fastq_on_disk = !on_disk(OutputFormat::Fastq).is_empty();

        let mut plan = FormatPlan {
            targets: Vec::new(),
            reused: Vec::new(),
            extract: BTreeSet::new(),
            intermediates: BTreeSet::new(),
            fasta_from_fastq: false,
        };
        for format in request.iter() {
            let found = on_disk(format);
            if !found.is_empty() {
                plan.reused.extend(found);
                plan.targets.push(Target {
                    format,
                    source: Source::Reuse,
                });
                continue;
            }
            let source = match format {
                OutputFormat::Sra => Source::KeepArchive,
                OutputFormat::Fasta if fastq_on_disk => {
                    plan.fasta_from_fastq = true;
                    Source::FastqConversion
                }
                OutputFormat::Fastq | OutputFormat::Fasta => {
                    plan.extract.insert(format);
                    Source::Extract
                }
                OutputFormat::FastqGz | OutputFormat::FastaGz => Source::Compress,
            };
            plan.targets.push(Target { format, source });
        }

        let compressed: Vec<OutputFormat> = plan
            .targets
            .iter()
            .filter(|target| target.source == Source::Compress)
            .map(|target| target.format.uncompressed())
            .collect();
        for base in compressed {
            if plan.produces(base) || !on_disk(base).is_empty() {
                continue;
            }
            if base == OutputFormat::Fasta && fastq_on_disk {
                plan.fasta_from_fastq = true;
            } else {
                plan.extract.insert(base);
            }
            plan.intermediates.insert(base);
        }
        plan
    }

    fn produces(&self, format: OutputFormat) -> bool {
        self.extract.contains(&format) || (format == OutputFormat::Fasta && self.fasta_from_fastq)
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn reused(&self) -> &[OutputFile] {
        &self.reused
    }

    /// Every requested format already exists.
    pub fn is_satisfied(&self) -> bool {
        self.targets
            .iter()
            .all(|target| target.source == Source::Reuse)
    }

    pub fn needs_archive(&self) -> bool {
        !self.extract.is_empty()
            || self
                .targets
                .iter()
                .any(|target| target.source == Source::KeepArchive)
    }

    pub fn extract_formats(&self) -> Vec<OutputFormat> {
        self.extract.iter().copied().collect()
    }

    /// Whether a pre-split delivery can stand in for the `fastq.gz` target.
    pub fn adopts_presplit(&self, kind: ArchiveKind) -> bool {
        kind == ArchiveKind::PresplitFastqGz
            && self.targets.iter().any(|target| {
                target.format == OutputFormat::FastqGz && target.source == Source::Compress
            })
    }

    /// Formats that must be decoded from an archive of `kind`. Adopted
    /// `fastq.gz` files make the plain FASTQ intermediate unnecessary.
    pub fn extraction_for(&self, kind: ArchiveKind) -> Vec<OutputFormat> {
        let mut formats = self.extract.clone();
        if self.adopts_presplit(kind) && self.intermediates.contains(&OutputFormat::Fastq) {
            formats.remove(&OutputFormat::Fastq);
        }
        formats.into_iter().collect()
    }

    pub fn intermediates(&self) -> Vec<OutputFormat> {
        self.intermediates.iter().copied().collect()
    }
}

/// The downloaded or user-supplied archive. Files of an `owned` archive may be
/// moved into the output directory; others are copied.
pub struct ArchiveInput<'a> {
    pub archive: &'a LocalArchive,
    /// Opened only when reads have to be decoded.
    pub container: Option<&'a SequenceContainer>,
    pub owned: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FormatOutcome {
    /// Every output satisfying the request, sorted by format then role.
    pub outputs: Vec<OutputFile>,
    pub reused: Vec<OutputFile>,
    pub partitions: Vec<ExtractedPartition>,
}

pub fn materialize_formats(
    plan: &FormatPlan,
    store: &OutputStore,
    input: Option<ArchiveInput<'_>>,
) -> Result<FormatOutcome, KiraError> {
    if plan.needs_archive() && input.is_none() {
        return Err(KiraError::Extraction(
            "an archive is required to produce the requested formats".to_string(),
        ));
    }
    store.ensure_dir()?;

    let adopt_fastq_gz = input
        .as_ref()
        .is_some_and(|input| plan.adopts_presplit(input.archive.kind()));

    // Intermediates go to scratch names, never onto a real output name.
    let writer = store.with_scratch(plan.intermediates.iter().copied());
    let mut produced: BTreeMap<OutputFormat, Vec<OutputFile>> = BTreeMap::new();
    let mut outcome = FormatOutcome {
        reused: plan.reused.clone(),
        ..FormatOutcome::default()
    };

    if let Some(input) = &input {
        let extract_now = plan.extraction_for(input.archive.kind());
        if !extract_now.is_empty() {
            let container = input.container.ok_or_else(|| {
                KiraError::Extraction("archive was not opened for extraction".to_string())
            })?;
            let partitions = extract::extract(container, &writer, &extract_now)?;
            if partitions.is_empty() {
                tracing::warn!(store = %store.dir(), "archive contained no reads");
            }
            for partition in &partitions {
                for file in &partition.files {
                    produced.entry(file.format).or_default().push(file.clone());
                }
            }
            outcome.partitions = partitions;
        }
        if plan
            .targets
            .iter()
            .any(|target| target.source == Source::KeepArchive)
        {
            let file = keep_archive(input, store)?;
            produced.entry(OutputFormat::Sra).or_default().push(file);
        }
        if adopt_fastq_gz {
            let files = adopt_presplit(input, store)?;
            produced.insert(OutputFormat::FastqGz, files);
        }
    }

    if plan.fasta_from_fastq {
        let sources: Vec<PresplitFile> = store
            .existing(OutputFormat::Fastq)
            .into_iter()
            .map(|file| PresplitFile {
                role: file.role,
                path: file.path.into_std_path_buf(),
            })
            .collect();
        tracing::info!(files = sources.len(), "converting existing FASTQ to FASTA");
        for partition in extract::extract_presplit(&sources, &writer, &[OutputFormat::Fasta])? {
            produced
                .entry(OutputFormat::Fasta)
                .or_default()
                .extend(partition.files);
        }
    }

    for target in &plan.targets {
        if target.source != Source::Compress || produced.contains_key(&target.format) {
            continue;
        }
        let base = target.format.uncompressed();
        let sources = match produced.get(&base) {
            Some(files) => files.clone(),
            None => store.existing(base),
        };
        let mut files = Vec::with_capacity(sources.len());
        for source in &sources {
            files.push(compress(store, source, target.format)?);
        }
        produced.insert(target.format, files);
    }

    for format in &plan.intermediates {
        if let Some(files) = produced.remove(format) {
            for file in files {
                fs_util::remove_if_exists(file.path.as_std_path())?;
            }
        }
    }

    let mut outputs = plan.reused.clone();
    outputs.extend(produced.into_values().flatten());
    outputs.sort_by_key(|file| (file.format, file.role));
    outcome.outputs = outputs;
    Ok(outcome)
}

fn compress(
    store: &OutputStore,
    source: &OutputFile,
    format: OutputFormat,
) -> Result<OutputFile, KiraError> {
    let target = store.output_file(source.role, format);
    tracing::debug!(from = %source.path, to = %target.path, "compressing");
    let temp = store.temp_file()?;
    let writer = fs_util::gzip_into(source.path.as_std_path(), BufWriter::new(temp))?;
    let temp = writer
        .into_inner()
        .map_err(|err| KiraError::Filesystem(err.error().to_string()))?;
    OutputStore::persist(temp, &target.path)?;
    Ok(target)
}

fn keep_archive(input: &ArchiveInput<'_>, store: &OutputStore) -> Result<OutputFile, KiraError> {
    let LocalArchive::Sra(path) = input.archive else {
        return Err(KiraError::Format(
            "sra output needs an .sra archive but the run was delivered as FASTQ".to_string(),
        ));
    };
    let file = store.output_file(PartitionRole::Unpaired, OutputFormat::Sra);
    if path.as_path() == file.path.as_std_path() || store.is_input(&file.path) {
        return Ok(file);
    }
    if input.owned {
        store.adopt(path, &file.path)?;
    } else {
        copy_into(store, path, &file)?;
    }
    Ok(file)
}

fn adopt_presplit(
    input: &ArchiveInput<'_>,
    store: &OutputStore,
) -> Result<Vec<OutputFile>, KiraError> {
    let LocalArchive::PresplitFastqGz(paths) = input.archive else {
        return Ok(Vec::new());
    };
    let mut adopted = Vec::with_capacity(paths.len());
    for path in paths {
        let presplit = PresplitFile::from_path(store.stem(), path.clone())?;
        let file = store.output_file(presplit.role, OutputFormat::FastqGz);
        tracing::info!(path = %file.path, "adopting pre-split FASTQ");
        if input.owned {
            store.adopt(&presplit.path, &file.path)?;
        } else {
            copy_into(store, &presplit.path, &file)?;
        }
        adopted.push(file);
    }
    Ok(adopted)
}

fn copy_into(
    store: &OutputStore,
    source: &std::path::Path,
    file: &OutputFile,
) -> Result<(), KiraError> {
    let temp = store.temp_file()?;
    fs::copy(source, temp.path()).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    OutputStore::persist(temp, &file.path)
}
