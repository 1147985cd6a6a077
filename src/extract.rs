//! Single forward pass over a container, splitting reads into the unpaired,
//! forward and reverse partitions.

use std::io::{BufWriter, Write};

use tempfile::NamedTempFile;

use crate::container::{PresplitFile, ReadContainer, ReadRecord, ReadStream, SequenceContainer};
use crate::domain::{OutputFormat, PartitionRole};
use crate::error::KiraError;
use crate::fs_util;
use crate::store::{OutputFile, OutputStore};

/// Adjacency pairing: a paired read repeating the previous paired read's id is
/// the reverse mate, any other paired read starts a new spot.
#[derive(Debug, Default)]
pub struct PairClassifier {
    previous: Option<String>,
}

impl PairClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&mut self, record: &ReadRecord) -> PartitionRole {
        if !record.paired {
            return PartitionRole::Unpaired;
        }
        let role = if self.previous.as_deref() == Some(record.id.as_str()) {
            PartitionRole::Reverse
        } else {
            PartitionRole::Forward
        };
        self.previous = Some(record.id.clone());
        role
    }
}

pub fn write_record<W: Write>(
    out: &mut W,
    record: &ReadRecord,
    format: OutputFormat,
) -> Result<(), KiraError> {
    let written = match format {
        OutputFormat::Fastq => {
            let qualities = record.qualities.as_deref().ok_or_else(|| {
                KiraError::Extraction(format!("read {} has no quality scores", record.id))
            })?;
            match &record.description {
                Some(description) => write!(
                    out,
                    "@{} {}\n{}\n+\n{}\n",
                    record.id, description, record.bases, qualities
                ),
                None => write!(out, "@{}\n{}\n+\n{}\n", record.id, record.bases, qualities),
            }
        }
        OutputFormat::Fasta => write!(out, ">{}\n{}\n", record.id, record.bases),
        other => {
            return Err(KiraError::Format(format!(
                "{other} is not written directly from reads"
            )));
        }
    };
    written.map_err(|err| KiraError::Filesystem(err.to_string()))
}

/// A partition that survived the pass, with its persisted files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedPartition {
    pub role: PartitionRole,
    pub records: u64,
    pub files: Vec<OutputFile>,
}

struct Partition {
    role: PartitionRole,
    records: u64,
    sinks: Vec<(OutputFormat, BufWriter<NamedTempFile>)>,
}

impl Partition {
    fn open(
        store: &OutputStore,
        role: PartitionRole,
        formats: &[OutputFormat],
    ) -> Result<Self, KiraError> {
        let mut sinks = Vec::with_capacity(formats.len());
        for format in formats {
            sinks.push((*format, BufWriter::new(store.temp_file()?)));
        }
        Ok(Self {
            role,
            records: 0,
            sinks,
        })
    }

    fn push(&mut self, record: &ReadRecord) -> Result<(), KiraError> {
        for (format, sink) in &mut self.sinks {
            write_record(sink, record, *format)?;
        }
        self.records += 1;
        Ok(())
    }

    /// Flushes every sink. An empty partition yields nothing and its temp
    /// files are dropped.
    fn flush(self, store: &OutputStore) -> Result<Option<FlushedPartition>, KiraError> {
        if self.records == 0 {
            return Ok(None);
        }
        let mut files = Vec::with_capacity(self.sinks.len());
        for (format, sink) in self.sinks {
            let temp = sink
                .into_inner()
                .map_err(|err| KiraError::Filesystem(err.error().to_string()))?;
            files.push((store.output_file(self.role, format), temp));
        }
        Ok(Some(FlushedPartition {
            role: self.role,
            records: self.records,
            files,
        }))
    }
}

struct FlushedPartition {
    role: PartitionRole,
    records: u64,
    files: Vec<(OutputFile, NamedTempFile)>,
}

fn check_formats(formats: &[OutputFormat]) -> Result<(), KiraError> {
    if formats.is_empty() {
        return Err(KiraError::Format("nothing to extract".to_string()));
    }
    if let Some(format) = formats
        .iter()
        .find(|format| !matches!(format, OutputFormat::Fastq | OutputFormat::Fasta))
    {
        return Err(KiraError::Format(format!(
            "{format} is derived after extraction"
        )));
    }
    Ok(())
}

/// Publishes the partitions all or nothing: every sink is flushed before the
/// first rename, and files already renamed are removed if a later one fails.
fn finish_all(
    partitions: Vec<Partition>,
    store: &OutputStore,
) -> Result<Vec<ExtractedPartition>, KiraError> {
    let mut flushed = Vec::new();
    for partition in partitions {
        let role = partition.role;
        match partition.flush(store)? {
            Some(done) => flushed.push(done),
            None => tracing::debug!(role = %role, "empty partition dropped"),
        }
    }

    let mut persisted: Vec<OutputFile> = Vec::new();
    let mut extracted = Vec::with_capacity(flushed.len());
    for partition in flushed {
        let mut files = Vec::with_capacity(partition.files.len());
        for (file, temp) in partition.files {
            if let Err(err) = OutputStore::persist(temp, &file.path) {
                for done in &persisted {
                    let _ = fs_util::remove_if_exists(done.path.as_std_path());
                }
                return Err(err);
            }
            persisted.push(file.clone());
            files.push(file);
        }
        tracing::info!(role = %partition.role, records = partition.records, "partition written");
        extracted.push(ExtractedPartition {
            role: partition.role,
            records: partition.records,
            files,
        });
    }
    Ok(extracted)
}

/// Streams `container` once and writes each read to its partition in every
/// format of `formats` (uncompressed only). Partitions with no reads leave no
/// file behind; on error all temporary outputs are removed.
pub fn extract_stream(
    container: &dyn ReadContainer,
    store: &OutputStore,
    formats: &[OutputFormat],
) -> Result<Vec<ExtractedPartition>, KiraError> {
    check_formats(formats)?;
    tracing::info!(source = %container.describe(), formats = ?formats, "extracting reads");
    let mut partitions = PartitionRole::ALL
        .iter()
        .map(|role| Partition::open(store, *role, formats))
        .collect::<Result<Vec<_>, _>>()?;
    let mut classifier = PairClassifier::new();
    for record in container.open_reads()? {
        let record = record?;
        let role = classifier.classify(&record);
        partitions[role_index(role)].push(&record)?;
    }
    finish_all(partitions, store)
}

/// Converts files already split by mate. Each file is decoded once and its
/// reads keep the file's role.
pub fn extract_presplit(
    files: &[PresplitFile],
    store: &OutputStore,
    formats: &[OutputFormat],
) -> Result<Vec<ExtractedPartition>, KiraError> {
    check_formats(formats)?;
    let mut partitions = Vec::with_capacity(files.len());
    for file in files {
        tracing::info!(path = %file.path.display(), role = %file.role, "converting pre-split file");
        let mut partition = Partition::open(store, file.role, formats)?;
        let reads: ReadStream<'static> = file.read()?;
        for record in reads {
            partition.push(&record?)?;
        }
        partitions.push(partition);
    }
    partitions.sort_by_key(|partition| partition.role);
    finish_all(partitions, store)
}

pub fn extract(
    container: &SequenceContainer,
    store: &OutputStore,
    formats: &[OutputFormat],
) -> Result<Vec<ExtractedPartition>, KiraError> {
    match container {
        SequenceContainer::Streaming(reads) => extract_stream(reads.as_ref(), store, formats),
        SequenceContainer::Presplit(files) => extract_presplit(files, store, formats),
    }
}

fn role_index(role: PartitionRole) -> usize {
    match role {
        PartitionRole::Forward => 0,
        PartitionRole::Reverse => 1,
        PartitionRole::Unpaired => 2,
    }
}
