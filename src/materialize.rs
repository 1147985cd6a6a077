use std::io::{BufWriter, Write};

use flate2::Compression;
use flate2::write::GzEncoder;

use crate::config::ExtractionOptions;
use crate::container::{ReadContainer, SequenceContainer};
use crate::domain::{OutputFormat, PartitionRole};
use crate::error::KiraError;
use crate::extract::PairClassifier;
use crate::formats::{self, ArchiveInput, FormatOutcome, FormatPlan};
use crate::store::OutputStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializeMode {
    /// One file per surviving partition and format.
    Partitioned,
    /// Every read, unsorted, into a single FASTA stream.
    UnsortedStream(OutputFormat),
}

impl MaterializeMode {
    pub fn from_options(options: &ExtractionOptions) -> Self {
        match options.stream_format() {
            Some(format) => MaterializeMode::UnsortedStream(format),
            None => MaterializeMode::Partitioned,
        }
    }
}

#[derive(Debug)]
pub enum Materialized {
    Files(FormatOutcome),
    Streamed { records: u64 },
}

/// Name a read carries in the unsorted stream so mates can be regrouped.
pub fn stream_name(id: &str, role: PartitionRole) -> String {
    match role {
        PartitionRole::Forward => format!("{id}/1"),
        PartitionRole::Reverse => format!("{id}/2"),
        PartitionRole::Unpaired => id.to_string(),
    }
}

/// Writes every read of a streaming container to `out` as FASTA, in archive
/// order, gzipped for `fasta.gz`.
pub fn stream_unsorted(
    container: &SequenceContainer,
    format: OutputFormat,
    out: &mut dyn Write,
) -> Result<u64, KiraError> {
    let SequenceContainer::Streaming(reads) = container else {
        return Err(KiraError::Format(
            "--unsorted needs a streamable archive, not pre-split FASTQ".to_string(),
        ));
    };
    if !format.is_fasta_family() {
        return Err(KiraError::Format(format!(
            "--unsorted supports fasta and fasta.gz, not {format}"
        )));
    }
    tracing::info!(source = %reads.describe(), format = %format, "streaming unsorted reads");
    let records = if format.is_compressed() {
        let mut encoder = GzEncoder::new(BufWriter::new(out), Compression::default());
        let records = write_stream(reads.as_ref(), &mut encoder)?;
        let mut inner = encoder
            .finish()
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        inner
            .flush()
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        records
    } else {
        let mut writer = BufWriter::new(out);
        let records = write_stream(reads.as_ref(), &mut writer)?;
        writer
            .flush()
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        records
    };
    Ok(records)
}

fn write_stream<W: Write>(
    reads: &dyn ReadContainer,
    out: &mut W,
) -> Result<u64, KiraError> {
    let mut classifier = PairClassifier::new();
    let mut records = 0u64;
    for record in reads.open_reads()? {
        let record = record?;
        let role = classifier.classify(&record);
        writeln!(out, ">{}\n{}", stream_name(&record.id, role), record.bases)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        records += 1;
    }
    Ok(records)
}

pub fn materialize(
    mode: MaterializeMode,
    plan: &FormatPlan,
    store: &OutputStore,
    input: Option<ArchiveInput<'_>>,
    stream: &mut dyn Write,
) -> Result<Materialized, KiraError> {
    match mode {
        MaterializeMode::Partitioned => {
            formats::materialize_formats(plan, store, input).map(Materialized::Files)
        }
        MaterializeMode::UnsortedStream(format) => {
            let container = input
                .and_then(|input| input.container)
                .ok_or_else(|| KiraError::Extraction("no archive to stream".to_string()))?;
            let records = stream_unsorted(container, format, stream)?;
            Ok(Materialized::Streamed { records })
        }
    }
}
