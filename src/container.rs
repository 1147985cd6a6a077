//! Read-level access to downloaded runs.
//!
//! An `.sra` container is consumed through `fastq-dump --split-spot`, which
//! emits every read of a spot as its own FASTQ record with the spot name as
//! identifier. Mates of one spot are therefore adjacent and share an
//! identifier; downstream pairing relies on that ordering and does not
//! re-check it.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::iter::Peekable;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;

use crate::domain::{ArchiveKind, PartitionRole};
use crate::error::KiraError;
use crate::fs_util;
use crate::transport::process::drain_stderr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRecord {
    pub id: String,
    pub description: Option<String>,
    pub bases: String,
    pub qualities: Option<String>,
    pub paired: bool,
    pub fragment_index: u32,
}

pub type ReadStream<'a> = Box<dyn Iterator<Item = Result<ReadRecord, KiraError>> + 'a>;

/// A forward-only source of reads. Every call to `open_reads` is one full
/// traversal of the underlying archive.
pub trait ReadContainer {
    fn describe(&self) -> String;
    fn open_reads(&self) -> Result<ReadStream<'_>, KiraError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastqEntry {
    pub id: String,
    pub description: Option<String>,
    pub bases: String,
    pub qualities: String,
}

pub struct FastqReader<R> {
    reader: R,
    line_no: usize,
}

impl<R: BufRead> FastqReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, line_no: 0 }
    }

    fn read_line(&mut self) -> Result<Option<String>, KiraError> {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .map_err(|err| KiraError::Extraction(format!("read failed: {err}")))?;
        if read == 0 {
            return Ok(None);
        }
        self.line_no += 1;
        let trimmed = line.trim_end_matches(['\n', '\r']).len();
        line.truncate(trimmed);
        Ok(Some(line))
    }

    fn require_line(&mut self, what: &str) -> Result<String, KiraError> {
        self.read_line()?.ok_or_else(|| {
            KiraError::Extraction(format!(
                "truncated FASTQ record after line {}: missing {what}",
                self.line_no
            ))
        })
    }

    fn read_entry(&mut self) -> Result<Option<FastqEntry>, KiraError> {
        let header = loop {
            match self.read_line()? {
                None => return Ok(None),
                Some(line) if line.is_empty() => continue,
                Some(line) => break line,
            }
        };
        let Some(header) = header.strip_prefix('@') else {
            return Err(KiraError::Extraction(format!(
                "line {}: expected FASTQ header",
                self.line_no
            )));
        };
        let (id, description) = match header.split_once(char::is_whitespace) {
            Some((id, rest)) => (id.to_string(), Some(rest.trim().to_string())),
            None => (header.to_string(), None),
        };
        if id.is_empty() {
            return Err(KiraError::Extraction(format!(
                "line {}: empty read identifier",
                self.line_no
            )));
        }
        let bases = self.require_line("sequence")?;
        let separator = self.require_line("separator")?;
        if !separator.starts_with('+') {
            return Err(KiraError::Extraction(format!(
                "line {}: expected '+' separator",
                self.line_no
            )));
        }
        let qualities = self.require_line("qualities")?;
        if qualities.len() != bases.len() {
            return Err(KiraError::Extraction(format!(
                "line {}: quality length {} does not match sequence length {}",
                self.line_no,
                qualities.len(),
                bases.len()
            )));
        }
        Ok(Some(FastqEntry {
            id,
            description: description.filter(|value| !value.is_empty()),
            bases,
            qualities,
        }))
    }
}

impl<R: BufRead> Iterator for FastqReader<R> {
    type Item = Result<FastqEntry, KiraError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_entry().transpose()
    }
}

/// Groups adjacent records sharing an identifier into spots. A spot with more
/// than one fragment is paired.
pub struct SpotReader<I: Iterator<Item = Result<FastqEntry, KiraError>>> {
    entries: Peekable<I>,
    pending: VecDeque<ReadRecord>,
}

impl<I: Iterator<Item = Result<FastqEntry, KiraError>>> SpotReader<I> {
    pub fn new(entries: I) -> Self {
        Self {
            entries: entries.peekable(),
            pending: VecDeque::new(),
        }
    }
}

impl<I: Iterator<Item = Result<FastqEntry, KiraError>>> Iterator for SpotReader<I> {
    type Item = Result<ReadRecord, KiraError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(record) = self.pending.pop_front() {
            return Some(Ok(record));
        }
        let first = match self.entries.next()? {
            Ok(entry) => entry,
            Err(err) => return Some(Err(err)),
        };
        let mut spot = vec![first];
        while let Some(Ok(next)) = self.entries.peek() {
            if next.id != spot[0].id {
                break;
            }
            if let Some(Ok(entry)) = self.entries.next() {
                spot.push(entry);
            }
        }
        let paired = spot.len() > 1;
        for (index, entry) in spot.into_iter().enumerate() {
            self.pending.push_back(ReadRecord {
                id: entry.id,
                description: entry.description,
                bases: entry.bases,
                qualities: Some(entry.qualities),
                paired,
                fragment_index: index as u32,
            });
        }
        self.pending.pop_front().map(Ok)
    }
}

/// An `.sra` archive read through `fastq-dump`.
pub struct SraArchive {
    path: PathBuf,
    fastq_dump: PathBuf,
}

impl SraArchive {
    pub fn new(path: PathBuf, fastq_dump: PathBuf) -> Self {
        Self { path, fastq_dump }
    }
}

impl ReadContainer for SraArchive {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn open_reads(&self) -> Result<ReadStream<'_>, KiraError> {
        let mut child = Command::new(&self.fastq_dump)
            .args(["--stdout", "--split-spot", "--skip-technical"])
            .arg(&self.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                KiraError::Extraction(format!("failed to start fastq-dump: {err}"))
            })?;
        let stderr = child.stderr.take().map(drain_stderr);
        let stdout = child.stdout.take().ok_or_else(|| {
            KiraError::Extraction("fastq-dump stdout unavailable".to_string())
        })?;
        tracing::debug!(path = %self.path.display(), "streaming archive through fastq-dump");
        Ok(Box::new(DumpStream {
            child: Some(child),
            stderr,
            reads: SpotReader::new(FastqReader::new(BufReader::new(stdout))),
        }))
    }
}

struct DumpStream<R: BufRead> {
    child: Option<Child>,
    stderr: Option<JoinHandle<String>>,
    reads: SpotReader<FastqReader<R>>,
}

impl<R: BufRead> DumpStream<R> {
    fn finish(&mut self) -> Result<(), KiraError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child
            .wait()
            .map_err(|err| KiraError::Extraction(err.to_string()))?;
        let stderr = self
            .stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        if status.success() {
            return Ok(());
        }
        let message = if stderr.trim().is_empty() {
            format!("fastq-dump exited with {status}")
        } else {
            stderr.trim().to_string()
        };
        Err(KiraError::Extraction(message))
    }
}

impl<R: BufRead> Iterator for DumpStream<R> {
    type Item = Result<ReadRecord, KiraError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.child.as_ref()?;
        match self.reads.next() {
            Some(Ok(record)) => Some(Ok(record)),
            Some(Err(err)) => {
                self.kill();
                Some(Err(err))
            }
            None => self.finish().err().map(Err),
        }
    }
}

impl<R: BufRead> DumpStream<R> {
    fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl<R: BufRead> Drop for DumpStream<R> {
    fn drop(&mut self) {
        self.kill();
    }
}

/// An interleaved FASTQ dump (`fastq-dump --split-spot` output saved to disk).
pub struct FastqContainer {
    path: PathBuf,
}

impl FastqContainer {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ReadContainer for FastqContainer {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn open_reads(&self) -> Result<ReadStream<'_>, KiraError> {
        let reader = fs_util::open_text(&self.path)?;
        Ok(Box::new(SpotReader::new(FastqReader::new(reader))))
    }
}

/// One already-partitioned FASTQ file, e.g. `SRR1_2.fastq.gz` from ENA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresplitFile {
    pub role: PartitionRole,
    pub path: PathBuf,
}

impl PresplitFile {
    pub fn from_path(stem: &str, path: PathBuf) -> Result<Self, KiraError> {
        let role = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| PartitionRole::from_file_name(stem, name))
            .ok_or_else(|| {
                KiraError::Extraction(format!(
                    "cannot tell partition of {} for run {stem}",
                    path.display()
                ))
            })?;
        Ok(Self { role, path })
    }

    pub fn read(&self) -> Result<ReadStream<'static>, KiraError> {
        let reader = fs_util::open_text(&self.path)?;
        let role = self.role;
        Ok(Box::new(FastqReader::new(reader).map(move |entry| {
            entry.map(|entry| ReadRecord {
                id: entry.id,
                description: entry.description,
                bases: entry.bases,
                qualities: Some(entry.qualities),
                paired: role != PartitionRole::Unpaired,
                fragment_index: u32::from(role == PartitionRole::Reverse),
            })
        })))
    }
}

/// What the extractor consumes.
pub enum SequenceContainer {
    Streaming(Box<dyn ReadContainer>),
    Presplit(Vec<PresplitFile>),
}

impl SequenceContainer {
    pub fn kind(&self) -> ArchiveKind {
        match self {
            SequenceContainer::Streaming(_) => ArchiveKind::Sra,
            SequenceContainer::Presplit(_) => ArchiveKind::PresplitFastqGz,
        }
    }
}

/// A successfully downloaded run on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalArchive {
    Sra(PathBuf),
    PresplitFastqGz(Vec<PathBuf>),
}

impl LocalArchive {
    pub fn kind(&self) -> ArchiveKind {
        match self {
            LocalArchive::Sra(_) => ArchiveKind::Sra,
            LocalArchive::PresplitFastqGz(_) => ArchiveKind::PresplitFastqGz,
        }
    }

    pub fn paths(&self) -> Vec<&Path> {
        match self {
            LocalArchive::Sra(path) => vec![path.as_path()],
            LocalArchive::PresplitFastqGz(paths) => paths.iter().map(PathBuf::as_path).collect(),
        }
    }
}

/// Turns a local archive into a readable container.
pub trait ArchiveOpener: Send + Sync {
    fn open(&self, archive: &LocalArchive, stem: &str) -> Result<SequenceContainer, KiraError>;
}

#[derive(Debug, Clone)]
pub struct SystemArchiveOpener {
    fastq_dump: Option<PathBuf>,
}

impl SystemArchiveOpener {
    pub fn new() -> Self {
        Self {
            fastq_dump: which::which("fastq-dump").ok(),
        }
    }
}

impl Default for SystemArchiveOpener {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveOpener for SystemArchiveOpener {
    fn open(&self, archive: &LocalArchive, stem: &str) -> Result<SequenceContainer, KiraError> {
        match archive {
            LocalArchive::Sra(path) if is_fastq_path(path) => Ok(SequenceContainer::Streaming(
                Box::new(FastqContainer::new(path.clone())),
            )),
            LocalArchive::Sra(path) => {
                let fastq_dump = self
                    .fastq_dump
                    .clone()
                    .ok_or_else(|| KiraError::MissingTool("fastq-dump".to_string()))?;
                Ok(SequenceContainer::Streaming(Box::new(SraArchive::new(
                    path.clone(),
                    fastq_dump,
                ))))
            }
            LocalArchive::PresplitFastqGz(paths) => paths
                .iter()
                .map(|path| PresplitFile::from_path(stem, path.clone()))
                .collect::<Result<Vec<_>, _>>()
                .map(SequenceContainer::Presplit),
        }
    }
}

fn strip_gz(name: &str) -> &str {
    name.strip_suffix(".gz").unwrap_or(name)
}

pub fn is_fastq_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| {
            let name = strip_gz(name);
            name.ends_with(".fastq") || name.ends_with(".fq")
        })
        .unwrap_or(false)
}

/// Output stem for a local archive: the file name without archive extensions.
pub fn archive_stem(path: &Path) -> Result<String, KiraError> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| KiraError::Filesystem(format!("invalid archive path {}", path.display())))?;
    let name = strip_gz(name);
    let stem = [".sra", ".fastq", ".fq"]
        .iter()
        .find_map(|ext| name.strip_suffix(ext))
        .unwrap_or(name);
    if stem.is_empty() {
        return Err(KiraError::Filesystem(format!(
            "invalid archive name {}",
            path.display()
        )));
    }
    Ok(stem.to_string())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use super::*;

    fn spots(text: &str) -> Vec<ReadRecord> {
        SpotReader::new(FastqReader::new(Cursor::new(text.to_string())))
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn groups_mates_into_spots() {
        let records = spots(
            "@SRR1.1 1 length=4\nACGT\n+\nIIII\n\
             @SRR1.1 1 length=4\nTTTT\n+\nIIII\n\
             @SRR1.2 2 length=2\nGG\n+SRR1.2\nII\n",
        );
        assert_eq!(records.len(), 3);
        assert!(records[0].paired && records[1].paired);
        assert_eq!(records[1].fragment_index, 1);
        assert_eq!(records[0].description.as_deref(), Some("1 length=4"));
        assert!(!records[2].paired);
        assert_eq!(records[2].id, "SRR1.2");
    }

    #[test]
    fn rejects_quality_mismatch() {
        let err = FastqReader::new(Cursor::new("@r\nACGT\n+\nII\n".to_string()))
            .next()
            .unwrap()
            .unwrap_err();
        assert_matches!(err, KiraError::Extraction(_));
    }

    #[test]
    fn rejects_truncated_record() {
        let err = FastqReader::new(Cursor::new("@r\nACGT\n".to_string()))
            .next()
            .unwrap()
            .unwrap_err();
        assert_matches!(err, KiraError::Extraction(_));
    }

    #[test]
    fn stems_strip_archive_extensions() {
        assert_eq!(archive_stem(Path::new("/x/SRR1.sra")).unwrap(), "SRR1");
        assert_eq!(archive_stem(Path::new("dump.fastq.gz")).unwrap(), "dump");
        assert_eq!(archive_stem(Path::new("SRR2")).unwrap(), "SRR2");
        assert!(is_fastq_path(Path::new("a.fq.gz")));
        assert!(!is_fastq_path(Path::new("a.sra")));
    }
}
