#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use kira_sra_fetch::container::{
    ArchiveOpener, LocalArchive, ReadContainer, ReadRecord, ReadStream, SequenceContainer,
};
use kira_sra_fetch::domain::{CostTier, DownloadMethod, Provider, RunAccession};
use kira_sra_fetch::error::KiraError;
use kira_sra_fetch::resolver::{CandidateLocation, LocationResolver, RemoteFile};
use kira_sra_fetch::store::OutputStore;
use kira_sra_fetch::transport::{AttemptContext, AttemptOutcome, Transport, TransportMethod};

pub fn gzip(text: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

pub fn gunzip(path: &std::path::Path) -> String {
    let mut text = String::new();
    GzDecoder::new(fs::File::open(path).unwrap())
        .read_to_string(&mut text)
        .unwrap();
    text
}

pub fn temp_store(stem: &str) -> (tempfile::TempDir, OutputStore) {
    let temp = tempfile::tempdir().unwrap();
    let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, OutputStore::new(dir, stem))
}

pub fn read(id: &str, bases: &str, paired: bool, fragment_index: u32) -> ReadRecord {
    ReadRecord {
        id: id.to_string(),
        description: None,
        bases: bases.to_string(),
        qualities: Some("I".repeat(bases.len())),
        paired,
        fragment_index,
    }
}

/// `unpaired` single reads followed by `pairs` two-read spots.
pub fn spots(unpaired: usize, pairs: usize) -> Vec<ReadRecord> {
    let mut records = Vec::new();
    for index in 0..unpaired {
        records.push(read(&format!("SRR1.u{index}"), "ACGTACGT", false, 0));
    }
    for index in 0..pairs {
        let id = format!("SRR1.p{index}");
        records.push(read(&id, "AAAACCCC", true, 0));
        records.push(read(&id, "GGGGTTTT", true, 1));
    }
    records
}

/// In-memory container that counts full traversals.
pub struct MemoryContainer {
    pub records: Vec<ReadRecord>,
    pub traversals: Arc<AtomicUsize>,
}

impl ReadContainer for MemoryContainer {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn open_reads(&self) -> Result<ReadStream<'_>, KiraError> {
        self.traversals.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.records.iter().cloned().map(Ok)))
    }
}

/// Yields its records, then fails as a truncated archive would.
pub struct FailingContainer {
    pub records: Vec<ReadRecord>,
}

impl ReadContainer for FailingContainer {
    fn describe(&self) -> String {
        "failing".to_string()
    }

    fn open_reads(&self) -> Result<ReadStream<'_>, KiraError> {
        let failure = KiraError::Extraction("archive truncated".to_string());
        Ok(Box::new(
            self.records
                .iter()
                .cloned()
                .map(Ok)
                .chain(std::iter::once(Err(failure))),
        ))
    }
}

pub fn memory_container(records: Vec<ReadRecord>) -> (SequenceContainer, Arc<AtomicUsize>) {
    let traversals = Arc::new(AtomicUsize::new(0));
    let container = MemoryContainer {
        records,
        traversals: traversals.clone(),
    };
    (SequenceContainer::Streaming(Box::new(container)), traversals)
}

/// Opens `.sra` archives as a fixed set of reads; presplit archives go through
/// the real file reader.
pub struct FakeOpener {
    pub records: Vec<ReadRecord>,
    pub opens: AtomicUsize,
    pub traversals: Arc<AtomicUsize>,
}

impl FakeOpener {
    pub fn new(records: Vec<ReadRecord>) -> Self {
        Self {
            records,
            opens: AtomicUsize::new(0),
            traversals: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl ArchiveOpener for FakeOpener {
    fn open(&self, archive: &LocalArchive, stem: &str) -> Result<SequenceContainer, KiraError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        match archive {
            LocalArchive::Sra(_) => Ok(SequenceContainer::Streaming(Box::new(MemoryContainer {
                records: self.records.clone(),
                traversals: self.traversals.clone(),
            }))),
            LocalArchive::PresplitFastqGz(paths) => paths
                .iter()
                .map(|path| {
                    kira_sra_fetch::container::PresplitFile::from_path(stem, path.clone())
                })
                .collect::<Result<Vec<_>, _>>()
                .map(SequenceContainer::Presplit),
        }
    }
}

#[derive(Default)]
pub struct FakeResolver {
    pub paid: Vec<Provider>,
    pub missing: Vec<Provider>,
    pub calls: Mutex<Vec<Provider>>,
}

impl LocationResolver for FakeResolver {
    fn resolve(
        &self,
        accession: &RunAccession,
        provider: Provider,
    ) -> Result<CandidateLocation, KiraError> {
        self.calls.lock().unwrap().push(provider);
        if self.missing.contains(&provider) {
            return Err(KiraError::ResolutionNotFound {
                provider: provider.to_string(),
                accession: accession.to_string(),
            });
        }
        let cost_tier = if self.paid.contains(&provider) {
            CostTier::Paid
        } else {
            CostTier::Free
        };
        Ok(CandidateLocation {
            provider,
            files: vec![RemoteFile::new(format!("fake://{provider}/{accession}"))],
            cost_tier,
        })
    }
}

#[derive(Debug, Clone)]
pub enum Step {
    /// Writes `<acc>.sra` into the work directory.
    Deliver,
    /// Writes the named files into the work directory.
    DeliverPresplit(Vec<(String, Vec<u8>)>),
    Transient,
    Permanent,
    TimedOut,
}

/// Replays a script per method and logs every call.
#[derive(Default)]
pub struct ScriptedTransport {
    pub script: Mutex<HashMap<DownloadMethod, VecDeque<Step>>>,
    pub calls: Mutex<Vec<DownloadMethod>>,
}

impl ScriptedTransport {
    pub fn with(steps: Vec<(DownloadMethod, Vec<Step>)>) -> Self {
        let script = steps
            .into_iter()
            .map(|(method, steps)| (method, steps.into_iter().collect()))
            .collect();
        Self {
            script: Mutex::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<DownloadMethod> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, method: DownloadMethod) -> usize {
        self.calls().iter().filter(|call| **call == method).count()
    }
}

impl Transport for ScriptedTransport {
    fn attempt(
        &self,
        method: &TransportMethod,
        _location: &CandidateLocation,
        ctx: &AttemptContext<'_>,
    ) -> AttemptOutcome {
        let kind = method.kind();
        self.calls.lock().unwrap().push(kind);
        let step = self
            .script
            .lock()
            .unwrap()
            .get_mut(&kind)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Permanent);
        match step {
            Step::Deliver => {
                let dest = ctx.sra_destination();
                fs::write(&dest, b"SRA-ARCHIVE").unwrap();
                AttemptOutcome::Success(LocalArchive::Sra(dest))
            }
            Step::DeliverPresplit(files) => {
                let paths = files
                    .into_iter()
                    .map(|(name, content)| {
                        let path = ctx.work_dir.join(name);
                        fs::write(&path, content).unwrap();
                        path
                    })
                    .collect();
                AttemptOutcome::Success(LocalArchive::PresplitFastqGz(paths))
            }
            Step::Transient => AttemptOutcome::TransientFailure("503 service unavailable".into()),
            Step::Permanent => AttemptOutcome::PermanentFailure("404 not found".into()),
            Step::TimedOut => AttemptOutcome::TimedOut,
        }
    }
}
