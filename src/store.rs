use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tempfile::{Builder, NamedTempFile, TempDir};

use crate::domain::{OutputFormat, PartitionRole};
use crate::error::KiraError;

const TEMP_PREFIX: &str = ".kira-sra-";

/// A final artifact on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputFile {
    pub path: Utf8PathBuf,
    pub format: OutputFormat,
    pub role: PartitionRole,
    pub compressed: bool,
}

/// Output directory plus the naming scheme `<stem>_1.<ext>`, `<stem>_2.<ext>`,
/// `<stem>.<ext>`.
///
/// Formats marked as scratch are written under hidden temporary names instead,
/// so an intermediate never lands on a real output name. The input archive,
/// when it lives in the output directory, is never taken for an output.
#[derive(Debug, Clone)]
pub struct OutputStore {
    dir: Utf8PathBuf,
    stem: String,
    input: Option<PathBuf>,
    scratch: BTreeSet<OutputFormat>,
}

impl OutputStore {
    pub fn new(dir: Utf8PathBuf, stem: impl Into<String>) -> Self {
        Self {
            dir,
            stem: stem.into(),
            input: None,
            scratch: BTreeSet::new(),
        }
    }

    /// Protects the archive being read from reuse and derivation.
    pub fn excluding_input(mut self, input: &Path) -> Self {
        self.input = Some(fs::canonicalize(input).unwrap_or_else(|_| input.to_path_buf()));
        self
    }

    /// A view of this store that writes `formats` to scratch names.
    pub fn with_scratch(&self, formats: impl IntoIterator<Item = OutputFormat>) -> Self {
        let mut store = self.clone();
        store.scratch = formats.into_iter().collect();
        store
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    pub fn ensure_dir(&self) -> Result<(), KiraError> {
        fs::create_dir_all(self.dir.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))
    }

    pub fn output_path(&self, role: PartitionRole, format: OutputFormat) -> Utf8PathBuf {
        self.dir.join(format!(
            "{}{}.{}",
            self.stem,
            role.file_suffix(),
            format.extension()
        ))
    }

    fn scratch_path(&self, role: PartitionRole, format: OutputFormat) -> Utf8PathBuf {
        self.dir.join(format!(
            "{TEMP_PREFIX}{}{}.{}",
            self.stem,
            role.file_suffix(),
            format.extension()
        ))
    }

    /// Where `format` of `role` is written through this store.
    pub fn output_file(&self, role: PartitionRole, format: OutputFormat) -> OutputFile {
        let path = if self.scratch.contains(&format) {
            self.scratch_path(role, format)
        } else {
            self.output_path(role, format)
        };
        OutputFile {
            path,
            format,
            role,
            compressed: format.is_compressed(),
        }
    }

    /// Whether `path` is the protected input archive.
    pub fn is_input(&self, path: &Utf8Path) -> bool {
        let Some(input) = &self.input else {
            return false;
        };
        fs::canonicalize(path.as_std_path()).is_ok_and(|path| &path == input)
    }

    /// Files of `format` already on disk. A pair counts only when both mates
    /// are present.
    pub fn existing(&self, format: OutputFormat) -> Vec<OutputFile> {
        let present = |role| {
            let path = self.output_path(role, format);
            path.as_std_path().is_file() && !self.is_input(&path)
        };
        let named = |role| OutputFile {
            path: self.output_path(role, format),
            format,
            role,
            compressed: format.is_compressed(),
        };
        let mut files = Vec::new();
        if present(PartitionRole::Forward) && present(PartitionRole::Reverse) {
            files.push(named(PartitionRole::Forward));
            files.push(named(PartitionRole::Reverse));
        }
        if present(PartitionRole::Unpaired) {
            files.push(named(PartitionRole::Unpaired));
        }
        files
    }

    /// Scratch directory inside the output directory, removed on drop.
    pub fn staging_dir(&self) -> Result<TempDir, KiraError> {
        self.ensure_dir()?;
        Builder::new()
            .prefix(TEMP_PREFIX)
            .tempdir_in(self.dir.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))
    }

    /// Temp file next to the final outputs so persisting is a rename.
    pub fn temp_file(&self) -> Result<NamedTempFile, KiraError> {
        self.ensure_dir()?;
        Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(self.dir.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))
    }

    pub fn persist(temp: NamedTempFile, dest: &Utf8Path) -> Result<(), KiraError> {
        temp.persist(dest.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("persist {dest}: {err}")))?;
        Ok(())
    }

    /// Moves a finished file into place, copying when a rename is not possible.
    pub fn adopt(&self, source: &Path, dest: &Utf8Path) -> Result<(), KiraError> {
        if fs::rename(source, dest.as_std_path()).is_ok() {
            return Ok(());
        }
        let temp = self.temp_file()?;
        fs::copy(source, temp.path()).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        Self::persist(temp, dest)?;
        fs::remove_file(source).map_err(|err| KiraError::Filesystem(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let store = OutputStore::new(Utf8PathBuf::from("out"), "SRR12118866");
        assert_eq!(
            store.output_path(PartitionRole::Forward, OutputFormat::FastqGz),
            Utf8PathBuf::from("out/SRR12118866_1.fastq.gz")
        );
        assert_eq!(
            store.output_path(PartitionRole::Reverse, OutputFormat::Fasta),
            Utf8PathBuf::from("out/SRR12118866_2.fasta")
        );
        assert_eq!(
            store.output_path(PartitionRole::Unpaired, OutputFormat::Sra),
            Utf8PathBuf::from("out/SRR12118866.sra")
        );
    }

    #[test]
    fn half_pair_is_not_reused() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = OutputStore::new(dir, "SRR1");
        fs::write(
            store
                .output_path(PartitionRole::Forward, OutputFormat::Fasta)
                .as_std_path(),
            b">a\nA\n",
        )
        .unwrap();
        assert!(store.existing(OutputFormat::Fasta).is_empty());

        fs::write(
            store
                .output_path(PartitionRole::Reverse, OutputFormat::Fasta)
                .as_std_path(),
            b">a\nA\n",
        )
        .unwrap();
        assert_eq!(store.existing(OutputFormat::Fasta).len(), 2);
    }

    #[test]
    fn input_archive_is_never_an_output() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let dump = temp.path().join("SRR9.fastq");
        fs::write(&dump, b"@r\nA\n+\nI\n").unwrap();

        let plain = OutputStore::new(dir.clone(), "SRR9");
        assert_eq!(plain.existing(OutputFormat::Fastq).len(), 1);

        let store = OutputStore::new(dir, "SRR9").excluding_input(&dump);
        assert!(store.existing(OutputFormat::Fastq).is_empty());
        assert!(store.is_input(&store.output_path(PartitionRole::Unpaired, OutputFormat::Fastq)));

        let staged = store.with_scratch([OutputFormat::Fastq]);
        let file = staged.output_file(PartitionRole::Unpaired, OutputFormat::Fastq);
        assert_ne!(file.path, store.output_path(PartitionRole::Unpaired, OutputFormat::Fastq));
        assert!(file.path.file_name().unwrap().starts_with(TEMP_PREFIX));
    }
}
