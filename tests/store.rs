use std::fs;

use camino::Utf8PathBuf;

use kira_sra_fetch::domain::{OutputFormat, PartitionRole};
use kira_sra_fetch::store::OutputStore;

fn store() -> (tempfile::TempDir, OutputStore) {
    let temp = tempfile::tempdir().unwrap();
    let dir = Utf8PathBuf::from_path_buf(temp.path().join("runs")).unwrap();
    (temp, OutputStore::new(dir, "SRR014966"))
}

#[test]
fn layout_paths() {
    let (_temp, store) = store();
    assert!(
        store
            .output_path(PartitionRole::Forward, OutputFormat::FastqGz)
            .ends_with("runs/SRR014966_1.fastq.gz")
    );
    assert!(
        store
            .output_path(PartitionRole::Unpaired, OutputFormat::FastaGz)
            .ends_with("runs/SRR014966.fasta.gz")
    );
    let file = store.output_file(PartitionRole::Reverse, OutputFormat::Fasta);
    assert!(!file.compressed);
    assert_eq!(file.role, PartitionRole::Reverse);
}

#[test]
fn staging_dir_is_removed_on_drop() {
    let (_temp, store) = store();
    let staging = store.staging_dir().unwrap();
    let path = staging.path().to_path_buf();
    assert!(path.starts_with(store.dir().as_std_path()));
    fs::write(path.join("partial.sra"), b"x").unwrap();
    drop(staging);
    assert!(!path.exists());
}

#[test]
fn adopt_moves_file_into_place() {
    let (temp, store) = store();
    store.ensure_dir().unwrap();
    let source = temp.path().join("SRR014966.sra");
    fs::write(&source, b"archive").unwrap();
    let dest = store.output_path(PartitionRole::Unpaired, OutputFormat::Sra);

    store.adopt(&source, &dest).unwrap();

    assert!(!source.exists());
    assert_eq!(fs::read(dest.as_std_path()).unwrap(), b"archive");
}

#[test]
fn existing_lists_unpaired_and_complete_pairs() {
    let (_temp, store) = store();
    store.ensure_dir().unwrap();
    for role in [PartitionRole::Forward, PartitionRole::Reverse, PartitionRole::Unpaired] {
        fs::write(store.output_path(role, OutputFormat::Fastq).as_std_path(), b"@r\nA\n+\nI\n")
            .unwrap();
    }
    let roles: Vec<_> = store
        .existing(OutputFormat::Fastq)
        .into_iter()
        .map(|file| file.role)
        .collect();
    assert_eq!(
        roles,
        vec![PartitionRole::Forward, PartitionRole::Reverse, PartitionRole::Unpaired]
    );
    assert!(store.existing(OutputFormat::Fasta).is_empty());
}
