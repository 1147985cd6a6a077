use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;

use crate::error::KiraError;

pub fn is_gzip_path(path: &Path) -> bool {
    path.extension()
        .and_then(|value| value.to_str())
        .map(|value| value.eq_ignore_ascii_case("gz"))
        .unwrap_or(false)
}

/// Opens a file for line reading, decompressing `.gz` transparently.
pub fn open_text(path: &Path) -> Result<Box<dyn BufRead + Send>, KiraError> {
    let file = fs::File::open(path)
        .map_err(|err| KiraError::Filesystem(format!("open {}: {err}", path.display())))?;
    if is_gzip_path(path) {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Streams `source` through gzip into `sink`.
pub fn gzip_into<W: Write>(source: &Path, sink: W) -> Result<W, KiraError> {
    let mut input = fs::File::open(source)
        .map_err(|err| KiraError::Filesystem(format!("open {}: {err}", source.display())))?;
    let mut encoder = GzEncoder::new(sink, Compression::default());
    io::copy(&mut input, &mut encoder).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    encoder
        .finish()
        .map_err(|err| KiraError::Filesystem(err.to_string()))
}

pub fn md5_file(path: &Path) -> Result<String, KiraError> {
    let mut file = fs::File::open(path)
        .map_err(|err| KiraError::Filesystem(format!("open {}: {err}", path.display())))?;
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        if read == 0 {
            break;
        }
        context.consume(&buffer[..read]);
    }
    Ok(format!("{:x}", context.compute()))
}

pub fn remove_if_exists(path: &Path) -> Result<(), KiraError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(KiraError::Filesystem(format!(
            "remove {}: {err}",
            path.display()
        ))),
    }
}
