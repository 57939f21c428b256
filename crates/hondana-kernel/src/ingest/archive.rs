//! Archive decompression.
//!
//! zip-family containers are read with the `zip` crate; gzipped OCR sidecars
//! inflate through flate2. Solid formats we cannot open (`rar`, `7z`) fail
//! only the volume that carried them.

use std::io::{Cursor, Read};

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveErr {
    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("io error: {0}")]
    Io(std::io::ErrorKind),

    #[error("gzip error: {0}")]
    Gzip(std::io::ErrorKind),

    #[error("unsupported archive format: {0}")]
    Unsupported(String),

    #[error("archive nesting exceeds depth {0}")]
    NestingTooDeep(usize),
}

/// One decompressed archive entry.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Slash-separated path inside the archive.
    pub path: String,
    pub data: Bytes,
}

impl Entry {
    pub fn new(path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Entry { path: path.into(), data: data.into() }
    }
}

/// Formats [`unpack`] can open.
pub fn is_supported(extension: &str) -> bool {
    matches!(extension, "zip" | "cbz")
}

/// Decompresses a zip-family archive into its entries. Directory entries
/// are dropped; entry paths are normalised to forward slashes.
pub fn unpack(data: &[u8]) -> Result<Vec<Entry>, ArchiveErr> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))?;
    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        if file.is_dir() {
            continue;
        }
        let path = file.name().replace('\\', "/");
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)
            .map_err(|err| ArchiveErr::Io(err.kind()))?;
        entries.push(Entry::new(path, data));
    }
    Ok(entries)
}

/// Inflates a gzipped sidecar.
pub fn gunzip(data: &[u8]) -> Result<Vec<u8>, ArchiveErr> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|err| ArchiveErr::Gzip(err.kind()))?;
    Ok(out)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpack_roundtrip() {
        let data = testutil::zip_bytes(&[("01.jpg", b"aaa"), ("sub/02.jpg", b"bbb")]);
        let entries = unpack(&data).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "01.jpg");
        assert_eq!(entries[0].data.as_ref(), b"aaa");
        assert_eq!(entries[1].path, "sub/02.jpg");
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        assert!(unpack(b"definitely not a zip").is_err());
    }

    #[test]
    fn test_gunzip_roundtrip() {
        let packed = testutil::gzip_bytes(b"{\"title\": \"x\"}");
        assert_eq!(gunzip(&packed).unwrap(), b"{\"title\": \"x\"}");
        assert!(gunzip(b"not gzip").is_err());
    }

    #[test]
    fn test_supported_formats() {
        assert!(is_supported("cbz"));
        assert!(is_supported("zip"));
        assert!(!is_supported("rar"));
        assert!(!is_supported("7z"));
    }
}
