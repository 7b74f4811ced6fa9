//! The archive collaborator interface (§6): an append-only sink the writer
//! never reads back from. Byte-layout of the container itself is out of
//! scope here; this crate only ever calls [`Archive::append_file`].

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;

/// An append-only archive sink. Paths are forward-slash, case-sensitive,
/// with no leading slash.
pub trait Archive: Send + Sync {
    fn append_file(&self, path: &str, bytes: &[u8]) -> bool;
}

/// Gzips `bytes` the way the writer gzips every JSON document it emits
/// before handing it to the archive (`.json.gz` entries in §6's layout
/// table).
pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    // An in-memory `Vec<u8>` writer never fails.
    encoder.write_all(bytes).expect("gzip write to Vec cannot fail");
    encoder.finish().expect("gzip finish to Vec cannot fail")
}

/// Serializes `value` to JSON and appends it gzip-compressed at `path`
/// (which should already end in `.json.gz`).
pub fn append_json<T: serde::Serialize>(
    archive: &dyn Archive,
    path: &str,
    value: &T,
) -> Result<(), crate::Error> {
    let json = serde_json::to_vec(value)?;
    let gz = gzip(&json);
    if archive.append_file(path, &gz) {
        Ok(())
    } else {
        Err(crate::Error::IoWriteFailed)
    }
}

/// Appends raw (non-JSON) bytes gzip-compressed, e.g. geometry/attribute
/// buffers (`.bin.gz` entries).
pub fn append_binary_gz(archive: &dyn Archive, path: &str, bytes: &[u8]) -> Result<(), crate::Error> {
    let gz = gzip(bytes);
    if archive.append_file(path, &gz) {
        Ok(())
    } else {
        Err(crate::Error::IoWriteFailed)
    }
}

/// Appends raw bytes uncompressed, e.g. texture images, which are never
/// gzipped per §6.
pub fn append_raw(archive: &dyn Archive, path: &str, bytes: &[u8]) -> Result<(), crate::Error> {
    if archive.append_file(path, bytes) {
        Ok(())
    } else {
        Err(crate::Error::IoWriteFailed)
    }
}
