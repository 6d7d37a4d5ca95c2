//! Package inspection: decide how partitions will be harvested from a package.
//!
//! Only the zip trailer and central directory are read here, which for a remote
//! source costs a couple of small range requests regardless of package size.

use std::io::{Read, Seek};
use std::path::Path;

use tracing::{debug, warn};
use zip::ZipArchive;
use zip::result::ZipError;

use crate::error::{Error, Result};
use crate::job::PartitionRequest;
use crate::payload::{HEADER_LEN, PayloadHeader};

/// Name of the entry that marks an A/B OTA payload package.
pub const PAYLOAD_ENTRY: &str = "payload.bin";

/// How partitions are pulled out of a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Partition images are plain entries of the zip.
    Zip,
    /// The zip carries `payload.bin`; an external dumper extracts the images.
    Payload { header: Option<PayloadHeader> },
}

/// A zip entry holding a requested partition image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub index: usize,
    pub partition: String,
    /// Full entry name inside the archive.
    pub name: String,
    /// Final path component of `name`.
    pub file_name: String,
}

/// An opened package together with the strategy chosen for it.
pub struct Package<R> {
    url: String,
    archive: ZipArchive<R>,
    strategy: Strategy,
}

pub(crate) fn map_zip_err(url: &str, err: ZipError) -> Error {
    match err {
        ZipError::Io(e) => Error::unavailable(url, e),
        other => Error::malformed(url, other),
    }
}

/// Read the central directory of `source` and pick a [`Strategy`].
///
/// The presence of an entry named exactly `payload.bin` selects
/// [`Strategy::Payload`] whatever else the archive contains; everything else
/// is treated as a plain zip, even when no requested partition is inside.
pub fn inspect<R: Read + Seek>(source: R, url: &str) -> Result<Package<R>> {
    let mut archive = ZipArchive::new(source).map_err(|e| map_zip_err(url, e))?;
    debug!(url, entries = archive.len(), "read central directory");

    let has_payload = archive.file_names().any(|name| name == PAYLOAD_ENTRY);
    let strategy = if has_payload {
        let header = peek_payload_header(&mut archive, url);
        Strategy::Payload { header }
    } else {
        Strategy::Zip
    };

    Ok(Package {
        url: url.to_string(),
        archive,
        strategy,
    })
}

/// Best-effort read of the `payload.bin` header; never changes the decision.
fn peek_payload_header<R: Read + Seek>(archive: &mut ZipArchive<R>, url: &str) -> Option<PayloadHeader> {
    let mut buf = Vec::with_capacity(HEADER_LEN);
    let read = archive
        .by_name(PAYLOAD_ENTRY)
        .map_err(|e| e.to_string())
        .and_then(|entry| {
            entry
                .take(HEADER_LEN as u64)
                .read_to_end(&mut buf)
                .map_err(|e| e.to_string())
        });
    if let Err(e) = read {
        warn!(url, "unable to read payload header: {e}");
        return None;
    }
    match PayloadHeader::parse(&buf) {
        Ok(header) => {
            debug!(
                url,
                version = header.file_format_version,
                manifest_size = header.manifest_size,
                "payload header"
            );
            Some(header)
        }
        Err(e) => {
            warn!(url, "{e}");
            None
        }
    }
}

impl<R: Read + Seek> Package<R> {
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Entries whose file name matches one of the requested partitions, in
    /// archive order. Directory entries are ignored.
    pub fn partition_entries(&self, request: &PartitionRequest) -> Vec<PartitionEntry> {
        let mut entries: Vec<PartitionEntry> = (0..self.archive.len())
            .filter_map(|index| {
                let name = self.archive.name_for_index(index)?;
                if name.ends_with('/') {
                    return None;
                }
                let file_name = Path::new(name).file_name()?.to_str()?;
                let partition = request.match_image(file_name)?;
                Some(PartitionEntry {
                    index,
                    partition: partition.to_string(),
                    name: name.to_string(),
                    file_name: file_name.to_string(),
                })
            })
            .collect();
        entries.sort_by_key(|e| e.index);
        entries
    }

    pub(crate) fn archive_mut(&mut self) -> &mut ZipArchive<R> {
        &mut self.archive
    }

    /// Drop the archive and its source, releasing the connection.
    pub fn into_inner(self) -> R {
        self.archive.into_inner()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::CompressionMethod;
    use zip::write::SimpleFileOptions;

    /// Build an in-memory zip from `(name, bytes)` pairs.
    pub(crate) fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, options).unwrap();
                continue;
            }
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn payload_header() -> Vec<u8> {
        let mut b = b"CrAU".to_vec();
        b.extend_from_slice(&2u64.to_be_bytes());
        b.extend_from_slice(&64u64.to_be_bytes());
        b.extend_from_slice(&16u32.to_be_bytes());
        b.extend_from_slice(&[0u8; 100]);
        b
    }

    #[test]
    fn payload_entry_selects_dumper() {
        let header = payload_header();
        let bytes = zip_bytes(&[
            ("META-INF/com/android/metadata", b"x"),
            ("boot.img", b"boot"),
            ("payload.bin", &header),
        ]);
        let pkg = inspect(Cursor::new(bytes), "u").unwrap();
        match pkg.strategy() {
            Strategy::Payload { header: Some(h) } => assert_eq!(h.manifest_size, 64),
            other => panic!("unexpected strategy {other:?}"),
        }
    }

    #[test]
    fn unreadable_payload_header_still_selects_dumper() {
        let bytes = zip_bytes(&[("payload.bin", b"not a payload")]);
        let pkg = inspect(Cursor::new(bytes), "u").unwrap();
        assert_eq!(pkg.strategy(), Strategy::Payload { header: None });
    }

    #[test]
    fn nested_payload_is_not_the_marker() {
        let bytes = zip_bytes(&[("sub/payload.bin", b"x"), ("images/boot.img", b"b")]);
        let pkg = inspect(Cursor::new(bytes), "u").unwrap();
        assert_eq!(pkg.strategy(), Strategy::Zip);
    }

    #[test]
    fn zip_without_partitions_is_still_zip_strategy() {
        let bytes = zip_bytes(&[("readme.txt", b"hi")]);
        let pkg = inspect(Cursor::new(bytes), "u").unwrap();
        assert_eq!(pkg.strategy(), Strategy::Zip);
        assert!(pkg.partition_entries(&PartitionRequest::default()).is_empty());
    }

    #[test]
    fn partition_entries_match_nested_names() {
        let bytes = zip_bytes(&[
            ("firmware-update/", b""),
            ("firmware-update/boot.img", b"b"),
            ("images/deep/init_boot.img", b"i"),
            ("system.img", b"s"),
        ]);
        let pkg = inspect(Cursor::new(bytes), "u").unwrap();
        let found: Vec<_> = pkg
            .partition_entries(&PartitionRequest::default())
            .into_iter()
            .map(|e| (e.partition, e.file_name))
            .collect();
        assert_eq!(
            found,
            [
                ("boot".to_string(), "boot.img".to_string()),
                ("init_boot".to_string(), "init_boot.img".to_string())
            ]
        );
    }

    #[test]
    fn garbage_is_a_malformed_package() {
        let err = inspect(Cursor::new(b"definitely not a zip ".repeat(64)), "u")
            .err()
            .unwrap();
        assert!(matches!(err, Error::MalformedPackage { .. }));
    }
}
