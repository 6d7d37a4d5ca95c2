#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use bootripper::Error;
use bootripper::remote::{SeekableSource, SourceProvider};
use zip::CompressionMethod;
use zip::write::SimpleFileOptions;

/// Build an in-memory zip with stored (uncompressed) entries.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// A `payload.bin` prefix with a valid version 2 header.
pub fn payload_blob() -> Vec<u8> {
    let mut b = b"CrAU".to_vec();
    b.extend_from_slice(&2u64.to_be_bytes());
    b.extend_from_slice(&128u64.to_be_bytes());
    b.extend_from_slice(&0u32.to_be_bytes());
    b.resize(4096, 0);
    b
}

/// In-memory package served as a seekable source.
pub struct MemorySource {
    url: String,
    data: Cursor<Vec<u8>>,
    /// Reads starting inside this window fail like a dropped connection.
    fail_window: Option<Range<u64>>,
}

impl Read for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(window) = &self.fail_window {
            if window.contains(&self.data.position()) {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"));
            }
        }
        self.data.read(buf)
    }
}

impl Seek for MemorySource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.data.seek(pos)
    }
}

impl SeekableSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.get_ref().len() as u64
    }

    fn url(&self) -> &str {
        &self.url
    }
}

/// Serves registered packages by URL and counts how often each one is opened.
#[derive(Default)]
pub struct MemoryProvider {
    packages: HashMap<String, (Vec<u8>, Option<Range<u64>>)>,
    opens: Mutex<HashMap<String, usize>>,
    total_opens: AtomicUsize,
}

impl MemoryProvider {
    pub fn with(mut self, url: &str, bytes: Vec<u8>) -> Self {
        self.packages.insert(url.to_string(), (bytes, None));
        self
    }

    pub fn with_failing(mut self, url: &str, bytes: Vec<u8>, window: Range<u64>) -> Self {
        self.packages.insert(url.to_string(), (bytes, Some(window)));
        self
    }
}

/// Shares one provider between a pipeline and the test that inspects it.
pub struct SharedProvider(pub std::sync::Arc<MemoryProvider>);

impl SharedProvider {
    pub fn opens(&self, url: &str) -> usize {
        self.0.opens.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_opens(&self) -> usize {
        self.0.total_opens.load(Ordering::SeqCst)
    }
}

impl SourceProvider for SharedProvider {
    fn open(&self, url: &str) -> bootripper::Result<Box<dyn SeekableSource>> {
        self.0.total_opens.fetch_add(1, Ordering::SeqCst);
        *self.0.opens.lock().unwrap().entry(url.to_string()).or_default() += 1;
        let (bytes, fail_window) = self
            .0
            .packages
            .get(url)
            .cloned()
            .ok_or_else(|| Error::SourceUnavailable {
                url: url.to_string(),
                reason: "404 Not Found".to_string(),
            })?;
        Ok(Box::new(MemorySource {
            url: url.to_string(),
            data: Cursor::new(bytes),
            fail_window,
        }))
    }
}

/// Write an executable shell script standing in for the dumping tool.
#[cfg(unix)]
pub fn fake_tool(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("payload_dumper.sh");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Non-empty lines of the job log.
pub fn log_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect()
}
