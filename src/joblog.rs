//! Append-only record of source URLs that have been fully processed.
//!
//! The log file holds one URL per line. It is read once when the run starts and
//! only ever appended to afterwards, one fsynced line per successful job, so a
//! crash can never leave a half-finished URL marked as done.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::error::{Error, Result};

/// Answer to "may this worker process the URL?".
pub enum ClaimStatus<'a> {
    /// A previous run (or an earlier job in this run) already processed it.
    Processed,
    /// Another worker is processing the same URL right now.
    InFlight,
    /// The caller owns the URL until the claim is committed or dropped.
    Claimed(Claim<'a>),
}

struct State {
    processed: HashSet<String>,
    in_flight: HashSet<String>,
    file: File,
    /// Set when the file on disk does not end with a newline yet.
    needs_newline: bool,
}

/// The resumable job log. All membership checks and appends go through one lock.
pub struct JobLog {
    path: PathBuf,
    state: Mutex<State>,
}

impl JobLog {
    /// Open (or create) the log at `path` and load every recorded URL.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let log_err = |source: io::Error| Error::JobLog {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(log_err)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(log_err)?;

        let mut text = String::new();
        file.seek(SeekFrom::Start(0)).map_err(log_err)?;
        file.read_to_string(&mut text).map_err(log_err)?;

        let processed: HashSet<String> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        let needs_newline = !text.is_empty() && !text.ends_with('\n');
        debug!(path = %path.display(), entries = processed.len(), "loaded job log");

        Ok(JobLog {
            path,
            state: Mutex::new(State {
                processed,
                in_flight: HashSet::new(),
                file,
                needs_newline,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a worker panicked between two statements
        // that never leave the sets inconsistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether `url` has already been processed.
    pub fn contains(&self, url: &str) -> bool {
        self.lock().processed.contains(url)
    }

    /// Number of processed URLs known to this log.
    pub fn len(&self) -> usize {
        self.lock().processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically check and reserve `url` for the calling worker.
    pub fn try_claim(&self, url: &str) -> ClaimStatus<'_> {
        let mut state = self.lock();
        if state.processed.contains(url) {
            return ClaimStatus::Processed;
        }
        if !state.in_flight.insert(url.to_string()) {
            return ClaimStatus::InFlight;
        }
        ClaimStatus::Claimed(Claim {
            log: self,
            url: url.to_string(),
            committed: false,
        })
    }

    fn commit(&self, url: &str) -> Result<()> {
        let mut state = self.lock();
        let state = &mut *state;
        let mut line = String::with_capacity(url.len() + 2);
        if state.needs_newline {
            line.push('\n');
        }
        line.push_str(url);
        line.push('\n');

        let write = state
            .file
            .write_all(line.as_bytes())
            .and_then(|_| state.file.sync_data());
        if let Err(source) = write {
            state.in_flight.remove(url);
            return Err(Error::JobLog {
                path: self.path.clone(),
                source,
            });
        }

        state.needs_newline = false;
        state.in_flight.remove(url);
        state.processed.insert(url.to_string());
        Ok(())
    }

    fn release(&self, url: &str) {
        self.lock().in_flight.remove(url);
    }
}

/// Exclusive right to process one URL.
///
/// Dropping the claim without calling [`Claim::commit`] leaves the URL unseen, so
/// a later run retries it.
pub struct Claim<'a> {
    log: &'a JobLog,
    url: String,
    committed: bool,
}

impl Claim<'_> {
    /// Durably mark the URL as processed.
    pub fn commit(mut self) -> Result<()> {
        self.committed = true;
        self.log.commit(&self.url)
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.log.release(&self.url);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn claim<'a>(log: &'a JobLog, url: &str) -> Claim<'a> {
        match log.try_claim(url) {
            ClaimStatus::Claimed(c) => c,
            ClaimStatus::Processed => panic!("{url} unexpectedly processed"),
            ClaimStatus::InFlight => panic!("{url} unexpectedly in flight"),
        }
    }

    fn lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn committed_urls_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processed_urls.txt");
        {
            let log = JobLog::open(&path).unwrap();
            claim(&log, "https://h/a.zip").commit().unwrap();
            claim(&log, "https://h/b.zip").commit().unwrap();
        }
        let log = JobLog::open(&path).unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.contains("https://h/a.zip"));
        assert!(matches!(log.try_claim("https://h/b.zip"), ClaimStatus::Processed));
    }

    #[test]
    fn dropped_claim_leaves_url_unseen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        {
            let log = JobLog::open(&path).unwrap();
            let c = claim(&log, "https://h/killed.zip");
            assert!(matches!(log.try_claim("https://h/killed.zip"), ClaimStatus::InFlight));
            drop(c);
            assert!(!log.contains("https://h/killed.zip"));
            // Released, so it can be claimed again in the same run.
            drop(claim(&log, "https://h/killed.zip"));
        }
        let log = JobLog::open(&path).unwrap();
        assert!(log.is_empty());
        assert!(lines(&path).is_empty());
    }

    #[test]
    fn torn_last_line_does_not_merge_with_next_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        fs::write(&path, "https://h/a.zip\nhttps://h/tor").unwrap();

        let log = JobLog::open(&path).unwrap();
        claim(&log, "https://h/b.zip").commit().unwrap();
        assert_eq!(
            lines(&path),
            ["https://h/a.zip", "https://h/tor", "https://h/b.zip"]
        );
    }

    #[test]
    fn duplicate_lines_collapse_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        fs::write(&path, "https://h/a.zip\n\nhttps://h/a.zip\n  https://h/b.zip  \n").unwrap();
        let log = JobLog::open(&path).unwrap();
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn concurrent_claims_never_duplicate_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let log = Arc::new(JobLog::open(&path).unwrap());
        let urls: Vec<String> = (0..16).map(|i| format!("https://h/{i}.zip")).collect();

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let log = Arc::clone(&log);
                let urls = urls.clone();
                thread::spawn(move || {
                    for round in 0..4 {
                        for i in 0..urls.len() {
                            // Vary the visiting order per worker and round.
                            let target = &urls[(i * (worker + 1) + round * 3) % urls.len()];
                            if let ClaimStatus::Claimed(c) = log.try_claim(target) {
                                if (worker + i) % 5 == 0 {
                                    drop(c);
                                } else {
                                    c.commit().unwrap();
                                }
                            }
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let recorded = lines(&path);
        let unique: HashSet<_> = recorded.iter().collect();
        assert_eq!(recorded.len(), unique.len());
        assert_eq!(recorded.len(), log.len());
    }
}
