//! Per-record units of work.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::record::DeviceRecord;

/// Partitions harvested when nothing else is requested.
pub const DEFAULT_PARTITIONS: [&str; 2] = ["boot", "init_boot"];

/// The set of partition names to extract for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRequest {
    names: BTreeSet<String>,
}

impl Default for PartitionRequest {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

impl PartitionRequest {
    /// Build a request from names; blanks are dropped and duplicates collapse.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = names
            .into_iter()
            .map(|n| n.as_ref().trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        Self { names }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Comma-separated form, as passed to the dumping tool.
    pub fn to_arg(&self) -> String {
        self.names.iter().cloned().collect::<Vec<_>>().join(",")
    }

    /// The requested partition an image file name belongs to.
    ///
    /// A file matches when its name ends with `<partition>.img`. When several
    /// requested names match (`init_boot.img` ends with `boot.img` too) the
    /// longest one wins.
    pub fn match_image(&self, file_name: &str) -> Option<&str> {
        self.names
            .iter()
            .filter(|p| {
                file_name
                    .strip_suffix(".img")
                    .is_some_and(|stem| stem.ends_with(p.as_str()))
            })
            .max_by_key(|p| p.len())
            .map(String::as_str)
    }
}

impl FromStr for PartitionRequest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let request = Self::new(s.split(','));
        if request.is_empty() {
            return Err("at least one partition name is required".to_string());
        }
        if let Some(bad) = request
            .names()
            .find(|n| n.contains(['/', '\\']) || matches!(*n, "." | ".."))
        {
            return Err(format!("invalid partition name: {bad}"));
        }
        Ok(request)
    }
}

impl fmt::Display for PartitionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_arg())
    }
}

/// One record scheduled for extraction.
#[derive(Debug, Clone)]
pub struct ExtractionJob {
    pub record: DeviceRecord,
    pub resolved_version: String,
    pub partitions: PartitionRequest,
}

impl ExtractionJob {
    pub fn url(&self) -> &str {
        &self.record.source_url
    }

    pub fn device(&self) -> &str {
        &self.record.device_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_request_is_boot_and_init_boot() {
        let r = PartitionRequest::default();
        assert_eq!(r.names().collect::<Vec<_>>(), ["boot", "init_boot"]);
        assert_eq!(r.to_arg(), "boot,init_boot");
    }

    #[test]
    fn parses_comma_list() {
        let r: PartitionRequest = " vendor_boot, boot ,,boot".parse().unwrap();
        assert_eq!(r.to_arg(), "boot,vendor_boot");
        assert!(",,".parse::<PartitionRequest>().is_err());
        assert!("../boot".parse::<PartitionRequest>().is_err());
        assert!("boot,..".parse::<PartitionRequest>().is_err());
        assert!(".".parse::<PartitionRequest>().is_err());
    }

    #[test]
    fn longest_partition_name_wins() {
        let r = PartitionRequest::default();
        assert_eq!(r.match_image("init_boot.img"), Some("init_boot"));
        assert_eq!(r.match_image("boot.img"), Some("boot"));
        assert_eq!(r.match_image("vendor_boot.img"), Some("boot"));
        assert_eq!(r.match_image("boot.img.sig"), None);
        assert_eq!(r.match_image("system.img"), None);

        let only_boot = PartitionRequest::new(["boot"]);
        assert_eq!(only_boot.match_image("init_boot.img"), Some("boot"));
    }
}
