//! Operation settings shared by the binary and the driver.

use std::path::PathBuf;

use crate::group::VersionWindow;

/// Which operation to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Backup,
    Restore,
}

/// Fully resolved settings for one invocation.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    /// Validate and print the equivalent command instead of performing I/O.
    pub analyze: bool,
    /// Compute and cross-check CRC32 on both sides of every transfer.
    pub check_crc: bool,
    /// Gzip stage files on backup; ignored on restore.
    pub compress: bool,
    pub verbose: bool,
    /// Server instance, 0..=15.
    pub instance: u8,
    /// Requested namespace names, as supplied.
    pub namespaces: Vec<String>,
    /// Directory holding (or to hold) the segment files.
    pub dir: PathBuf,
    /// Worker bound for the I/O pool, already clamped to the host CPU count.
    pub threads: usize,
    /// Base version compatibility window.
    pub version_window: VersionWindow,
}

impl Config {
    /// The namespace list with empty entries skipped and duplicates operated
    /// on once.
    pub fn unique_namespaces(&self) -> Vec<&str> {
        let mut unique: Vec<&str> = Vec::with_capacity(self.namespaces.len());
        for name in &self.namespaces {
            if name.is_empty() || unique.contains(&name.as_str()) {
                continue;
            }
            unique.push(name);
        }
        unique
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(namespaces: &[&str]) -> Config {
        Config {
            mode: Mode::Backup,
            analyze: false,
            check_crc: false,
            compress: false,
            verbose: false,
            instance: 0,
            namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
            dir: PathBuf::from("/tmp"),
            threads: 1,
            version_window: VersionWindow::default(),
        }
    }

    #[test]
    fn namespace_list_is_deduplicated_and_empty_entries_skipped() {
        let config = config_with(&["foo", "", "bar", "foo"]);
        assert_eq!(config.unique_namespaces(), vec!["foo", "bar"]);
    }

    #[test]
    fn all_empty_entries_yield_an_empty_list() {
        let config = config_with(&["", ""]);
        assert!(config.unique_namespaces().is_empty());
    }
}
