//! Slot-file store for identifier-keyed whitelists.
//!
//! Each whitelisted identifier (e.g. a stake key) owns zero or more files
//! named `<identifier>_<N>` in the input directory; each file is one mint
//! slot. A slot file's contents may list linked identifiers, one per line,
//! whose own files are pulled off the whitelist alongside it.
//!
//! Claims are recorded by physically moving files into the consumed
//! directory. This is best-effort, not atomic: two processes racing on the
//! same slot file is an unguarded hazard the operator accepts.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

/// Filesystem-backed slot store keyed by identifier.
#[derive(Debug)]
pub struct SlotStore {
    pub input_dir: PathBuf,
    pub consumed_dir: PathBuf,
}

impl SlotStore {
    pub fn new(input_dir: &Path, consumed_dir: &Path) -> Self {
        Self {
            input_dir: input_dir.to_path_buf(),
            consumed_dir: consumed_dir.to_path_buf(),
        }
    }

    /// Slot files for an identifier: `<identifier>_<digits>`, sorted.
    fn matching_files(&self, identifier: &str) -> Vec<PathBuf> {
        let prefix = format!("{identifier}_");
        let mut matches = Vec::new();
        let entries = match std::fs::read_dir(&self.input_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(
                    "Could not read whitelist directory {}: {}",
                    self.input_dir.display(),
                    e
                );
                return matches;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(suffix) = name.strip_prefix(&prefix) else {
                continue;
            };
            if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                matches.push(entry.path());
            }
        }
        matches.sort();
        matches
    }

    /// Remaining slot count for an identifier.
    pub fn num_whitelisted(&self, identifier: &str) -> u64 {
        self.matching_files(identifier).len() as u64
    }

    /// Consume `num_removed` slots for an identifier, moving the slot files
    /// and any linked identifiers into the consumed directory.
    ///
    /// The caller has already minted on-chain; filesystem failures here are
    /// logged as catastrophic and skipped rather than unwinding the vend.
    pub fn remove_from_whitelist(&self, identifier: &str, num_removed: u64) -> Result<()> {
        let locations = self.matching_files(identifier);
        tracing::info!(
            "Removing {} WL slot(s) of {} remaining for '{}'",
            num_removed,
            locations.len(),
            identifier
        );
        if (locations.len() as u64) < num_removed {
            bail!(
                "Attempting to remove too many items ({num_removed}) from the whitelist: {locations:?}"
            );
        }
        for location in locations.iter().take(num_removed as usize) {
            let linked_paths = self.linked_identifier_paths(location);
            self.move_to_consumed(location);
            for linked_path in linked_paths {
                self.move_to_consumed(&linked_path);
            }
        }
        Ok(())
    }

    fn linked_identifier_paths(&self, slot_file: &Path) -> Vec<PathBuf> {
        let contents = match std::fs::read_to_string(slot_file) {
            Ok(contents) => contents,
            Err(e) => {
                tracing::error!(
                    "[CATASTROPHIC] Could not read whitelist slot {}: {}",
                    slot_file.display(),
                    e
                );
                return Vec::new();
            }
        };
        let mut linked = Vec::new();
        for linked_id in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let linked_path = self.input_dir.join(linked_id);
            if !linked_path.exists() {
                tracing::warn!("Linked ID {} was not on whitelist, skipping...", linked_id);
                continue;
            }
            linked.push(linked_path);
        }
        linked
    }

    fn move_to_consumed(&self, location: &Path) {
        let file_name = match location.file_name() {
            Some(name) => name,
            None => return,
        };
        let target = self.consumed_dir.join(file_name);
        if let Err(e) = std::fs::rename(location, &target) {
            tracing::error!(
                "[CATASTROPHIC] FILESYSTEM ERROR IN WHITELIST, THIS IS BAD! {}: {}",
                location.display(),
                e
            );
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.input_dir.exists() {
            bail!(
                "Could not find whitelist directory {} on filesystem!",
                self.input_dir.display()
            );
        }
        if !self.consumed_dir.exists() {
            bail!(
                "Output directory {} does not exist on filesystem!",
                self.consumed_dir.display()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn counts_only_indexed_slot_files() {
        let unused = tempdir().unwrap();
        let consumed = tempdir().unwrap();
        std::fs::write(unused.path().join("stake123_0"), "").unwrap();
        std::fs::write(unused.path().join("stake123_1"), "").unwrap();
        std::fs::write(unused.path().join("stake123_x"), "").unwrap();
        std::fs::write(unused.path().join("stake999_0"), "").unwrap();

        let store = SlotStore::new(unused.path(), consumed.path());
        assert_eq!(store.num_whitelisted("stake123"), 2);
        assert_eq!(store.num_whitelisted("stake999"), 1);
        assert_eq!(store.num_whitelisted("missing"), 0);
    }

    #[test]
    fn removes_slots_and_linked_identifiers() {
        let unused = tempdir().unwrap();
        let consumed = tempdir().unwrap();
        std::fs::write(unused.path().join("stake123_0"), "linked456_0\n").unwrap();
        std::fs::write(unused.path().join("linked456_0"), "").unwrap();

        let store = SlotStore::new(unused.path(), consumed.path());
        store.remove_from_whitelist("stake123", 1).unwrap();

        assert_eq!(store.num_whitelisted("stake123"), 0);
        assert_eq!(store.num_whitelisted("linked456"), 0);
        assert!(consumed.path().join("stake123_0").exists());
        assert!(consumed.path().join("linked456_0").exists());
    }

    #[test]
    fn over_removal_is_an_error() {
        let unused = tempdir().unwrap();
        let consumed = tempdir().unwrap();
        std::fs::write(unused.path().join("stake123_0"), "").unwrap();

        let store = SlotStore::new(unused.path(), consumed.path());
        assert!(store.remove_from_whitelist("stake123", 2).is_err());
        // The sole slot must be untouched after the failed removal.
        assert_eq!(store.num_whitelisted("stake123"), 1);
    }
}
