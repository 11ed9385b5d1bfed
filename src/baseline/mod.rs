//! On-disk baseline store (C4): one file per baseline key, named with a
//! compression-profile extension so multiple profiles can coexist across
//! a migration. Writes go through a temp-file-then-atomic-rename so a
//! concurrent reader always observes either the fully old or fully new
//! file, never a partial one.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::codec::{self, Profile};
use crate::error::{ErrorKind, Result};
use crate::model::Baseline;

const PROFILES: [Profile; 3] = [Profile::Fast, Profile::Balanced, Profile::Portable];

/// The baseline store. Holds a per-key lock set so at most one `save` per
/// key is in flight; callers outside this store (C7's per-key dedup) are
/// expected to already serialize writers for the same key, but the lock
/// here is what makes that a guarantee rather than a convention.
pub struct BaselineStore {
    root: PathBuf,
    default_profile: Profile,
    in_flight: Mutex<HashSet<String>>,
}

impl BaselineStore {
    pub fn new(root: impl Into<PathBuf>, default_profile: Profile) -> Self {
        BaselineStore { root: root.into(), default_profile, in_flight: Mutex::new(HashSet::new()) }
    }

    fn path_for(&self, key: &str, profile: Profile) -> PathBuf {
        self.root.join(format!("{key}.baseline.json.{}", profile.extension()))
    }

    fn existing_path(&self, key: &str) -> Option<(PathBuf, Profile)> {
        PROFILES.iter().copied().find_map(|profile| {
            let path = self.path_for(key, profile);
            path.is_file().then_some((path, profile))
        })
    }

    /// Resolves the on-disk file for `key` regardless of which profile it
    /// was written under, decodes it, and returns it. `Ok(None)` means no
    /// baseline exists yet for this key.
    pub fn load(&self, key: &str) -> Result<Option<Baseline>> {
        let Some((path, _profile)) = self.existing_path(key) else {
            return Ok(None);
        };
        let payload = std::fs::read(&path).map_err(|e| ErrorKind::Io { path: path.clone(), source: e })?;
        let decoded = codec::decode(&payload).map_err(|_| ErrorKind::CorruptBaseline { key: key.to_string() })?;
        let baseline: Baseline = serde_json::from_slice(&decoded)
            .map_err(|_| ErrorKind::CorruptBaseline { key: key.to_string() })?;
        if !baseline.is_consistent() {
            return Err(ErrorKind::CorruptBaseline { key: key.to_string() });
        }
        Ok(Some(baseline))
    }

    /// Encodes `baseline` under the store's default profile, writes it
    /// atomically, and removes any older-profile sibling for the same key.
    pub fn save(&self, key: &str, baseline: &Baseline) -> Result<()> {
        let _guard = self.lock_key(key);

        std::fs::create_dir_all(&self.root).map_err(|e| ErrorKind::Io { path: self.root.clone(), source: e })?;

        let json = serde_json::to_vec(baseline)
            .map_err(|e| ErrorKind::Io { path: self.root.clone(), source: std::io::Error::other(e) })?;
        let wall_clock_nanos = 0; // encode() records compression wall-clock; the caller doesn't measure it here.
        let payload = codec::encode(&json, self.default_profile, wall_clock_nanos)?;

        let final_path = self.path_for(key, self.default_profile);
        let tmp_path = self.root.join(format!("{key}.baseline.json.{}.tmp", self.default_profile.extension()));

        write_atomic(&tmp_path, &final_path, &payload)?;

        for profile in PROFILES {
            if profile == self.default_profile {
                continue;
            }
            let stale = self.path_for(key, profile);
            if stale.is_file() {
                let _ = std::fs::remove_file(&stale);
            }
        }
        Ok(())
    }

    fn lock_key(&self, key: &str) -> KeyGuard<'_> {
        loop {
            {
                let mut in_flight = self.in_flight.lock().unwrap();
                if in_flight.insert(key.to_string()) {
                    break;
                }
            }
            std::thread::yield_now();
        }
        KeyGuard { store: self, key: key.to_string() }
    }
}

struct KeyGuard<'a> {
    store: &'a BaselineStore,
    key: String,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.store.in_flight.lock().unwrap().remove(&self.key);
    }
}

fn write_atomic(tmp_path: &Path, final_path: &Path, payload: &[u8]) -> Result<()> {
    {
        let mut file =
            std::fs::File::create(tmp_path).map_err(|e| ErrorKind::Io { path: tmp_path.to_path_buf(), source: e })?;
        use std::io::Write;
        file.write_all(payload).map_err(|e| ErrorKind::Io { path: tmp_path.to_path_buf(), source: e })?;
        file.sync_all().map_err(|e| ErrorKind::Io { path: tmp_path.to_path_buf(), source: e })?;
    }
    std::fs::rename(tmp_path, final_path).map_err(|e| ErrorKind::Io { path: final_path.to_path_buf(), source: e })
}

/// A thread-safe handle suitable for sharing across the compare queue's
/// worker pool.
pub type SharedBaselineStore = Arc<BaselineStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Cell, Scalar, SheetCells};
    use std::collections::BTreeMap;

    fn sample_baseline() -> Baseline {
        let mut sheet = SheetCells::new();
        sheet.insert("A1".into(), Cell::literal(Scalar::Int(1)));
        let mut grid = BTreeMap::new();
        grid.insert("Sheet1".into(), sheet);
        Baseline::new(grid, 1_700_000_000, 1024, Some("alice".into()), "2023-11-14T12:00:00Z".into())
    }

    #[test]
    fn load_returns_none_when_no_baseline_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = BaselineStore::new(dir.path(), Profile::Balanced);
        assert!(store.load("missing_key").unwrap().is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = BaselineStore::new(dir.path(), Profile::Balanced);
        let baseline = sample_baseline();
        store.save("report.xlsx__abc", &baseline).unwrap();

        let loaded = store.load("report.xlsx__abc").unwrap().unwrap();
        assert_eq!(loaded.content_hash, baseline.content_hash);
        assert_eq!(loaded.cells, baseline.cells);
    }

    #[test]
    fn save_removes_stale_profile_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let baseline = sample_baseline();

        let fast_store = BaselineStore::new(dir.path(), Profile::Fast);
        fast_store.save("key1", &baseline).unwrap();
        assert!(dir.path().join("key1.baseline.json.lz4f").is_file());

        let balanced_store = BaselineStore::new(dir.path(), Profile::Balanced);
        balanced_store.save("key1", &baseline).unwrap();
        assert!(dir.path().join("key1.baseline.json.zbal").is_file());
        assert!(!dir.path().join("key1.baseline.json.lz4f").is_file());
    }

    #[test]
    fn corrupt_payload_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad_key.baseline.json.zbal"), b"not a valid payload").unwrap();
        let store = BaselineStore::new(dir.path(), Profile::Balanced);
        assert!(matches!(store.load("bad_key"), Err(ErrorKind::CorruptBaseline { .. })));
    }
}
