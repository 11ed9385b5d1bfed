//! Change classification and deduplication (C5).
//!
//! Classifies every address present in either of two `CellGrid`s into one
//! of eight tags, applies policy filters, and suppresses duplicate
//! emissions within a short time window. Quick-skip (B5) lives here too:
//! a polling-loop comparison that can prove "no change" from source
//! metadata alone never has to touch the parser.

use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::model::{Baseline, Cell, CellGrid, Classification, Diff, SheetCells};
use crate::ooxml::xlsx::cell::reference_to_coords;

#[derive(Debug, Clone)]
pub struct ClassifierPolicy {
    pub track_direct_value_changes: bool,
    pub track_formula_changes: bool,
    pub track_external_references: bool,
    pub ignore_indirect_changes: bool,
    pub formula_only_mode: bool,
    pub suppress_internal_same_value: bool,
    pub show_external_refresh: bool,
}

impl ClassifierPolicy {
    pub fn from_config(config: &crate::config::Config) -> Self {
        ClassifierPolicy {
            track_direct_value_changes: config.track_direct_value_changes,
            track_formula_changes: config.track_formula_changes,
            track_external_references: config.track_external_references,
            ignore_indirect_changes: config.ignore_indirect_changes,
            formula_only_mode: config.formula_only_mode,
            suppress_internal_same_value: config.suppress_internal_same_value,
            show_external_refresh: config.show_external_refresh,
        }
    }

    fn allows(&self, classification: Classification, old: Option<&Cell>, new: Option<&Cell>, polling_flag: bool) -> bool {
        use Classification::*;
        if self.formula_only_mode && !matches!(classification, Fci | Xrlc | Xru | Ind) {
            return false;
        }
        match classification {
            None => false,
            Add | Del => true,
            Dvc => self.track_direct_value_changes,
            Fci => {
                if !self.track_formula_changes {
                    return false;
                }
                if !polling_flag && self.suppress_internal_same_value {
                    if let (Some(o), Some(n)) = (old, new) {
                        if o.display_value() == n.display_value() {
                            return false;
                        }
                    }
                }
                true
            }
            Xrlc => self.track_external_references,
            Xru => self.track_external_references && self.show_external_refresh,
            Ind => !self.ignore_indirect_changes,
        }
    }
}

/// Classifies a single `(old, new)` cell pair per the C5 table.
pub fn classify(old: Option<&Cell>, new: Option<&Cell>) -> Classification {
    match (old, new) {
        (None, None) => Classification::None,
        (None, Some(_)) => Classification::Add,
        (Some(_), None) => Classification::Del,
        (Some(old), Some(new)) => {
            if old == new {
                return Classification::None;
            }
            if old.formula.is_none() && new.formula.is_none() {
                return Classification::Dvc;
            }
            let formulas_equal = old.formula == new.formula;
            let either_external = old.external_ref || new.external_ref;
            match (formulas_equal, either_external) {
                (true, true) => Classification::Xru,
                (true, false) => Classification::Ind,
                (false, true) => Classification::Xrlc,
                (false, false) => Classification::Fci,
            }
        }
    }
}

/// Diffs `old_grid` against `new_grid`, applying `policy`. `polling_flag`
/// distinguishes a polling-loop comparison from an event-driven one (only
/// the former may suppress `suppress_internal_same_value`'s FCI case).
/// Output ordering is deterministic: sheets in key order, addresses in
/// natural (column-then-row) order within a sheet.
pub fn diff_grids(old_grid: &CellGrid, new_grid: &CellGrid, policy: &ClassifierPolicy, polling_flag: bool) -> Vec<Diff> {
    let empty = SheetCells::new();
    let sheets: BTreeSet<&String> = old_grid.keys().chain(new_grid.keys()).collect();

    let mut diffs = Vec::new();
    for sheet in sheets {
        let old_cells = old_grid.get(sheet).unwrap_or(&empty);
        let new_cells = new_grid.get(sheet).unwrap_or(&empty);
        let addresses: BTreeSet<&String> = old_cells.keys().chain(new_cells.keys()).collect();

        let mut sheet_diffs = Vec::new();
        for address in addresses {
            let old_cell = old_cells.get(address);
            let new_cell = new_cells.get(address);
            let classification = classify(old_cell, new_cell);
            if classification == Classification::None {
                continue;
            }
            if !policy.allows(classification, old_cell, new_cell, polling_flag) {
                continue;
            }
            sheet_diffs.push(Diff {
                sheet: sheet.clone(),
                address: address.clone(),
                old_cell: old_cell.cloned(),
                new_cell: new_cell.cloned(),
                classification,
            });
        }
        sheet_diffs.sort_by_key(|d| reference_to_coords(&d.address).unwrap_or((u32::MAX, u32::MAX)));
        diffs.extend(sheet_diffs);
    }
    diffs
}

/// True iff a polling-mode comparison can be answered "no change" from
/// the baseline's recorded source metadata alone, without touching the
/// parser. Never applies to event-driven comparisons — the watcher may
/// fire before the filesystem metadata visibly changes on network shares.
pub fn quick_skip(
    baseline: Option<&Baseline>,
    current_mtime: i64,
    current_size: u64,
    polling_flag: bool,
    mtime_tolerance: Duration,
) -> bool {
    if !polling_flag {
        return false;
    }
    let Some(baseline) = baseline else {
        return false;
    };
    if baseline.source_size != current_size {
        return false;
    }
    let delta_seconds = (baseline.source_mtime - current_mtime).unsigned_abs();
    delta_seconds <= mtime_tolerance.as_secs()
}

/// Drops repeated emissions of an identical `(file, sheet, addresses,
/// formula-pairs)` signature observed within `window` of the last one,
/// preventing polling-loop double-printing and duplicate log rows.
pub struct DedupTracker {
    window: Duration,
    last_seen: Mutex<HashMap<PathBuf, (u64, Instant)>>,
}

impl DedupTracker {
    pub fn new(window: Duration) -> Self {
        DedupTracker { window, last_seen: Mutex::new(HashMap::new()) }
    }

    pub fn should_emit(&self, file: &Path, diffs: &[Diff]) -> bool {
        let signature = signature_of(diffs);
        let now = Instant::now();
        let mut last_seen = self.last_seen.lock().unwrap();
        match last_seen.get(file) {
            Some((prior_signature, seen_at)) if *prior_signature == signature && now.duration_since(*seen_at) < self.window => false,
            _ => {
                last_seen.insert(file.to_path_buf(), (signature, now));
                true
            }
        }
    }
}

fn signature_of(diffs: &[Diff]) -> u64 {
    let mut addresses: Vec<(&str, &str)> = diffs.iter().map(|d| (d.sheet.as_str(), d.address.as_str())).collect();
    addresses.sort_unstable();

    let mut formula_pairs: Vec<(Option<&str>, Option<&str>)> = diffs
        .iter()
        .map(|d| {
            (
                d.old_cell.as_ref().and_then(|c| c.formula.as_deref()),
                d.new_cell.as_ref().and_then(|c| c.formula.as_deref()),
            )
        })
        .collect();
    formula_pairs.sort_unstable();

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    addresses.hash(&mut hasher);
    formula_pairs.hash(&mut hasher);
    hasher.finish()
}
