//! Configuration: built-in defaults, optional TOML file, `SHEETWATCH_`
//! environment overrides, and CLI flags, applied in that increasing order
//! of precedence. The result is validated once and handed out by `Arc`;
//! nothing downstream may mutate it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::codec::Profile;
use crate::error::{ErrorKind, Result};

/// CLI-sourced overrides, applied last. Every field is optional: only
/// flags the user actually passed should be `Some`.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub watch_roots: Option<Vec<PathBuf>>,
    pub cache_root: Option<PathBuf>,
    pub log_root: Option<PathBuf>,
    pub log_level: Option<String>,
    pub max_concurrent_compares: Option<usize>,
    pub strict_no_original_read: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub watch_roots: Vec<PathBuf>,
    pub exclude_paths: Vec<PathBuf>,
    pub monitor_only_roots: Vec<PathBuf>,
    pub supported_extensions: HashSet<String>,

    pub cache_root: PathBuf,
    pub log_root: PathBuf,
    pub baselines_codec: String,
    pub strict_no_original_read: bool,

    pub copy_retry_count: u32,
    pub copy_retry_backoff_seconds: f64,
    pub copy_chunk_size_mb: u64,
    pub copy_stability_checks: u32,
    pub copy_stability_interval_seconds: f64,
    pub copy_stability_max_wait_seconds: f64,
    pub copy_post_sleep_seconds: f64,

    pub debounce_interval_seconds: f64,
    pub polling_stable_checks: u32,
    pub polling_cooldown_seconds: f64,
    pub polling_size_threshold_mb: u64,
    pub dense_polling_interval_seconds: f64,
    pub sparse_polling_interval_seconds: f64,

    pub quick_skip_by_stat: bool,
    pub mtime_tolerance_seconds: f64,

    pub enable_formula_value_check: bool,
    pub max_formula_value_cells: u64,
    pub always_fetch_value_for_external_refs: bool,

    pub track_direct_value_changes: bool,
    pub track_formula_changes: bool,
    pub track_external_references: bool,
    pub ignore_indirect_changes: bool,
    pub formula_only_mode: bool,
    pub suppress_internal_same_value: bool,
    pub show_external_refresh: bool,

    pub max_concurrent_compares: usize,
    pub dedup_pending_events: bool,
    pub immediate_compare_on_first_event: bool,

    pub enable_heartbeat: bool,
    pub heartbeat_interval_seconds: f64,
    pub enable_observer_healthcheck: bool,
    pub observer_stall_threshold_seconds: f64,
    pub observer_probe_enabled: bool,
    pub observer_probe_timeout_seconds: f64,
    pub enable_auto_restart_observer: bool,
    pub max_recoveries: u32,
    pub recovery_window_seconds: f64,

    pub parser_timeout_seconds: u64,
    pub parser_max_workers: usize,

    pub log_dedup_window_seconds: f64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            watch_roots: Vec::new(),
            exclude_paths: Vec::new(),
            monitor_only_roots: Vec::new(),
            supported_extensions: ["xlsx", "xlsm"].iter().map(|s| s.to_string()).collect(),

            cache_root: PathBuf::from("./.sheetwatch/cache"),
            log_root: PathBuf::from("./.sheetwatch/logs"),
            baselines_codec: "balanced".to_string(),
            strict_no_original_read: true,

            copy_retry_count: 3,
            copy_retry_backoff_seconds: 0.5,
            copy_chunk_size_mb: 8,
            copy_stability_checks: 3,
            copy_stability_interval_seconds: 0.5,
            copy_stability_max_wait_seconds: 30.0,
            copy_post_sleep_seconds: 0.2,

            debounce_interval_seconds: 1.0,
            polling_stable_checks: 3,
            polling_cooldown_seconds: 5.0,
            polling_size_threshold_mb: 10,
            dense_polling_interval_seconds: 1.0,
            sparse_polling_interval_seconds: 5.0,

            quick_skip_by_stat: true,
            mtime_tolerance_seconds: 2.0,

            enable_formula_value_check: true,
            max_formula_value_cells: 50_000,
            always_fetch_value_for_external_refs: true,

            track_direct_value_changes: true,
            track_formula_changes: true,
            track_external_references: true,
            ignore_indirect_changes: false,
            formula_only_mode: false,
            suppress_internal_same_value: true,
            show_external_refresh: true,

            max_concurrent_compares: 4,
            dedup_pending_events: true,
            immediate_compare_on_first_event: true,

            enable_heartbeat: true,
            heartbeat_interval_seconds: 30.0,
            enable_observer_healthcheck: true,
            observer_stall_threshold_seconds: 120.0,
            observer_probe_enabled: true,
            observer_probe_timeout_seconds: 5.0,
            enable_auto_restart_observer: true,
            max_recoveries: 5,
            recovery_window_seconds: 300.0,

            parser_timeout_seconds: 120,
            parser_max_workers: 2,

            log_dedup_window_seconds: 2.0,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Loads configuration in increasing order of precedence: defaults,
    /// an optional TOML file, `SHEETWATCH_`-prefixed environment
    /// variables, then `cli`. Validates the merged result.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => Self::from_toml_file(path)?,
            None => Config::default(),
        };
        config.apply_env_overrides()?;
        config.apply_cli_overrides(cli);
        config.validate()?;
        Ok(config)
    }

    fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ErrorKind::ConfigError(format!("reading {}: {e}", path.display())))?;
        toml::from_str(&text)
            .map_err(|e| ErrorKind::ConfigError(format!("parsing {}: {e}", path.display())))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("SHEETWATCH_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = std::env::var("SHEETWATCH_CACHE_ROOT") {
            self.cache_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SHEETWATCH_LOG_ROOT") {
            self.log_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SHEETWATCH_WATCH_ROOTS") {
            self.watch_roots = std::env::split_paths(&v).collect();
        }
        if let Ok(v) = std::env::var("SHEETWATCH_MAX_CONCURRENT_COMPARES") {
            self.max_concurrent_compares = v.parse().map_err(|_| {
                ErrorKind::ConfigError(
                    "SHEETWATCH_MAX_CONCURRENT_COMPARES must be a positive integer".to_string(),
                )
            })?;
        }
        if let Ok(v) = std::env::var("SHEETWATCH_STRICT_NO_ORIGINAL_READ") {
            self.strict_no_original_read = parse_bool_env(&v, "SHEETWATCH_STRICT_NO_ORIGINAL_READ")?;
        }
        Ok(())
    }

    fn apply_cli_overrides(&mut self, cli: CliOverrides) {
        if let Some(roots) = cli.watch_roots {
            self.watch_roots = roots;
        }
        if let Some(root) = cli.cache_root {
            self.cache_root = root;
        }
        if let Some(root) = cli.log_root {
            self.log_root = root;
        }
        if let Some(level) = cli.log_level {
            self.log_level = level;
        }
        if let Some(n) = cli.max_concurrent_compares {
            self.max_concurrent_compares = n;
        }
        if let Some(strict) = cli.strict_no_original_read {
            self.strict_no_original_read = strict;
        }
    }

    /// Path existence, numeric ranges, and mutually-exclusive flag
    /// combinations. A watch-root set that resolves to zero readable
    /// directories is fatal: there is nothing for the process to do.
    fn validate(&self) -> Result<()> {
        if self.watch_roots.is_empty() {
            return Err(ErrorKind::ConfigError("no watch_roots configured".to_string()));
        }
        if !self.watch_roots.iter().any(|p| p.is_dir()) {
            return Err(ErrorKind::ConfigError(
                "watch_roots resolves to zero readable directories".to_string(),
            ));
        }
        if self.max_concurrent_compares == 0 {
            return Err(ErrorKind::ConfigError("max_concurrent_compares must be >= 1".to_string()));
        }
        if self.parser_max_workers == 0 {
            return Err(ErrorKind::ConfigError("parser_max_workers must be >= 1".to_string()));
        }
        if self.formula_only_mode && !self.track_formula_changes {
            return Err(ErrorKind::ConfigError(
                "formula_only_mode requires track_formula_changes".to_string(),
            ));
        }
        if self.supported_extensions.is_empty() {
            return Err(ErrorKind::ConfigError("supported_extensions must not be empty".to_string()));
        }
        self.baseline_profile()?;
        Ok(())
    }

    /// The codec profile `baselines_codec` names, or `ErrorKind::ConfigError`
    /// if it isn't one of `fast` / `balanced` / `portable`.
    pub fn baseline_profile(&self) -> Result<Profile> {
        match self.baselines_codec.as_str() {
            "fast" => Ok(Profile::Fast),
            "balanced" => Ok(Profile::Balanced),
            "portable" => Ok(Profile::Portable),
            other => Err(ErrorKind::ConfigError(format!("unknown baselines_codec: {other}"))),
        }
    }
}

fn parse_bool_env(value: &str, var_name: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ErrorKind::ConfigError(format!("{var_name} must be a boolean"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_watch_roots_and_fails_validation() {
        let err = Config::default().validate().unwrap_err();
        assert!(matches!(err, ErrorKind::ConfigError(_)));
    }

    #[test]
    fn validates_against_a_real_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.watch_roots.push(dir.path().to_path_buf());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn cli_overrides_win_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cli = CliOverrides {
            watch_roots: Some(vec![dir.path().to_path_buf()]),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };
        let config = Config::load(None, cli).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.watch_roots, vec![dir.path().to_path_buf()]);
    }

    #[test]
    fn formula_only_mode_requires_track_formula_changes() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.watch_roots.push(dir.path().to_path_buf());
        config.formula_only_mode = true;
        config.track_formula_changes = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_codec_profile_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.watch_roots.push(dir.path().to_path_buf());
        config.baselines_codec = "zstd".to_string();
        assert!(config.validate().is_err());
    }
}
