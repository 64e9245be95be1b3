//! `casediff.toml` and `CASEDIFF_*` environment settings.

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use anyhow::Context as _;
use casediff_core::{
  builtin::case_rules,
  rule::{RuleSet, RuleSpec},
};
use casediff_queue::{
  QueueSettings,
  loader::JsonDirLoader,
  queue::{BATCH_SIZE, MAX_DIFF_WORKERS, MAX_MEMORIZED_CASES, STATUS_INTERVAL},
};
use serde::Deserialize;

/// Values given on the command line, which win over the file and the
/// environment.
#[derive(Debug, Default)]
pub struct Overrides {
  pub state_dir:  Option<PathBuf>,
  pub docs_dir:   Option<PathBuf>,
  pub batch_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiffConfig {
  /// State databases live in `<state_dir>/db/`.
  pub state_dir:            PathBuf,
  /// Documents live in `<docs_dir>/<domain>/{old,new}/<id>.json`.
  #[serde(default = "default_docs_dir")]
  pub docs_dir:             PathBuf,
  #[serde(default = "default_batch_size")]
  pub batch_size:           usize,
  #[serde(default = "default_max_diff_workers")]
  pub max_diff_workers:     usize,
  #[serde(default = "default_max_memorized_cases")]
  pub max_memorized_cases:  usize,
  #[serde(default = "default_status_interval_secs")]
  pub status_interval_secs: u64,
  /// Appended to the built-in case rules.
  #[serde(default)]
  pub ignore_rules:         Vec<RuleSpec>,
}

fn default_docs_dir() -> PathBuf { PathBuf::from("docs") }
fn default_batch_size() -> usize { BATCH_SIZE }
fn default_max_diff_workers() -> usize { MAX_DIFF_WORKERS }
fn default_max_memorized_cases() -> usize { MAX_MEMORIZED_CASES }
fn default_status_interval_secs() -> u64 { STATUS_INTERVAL.as_secs() }

impl DiffConfig {
  pub fn load(file: &Path, overrides: Overrides) -> anyhow::Result<Self> {
    let path_string = |p: Option<PathBuf>| p.map(|p| p.display().to_string());
    let settings = config::Config::builder()
      .add_source(config::File::from(file).required(false))
      .add_source(config::Environment::with_prefix("CASEDIFF"))
      .set_override_option("state_dir", path_string(overrides.state_dir))?
      .set_override_option("docs_dir", path_string(overrides.docs_dir))?
      .set_override_option("batch_size", overrides.batch_size)?
      .build()
      .context("failed to read config file")?;
    settings
      .try_deserialize()
      .context("failed to deserialise DiffConfig")
  }

  pub fn state_path(&self, domain: &str) -> PathBuf {
    self.state_dir.join("db").join(format!("{domain}.db"))
  }

  pub fn old_loader(&self, domain: &str) -> JsonDirLoader {
    JsonDirLoader::new(self.docs_dir.join(domain).join("old"))
  }

  pub fn new_loader(&self, domain: &str) -> JsonDirLoader {
    JsonDirLoader::new(self.docs_dir.join(domain).join("new"))
  }

  pub fn queue_settings(&self) -> QueueSettings {
    QueueSettings {
      batch_size:          self.batch_size,
      max_diff_workers:    self.max_diff_workers,
      max_memorized_cases: self.max_memorized_cases,
      status_interval:     self.status_interval(),
    }
  }

  pub fn status_interval(&self) -> Duration { Duration::from_secs(self.status_interval_secs) }

  pub fn rules(&self) -> anyhow::Result<RuleSet> {
    let mut rules = case_rules();
    rules
      .extend_from_specs(self.ignore_rules.iter().cloned())
      .context("invalid ignore rule")?;
    Ok(rules)
  }
}
