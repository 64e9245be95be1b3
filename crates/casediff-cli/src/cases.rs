//! `casediff cases`: diff a selection of cases directly, without a queue.

use std::{path::PathBuf, str::FromStr, sync::Arc};

use anyhow::{Context as _, bail};
use casediff_core::{
  builtin::{CASE_KIND, CASE_KINDS},
  diff::DocDiffs,
  loader::DocumentLoader,
  rule::RuleSet,
  store::StateStore,
};
use casediff_queue::{casediff::diff_and_save, loader::JsonDirLoader, pool::ParallelPool};
use casediff_store_sqlite::SqliteStateStore;

/// Which cases to diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
  /// Cases in the durable diff queue.
  Pending,
  WithDiffs,
  WithChanges,
  /// A file with one case id per line.
  File(PathBuf),
  Ids(Vec<String>),
}

impl FromStr for Selection {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(match s {
      "pending" => Self::Pending,
      "with-diffs" => Self::WithDiffs,
      "with-changes" => Self::WithChanges,
      _ if s.starts_with('/') || s.starts_with("./") => Self::File(PathBuf::from(s)),
      _ => {
        let ids: Vec<String> =
          s.split(',').map(str::trim).filter(|id| !id.is_empty()).map(String::from).collect();
        if ids.is_empty() {
          return Err(format!("no case ids in {s:?}"));
        }
        Self::Ids(ids)
      }
    })
  }
}

impl Selection {
  pub async fn case_ids(&self, store: &SqliteStateStore) -> anyhow::Result<Vec<String>> {
    let kinds: Vec<String> = CASE_KINDS.iter().map(|k| (*k).to_owned()).collect();
    Ok(match self {
      Self::Pending => store.iter_undiffed_ids().collect().await?,
      Self::WithDiffs => store.ids_with_diffs(&kinds).await?,
      Self::WithChanges => store.ids_with_changes(&kinds).await?,
      Self::File(path) => tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read case ids from {}", path.display()))?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect(),
      Self::Ids(ids) => ids.clone(),
    })
  }
}

pub struct Loaders {
  pub old: Arc<JsonDirLoader>,
  pub new: Arc<JsonDirLoader>,
}

/// Load and diff one batch of case ids, recording the ids with no old
/// document as missing.
async fn diff_batch(
  store: &SqliteStateStore,
  loaders: &Loaders,
  rules: &RuleSet,
  ids: Vec<String>,
) -> anyhow::Result<Vec<DocDiffs>> {
  let docs = loaders.old.load(&ids).await?;
  if docs.len() < ids.len() {
    let missing: Vec<String> =
      ids.into_iter().filter(|id| !docs.iter().any(|doc| &doc.id == id)).collect();
    tracing::error!(cases = ?missing, "cases not found");
    store.add_missing_docs(CASE_KIND.into(), missing).await?;
  }
  Ok(diff_and_save(store, loaders.new.as_ref(), rules, &docs).await?)
}

pub async fn run(
  store: Arc<SqliteStateStore>,
  loaders: Loaders,
  rules: Arc<RuleSet>,
  selection: &Selection,
  batch_size: usize,
  workers: usize,
  stop: bool,
) -> anyhow::Result<()> {
  let ids = selection.case_ids(&store).await?;
  tracing::info!("diffing {} cases", ids.len());
  let batches: Vec<Vec<String>> = ids.chunks(batch_size.max(1)).map(<[String]>::to_vec).collect();

  let mut diffed = 0;
  let mut with_diffs = 0;
  if stop {
    for batch in batches {
      for result in diff_batch(&store, &loaders, &rules, batch).await? {
        diffed += 1;
        if !result.diffs.is_empty() {
          print_diffs(&result);
          return Ok(());
        }
      }
    }
  } else {
    let loaders = Arc::new(loaders);
    let pool = ParallelPool::new(workers);
    let mut results = pool.map(batches, move |batch| {
      let store = Arc::clone(&store);
      let loaders = Arc::clone(&loaders);
      let rules = Arc::clone(&rules);
      async move { diff_batch(&store, &loaders, &rules, batch).await }
    });
    while let Some(batch) = results.next().await {
      diffed += batch.len();
      with_diffs += batch.iter().filter(|result| !result.diffs.is_empty()).count();
    }
  }
  tracing::info!("diffed {diffed} cases, {with_diffs} with diffs");
  Ok(())
}

/// Fail when cases are left in the durable diff queue.
pub async fn check_undiffed(store: &SqliteStateStore, selection: &Selection) -> anyhow::Result<()> {
  let pending = store.count_undiffed().await?;
  if pending > 0 {
    let hint = if *selection == Selection::Pending {
      "some cases could not be diffed"
    } else {
      "re-run with --select pending"
    };
    bail!("{pending} cases have not been diffed; {hint}");
  }
  Ok(())
}

pub fn print_diffs(result: &DocDiffs) {
  println!("{} {}", result.kind, result.doc_id);
  for diff in &result.diffs {
    println!("  {diff}");
  }
  for change in &result.changes {
    println!("  {} ({})", change.diff, change.reason);
  }
}

#[cfg(test)]
mod tests {
  use casediff_core::builtin::case_rules;
  use serde_json::json;

  use super::*;

  #[test]
  fn selections_parse() {
    assert_eq!("pending".parse::<Selection>().unwrap(), Selection::Pending);
    assert_eq!("with-changes".parse::<Selection>().unwrap(), Selection::WithChanges);
    assert_eq!(
      "./ids.txt".parse::<Selection>().unwrap(),
      Selection::File(PathBuf::from("./ids.txt"))
    );
    assert_eq!(
      "a, b".parse::<Selection>().unwrap(),
      Selection::Ids(vec!["a".into(), "b".into()])
    );
    assert!(",".parse::<Selection>().is_err());
  }

  fn write_doc(dir: &std::path::Path, id: &str, doc: serde_json::Value) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join(format!("{id}.json")), doc.to_string()).unwrap();
  }

  #[tokio::test]
  async fn pending_cases_are_diffed_and_drained() {
    let dir = tempfile::tempdir().unwrap();
    let (old_dir, new_dir) = (dir.path().join("old"), dir.path().join("new"));
    write_doc(&old_dir, "c1", json!({"doc_type": CASE_KIND, "name": "a"}));
    write_doc(&new_dir, "c1", json!({"doc_type": CASE_KIND, "name": "b"}));
    write_doc(&old_dir, "c2", json!({"doc_type": CASE_KIND, "name": "a"}));
    write_doc(&new_dir, "c2", json!({"doc_type": CASE_KIND, "name": "a"}));

    let store = Arc::new(SqliteStateStore::open_in_memory().await.unwrap());
    store.add_to_diff_queue(vec!["c1".into(), "c2".into(), "c3".into()]).await.unwrap();
    let loaders = Loaders {
      old: Arc::new(JsonDirLoader::new(old_dir)),
      new: Arc::new(JsonDirLoader::new(new_dir)),
    };

    run(Arc::clone(&store), loaders, Arc::new(case_rules()), &Selection::Pending, 2, 2, false)
      .await
      .unwrap();

    assert_eq!(store.ids_with_diffs(&[]).await.unwrap(), ["c1"]);
    assert_eq!(store.missing_docs(CASE_KIND).await.unwrap(), ["c3"]);
    assert_eq!(store.iter_undiffed_ids().collect().await.unwrap(), ["c3"]);
    assert!(check_undiffed(&store, &Selection::Pending).await.is_err());
  }
}
