//! `casediff show` and `casediff filter`: read and re-filter stored diffs.

use std::{collections::HashMap, io::Write, str::FromStr};

use casediff_core::{
  case::Document,
  diff::{DocDiffs, display_value, format_path},
  loader::DocumentLoader,
  rule::RuleSet,
};
use casediff_queue::loader::JsonDirLoader;
use casediff_store_sqlite::{DocFilter, SqliteStateStore};

/// `kind[:id,id,...]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindSelection(pub DocFilter);

impl FromStr for KindSelection {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (kind, ids) = match s.split_once(':') {
      Some((kind, ids)) => (kind, ids.split(',').map(str::trim).filter(|id| !id.is_empty()).collect()),
      None => (s, vec![]),
    };
    if kind.is_empty() {
      return Err(format!("no document kind in {s:?}"));
    }
    Ok(Self(DocFilter {
      kinds: vec![kind.to_owned()],
      ids:   ids.into_iter().map(String::from).collect(),
    }))
  }
}

// ─── show ────────────────────────────────────────────────────────────────────

const CSV_HEADER: &str = "kind,doc_id,diff_type,path,old_value,new_value,reason";

fn csv_field(value: &str) -> String {
  if value.contains([',', '"', '\n', '\r']) {
    format!("\"{}\"", value.replace('"', "\"\""))
  } else {
    value.to_owned()
  }
}

/// Write `docs` as text or CSV. Changes carry their reason; diffs leave the
/// reason column empty.
pub fn write_docs(out: &mut impl Write, docs: &[DocDiffs], csv: bool) -> std::io::Result<()> {
  if csv {
    writeln!(out, "{CSV_HEADER}")?;
    for doc in docs {
      let rows = doc
        .diffs
        .iter()
        .map(|diff| (diff, ""))
        .chain(doc.changes.iter().map(|c| (&c.diff, c.reason.as_str())));
      for (diff, reason) in rows {
        let fields = [
          doc.kind.clone(),
          doc.doc_id.clone(),
          diff.diff_type.to_string(),
          format_path(&diff.path),
          display_value(diff.old_value.as_ref()),
          display_value(diff.new_value.as_ref()),
          reason.to_owned(),
        ];
        let row: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
        writeln!(out, "{}", row.join(","))?;
      }
    }
    return Ok(());
  }

  for doc in docs {
    writeln!(out, "{} {}", doc.kind, doc.doc_id)?;
    for diff in &doc.diffs {
      writeln!(out, "  {diff}")?;
    }
    for change in &doc.changes {
      writeln!(out, "  {} ({})", change.diff, change.reason)?;
    }
  }
  Ok(())
}

pub async fn show(
  store: &SqliteStateStore,
  filter: &DocFilter,
  changes: bool,
  csv: bool,
) -> anyhow::Result<()> {
  let docs = if changes { store.doc_changes(filter).await? } else { store.doc_diffs(filter).await? };
  write_docs(&mut std::io::stdout().lock(), &docs, csv)?;
  if !csv {
    let counters = store.counters().await?;
    for (kind, count) in counters {
      println!("{kind}: {count} diffed");
    }
  }
  Ok(())
}

// ─── filter ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default, PartialEq, Eq)]
pub struct FilterReport {
  pub docs:    usize,
  pub removed: usize,
  /// Removed diffs that became changes.
  pub changes: usize,
  /// Documents that could not be loaded and were left as they were.
  pub skipped: usize,
}

async fn load_map(loader: &JsonDirLoader, ids: &[String]) -> anyhow::Result<HashMap<String, Document>> {
  Ok(loader.load(ids).await?.into_iter().map(|doc| (doc.id.clone(), doc)).collect())
}

/// Run `rules` over the stored diffs again, replacing them unless
/// `dry_run`. New changes are added to the ones already stored.
pub async fn filter(
  store: &SqliteStateStore,
  old: &JsonDirLoader,
  new: &JsonDirLoader,
  rules: &RuleSet,
  dry_run: bool,
) -> anyhow::Result<FilterReport> {
  let stored = store.doc_diffs(&DocFilter::default()).await?;
  let ids: Vec<String> = stored.iter().map(|doc| doc.doc_id.clone()).collect();
  let old_docs = load_map(old, &ids).await?;
  let new_docs = load_map(new, &ids).await?;

  let mut report = FilterReport::default();
  for doc in stored {
    report.docs += 1;
    let (Some(old_doc), Some(new_doc)) = (old_docs.get(&doc.doc_id), new_docs.get(&doc.doc_id))
    else {
      report.skipped += 1;
      continue;
    };
    let before = doc.diffs.len();
    let filtered = rules.filter_with_changes(&doc.kind, old_doc.to_json(), new_doc.to_json(), doc.diffs);
    if filtered.diffs.len() >= before && filtered.changes.is_empty() {
      continue;
    }
    report.removed += before.saturating_sub(filtered.diffs.len());
    report.changes += filtered.changes.len();
    if dry_run {
      continue;
    }
    store.replace_diffs(&doc.kind, &doc.doc_id, filtered.diffs).await?;
    if !filtered.changes.is_empty() {
      let filter = DocFilter { kinds: vec![doc.kind.clone()], ids: vec![doc.doc_id.clone()] };
      let mut changes: Vec<_> = store
        .doc_changes(&filter)
        .await?
        .into_iter()
        .flat_map(|doc| doc.changes)
        .collect();
      changes.extend(filtered.changes);
      store.replace_changes(&doc.kind, &doc.doc_id, changes).await?;
    }
  }
  Ok(report)
}

#[cfg(test)]
mod tests {
  use casediff_core::{
    builtin::CASE_KIND,
    diff::{Change, Diff, DiffType, path},
    rule::IgnoreRule,
    store::StateStore,
  };
  use serde_json::json;

  use super::*;

  fn stored(diffs: Vec<Diff>) -> DocDiffs {
    DocDiffs { kind: CASE_KIND.into(), doc_id: "c1".into(), diffs, changes: vec![] }
  }

  #[test]
  fn kind_selection_parses_ids() {
    let KindSelection(filter) = "CommCareCase:a, b".parse().unwrap();
    assert_eq!(filter.kinds, ["CommCareCase"]);
    assert_eq!(filter.ids, ["a", "b"]);
    assert!(":a".parse::<KindSelection>().is_err());
  }

  #[test]
  fn csv_quotes_awkward_values() {
    let mut doc = stored(vec![Diff::new(
      DiffType::Diff,
      path(["name"]),
      Some(json!("a,b")),
      Some(json!("c")),
    )]);
    doc.changes.push(Change {
      diff:   Diff::new(DiffType::Missing, path(["x"]), Some(json!(1)), None),
      reason: "dropped".into(),
    });
    let mut out = vec![];
    write_docs(&mut out, &[doc], true).unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], CSV_HEADER);
    assert_eq!(lines[1], r#"CommCareCase,c1,diff,name,"""a,b""","""c""","#);
    assert!(lines[2].ends_with(",MISSING,dropped"));
  }

  #[tokio::test]
  async fn filter_moves_explained_diffs_to_changes() {
    let dir = tempfile::tempdir().unwrap();
    for (side, name) in [("old", "a"), ("new", "b")] {
      let side_dir = dir.path().join(side);
      std::fs::create_dir_all(&side_dir).unwrap();
      let doc = json!({"doc_type": CASE_KIND, "name": name, "age": 1});
      std::fs::write(side_dir.join("c1.json"), doc.to_string()).unwrap();
    }
    let store = SqliteStateStore::open_in_memory().await.unwrap();
    let name = Diff::new(DiffType::Diff, path(["name"]), Some(json!("a")), Some(json!("b")));
    let age = Diff::new(DiffType::Diff, path(["age"]), Some(json!(1)), Some(json!(2)));
    store.save_diff_results(vec![stored(vec![name.clone(), age.clone()])]).await.unwrap();

    let rules = RuleSet::new().with(
      CASE_KIND,
      IgnoreRule::ignore(Some(DiffType::Diff), path(["name"])).with_reason("renamed"),
    );
    let old = JsonDirLoader::new(dir.path().join("old"));
    let new = JsonDirLoader::new(dir.path().join("new"));

    let report = filter(&store, &old, &new, &rules, true).await.unwrap();
    assert_eq!(report, FilterReport { docs: 1, removed: 1, changes: 1, skipped: 0 });
    assert_eq!(store.doc_diffs(&DocFilter::default()).await.unwrap()[0].diffs.len(), 2);

    filter(&store, &old, &new, &rules, false).await.unwrap();
    assert_eq!(store.doc_diffs(&DocFilter::default()).await.unwrap()[0].diffs, vec![age]);
    let changes = store.doc_changes(&DocFilter::default()).await.unwrap();
    assert_eq!(changes[0].changes, vec![Change { diff: name, reason: "renamed".into() }]);
  }
}
