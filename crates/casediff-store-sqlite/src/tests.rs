//! Integration tests for `SqliteStateStore` against in-memory and on-disk
//! databases.

use casediff_core::{
  case::CaseRecord,
  diff::{Change, Diff, DiffType, DocDiffs, path},
  store::{PAGE_SIZE, StateStore},
};
use serde_json::json;

use crate::{DocFilter, Error, SqliteStateStore};

async fn store() -> SqliteStateStore {
  SqliteStateStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn record(id: &str, total: u32, processed: u32) -> CaseRecord {
  CaseRecord {
    id:                   id.into(),
    total_operations:     total,
    processed_operations: processed,
  }
}

fn diff(field: &str, old: i64, new: i64) -> Diff {
  Diff::new(DiffType::Diff, path([field]), Some(json!(old)), Some(json!(new)))
}

fn result(id: &str, diffs: Vec<Diff>) -> DocDiffs {
  DocDiffs { kind: "CommCareCase".into(), doc_id: id.into(), diffs, changes: vec![] }
}

// ─── Operation counts ────────────────────────────────────────────────────────

#[tokio::test]
async fn update_keeps_max_total_and_adds_processed() {
  let s = store().await;

  let counts = s.update_entities(vec![record("a", 5, 1)]).await.unwrap();
  assert_eq!((counts[0].total, counts[0].processed), (5, 1));

  let counts = s.update_entities(vec![record("a", 3, 2)]).await.unwrap();
  assert_eq!((counts[0].total, counts[0].processed), (5, 3));

  let counts = s.update_entities(vec![record("a", 7, 0)]).await.unwrap();
  assert_eq!((counts[0].total, counts[0].processed), (7, 3));
  assert!(!counts[0].is_complete());

  assert_eq!(s.total_operations("a".into()).await.unwrap(), Some(7));
  assert_eq!(s.total_operations("nope".into()).await.unwrap(), None);
}

#[tokio::test]
async fn processed_increment_reports_unknown_entities() {
  let s = store().await;
  s.update_entities(vec![record("a", 2, 0)]).await.unwrap();

  let counts = s
    .add_processed_operations(vec![("a".into(), 2), ("b".into(), 1)])
    .await
    .unwrap();
  assert_eq!(counts[0].total, Some(2));
  assert_eq!(counts[0].processed, 2);
  assert_eq!(counts[1].total, None);
  assert_eq!(counts[1].processed, 1);

  // Unknown entities are not inserted.
  assert_eq!(s.total_operations("b".into()).await.unwrap(), None);
}

#[tokio::test]
async fn unprocessed_scan_pages_through_everything() {
  let s = store().await;
  let records: Vec<_> = (0..PAGE_SIZE + 10)
    .map(|i| record(&format!("case-{i:05}"), 2, u32::from(i % 3 == 0) * 2))
    .collect();
  let expected: Vec<_> = records
    .iter()
    .filter(|r| !r.is_complete())
    .map(|r| (r.id.clone(), 2))
    .collect();
  s.update_entities(records).await.unwrap();

  let mut scan = s.iter_entities_with_unprocessed_operations();
  let mut seen = vec![];
  while let Some(item) = scan.next().await.unwrap() {
    seen.push(item);
  }
  assert_eq!(seen, expected);
}

// ─── Durable diff queue ──────────────────────────────────────────────────────

#[tokio::test]
async fn saving_results_drains_diff_queue() {
  let s = store().await;
  s.add_to_diff_queue(vec!["a".into(), "b".into(), "a".into()]).await.unwrap();
  assert_eq!(s.count_undiffed().await.unwrap(), 2);

  s.save_diff_results(vec![result("a", vec![])]).await.unwrap();
  assert_eq!(s.iter_undiffed_ids().collect().await.unwrap(), ["b"]);
  assert_eq!(s.counters().await.unwrap()["CommCareCase"], 1);
}

// ─── Diff results ────────────────────────────────────────────────────────────

#[tokio::test]
async fn later_results_replace_earlier_ones() {
  let s = store().await;
  s.save_diff_results(vec![result("a", vec![diff("x", 1, 2)])]).await.unwrap();
  s.save_diff_results(vec![result("a", vec![diff("y", 1, 2)])]).await.unwrap();

  let stored = s.doc_diffs(&DocFilter::default()).await.unwrap();
  assert_eq!(stored.len(), 1);
  assert_eq!(stored[0].diffs, vec![diff("y", 1, 2)]);

  // An empty result clears the document entirely.
  s.save_diff_results(vec![result("a", vec![])]).await.unwrap();
  assert!(s.doc_diffs(&DocFilter::default()).await.unwrap().is_empty());
  assert!(s.ids_with_diffs(&[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn changes_are_stored_apart_from_diffs() {
  let s = store().await;
  let change = Change { diff: diff("server_modified_on", 1, 2), reason: "rebuilt".into() };
  s.save_diff_results(vec![DocDiffs {
    kind:    "CommCareCase".into(),
    doc_id:  "a".into(),
    diffs:   vec![diff("name", 1, 2)],
    changes: vec![change.clone()],
  }])
  .await
  .unwrap();

  let changes = s.doc_changes(&DocFilter::kinds(["CommCareCase"])).await.unwrap();
  assert_eq!(changes[0].changes, vec![change]);
  assert_eq!(s.ids_with_changes(&["CommCareCase".into()]).await.unwrap(), ["a"]);

  s.replace_changes("CommCareCase", "a", vec![]).await.unwrap();
  assert!(s.ids_with_changes(&[]).await.unwrap().is_empty());
  assert_eq!(s.ids_with_diffs(&[]).await.unwrap(), ["a"]);
}

#[tokio::test]
async fn doc_filter_selects_by_id() {
  let s = store().await;
  s.save_diff_results(vec![
    result("a", vec![diff("x", 1, 2)]),
    result("b", vec![diff("x", 1, 3)]),
  ])
  .await
  .unwrap();

  let filter = DocFilter { kinds: vec![], ids: vec!["b".into()] };
  let stored = s.doc_diffs(&filter).await.unwrap();
  assert_eq!(stored.len(), 1);
  assert_eq!(stored[0].doc_id, "b");
}

#[tokio::test]
async fn missing_docs_are_recorded_once() {
  let s = store().await;
  s.add_missing_docs("CommCareCase".into(), vec!["a".into(), "b".into()]).await.unwrap();
  s.add_missing_docs("CommCareCase".into(), vec!["a".into()]).await.unwrap();
  assert_eq!(s.missing_docs("CommCareCase").await.unwrap(), ["a", "b"]);
}

// ─── Resume state ────────────────────────────────────────────────────────────

#[tokio::test]
async fn pop_without_save_is_refused() {
  let s = store().await;

  let state = s.pop_resume_state("q".into(), json!({})).await.unwrap();
  assert_eq!(state, json!({}));

  let err = s.pop_resume_state("q".into(), json!({})).await.unwrap_err();
  assert!(matches!(err, Error::ResumeNotAllowed(key) if key == "q"));

  s.set_resume_state("q".into(), json!({"to_diff": ["a"]})).await.unwrap();
  let state = s.pop_resume_state("q".into(), json!({})).await.unwrap();
  assert_eq!(state, json!({"to_diff": ["a"]}));
}

#[tokio::test]
async fn key_values_round_trip_json() {
  let s = store().await;
  assert_eq!(s.get_value("flag".into()).await.unwrap(), None);
  s.set_value("flag".into(), json!(true)).await.unwrap();
  assert_eq!(s.get_value("flag".into()).await.unwrap(), Some(json!(true)));
}

#[tokio::test]
async fn reset_clears_everything() {
  let s = store().await;
  s.update_entities(vec![record("a", 2, 0)]).await.unwrap();
  s.save_diff_results(vec![result("a", vec![diff("x", 1, 2)])]).await.unwrap();
  s.reset().await.unwrap();
  assert!(s.counters().await.unwrap().is_empty());
  assert!(s.ids_with_diffs(&[]).await.unwrap().is_empty());
  assert_eq!(s.total_operations("a".into()).await.unwrap(), None);
}

// ─── Cloning child state ─────────────────────────────────────────────────────

#[tokio::test]
async fn clone_copies_case_state_from_child() {
  let dir = tempfile::tempdir().unwrap();
  let child_path = dir.path().join("child.db");
  let parent = SqliteStateStore::open(dir.path().join("parent.db")).await.unwrap();
  let child = SqliteStateStore::open(&child_path).await.unwrap();

  parent.add_to_diff_queue(vec!["a".into(), "b".into()]).await.unwrap();
  parent.set_value("other".into(), json!(1)).await.unwrap();

  child.update_entities(vec![record("c", 3, 1)]).await.unwrap();
  child.save_diff_results(vec![result("a", vec![diff("x", 1, 2)])]).await.unwrap();
  child.add_to_diff_queue(vec!["d".into()]).await.unwrap();
  child.set_resume_state("CaseDiffQueue".into(), json!({"num_diffed_cases": 1})).await.unwrap();
  child.set_value("ProcessNotAllowed".into(), json!(true)).await.unwrap();
  drop(child);

  parent.clone_partial_state_from(&child_path).await.unwrap();

  assert_eq!(parent.total_operations("c".into()).await.unwrap(), Some(3));
  assert_eq!(parent.ids_with_diffs(&[]).await.unwrap(), ["a"]);
  assert_eq!(parent.iter_undiffed_ids().collect().await.unwrap(), ["b", "d"]);
  assert_eq!(parent.counters().await.unwrap()["CommCareCase"], 1);
  assert_eq!(
    parent.pop_resume_state("CaseDiffQueue".into(), json!({})).await.unwrap(),
    json!({"num_diffed_cases": 1}),
  );
  assert_eq!(parent.get_value("ProcessNotAllowed".into()).await.unwrap(), None);
  assert_eq!(parent.get_value("other".into()).await.unwrap(), Some(json!(1)));
}

#[tokio::test]
async fn clone_refuses_unknown_kinds() {
  let dir = tempfile::tempdir().unwrap();
  let child_path = dir.path().join("child.db");
  let parent = SqliteStateStore::open(dir.path().join("parent.db")).await.unwrap();
  let child = SqliteStateStore::open(&child_path).await.unwrap();

  child.increment_counter("XFormInstance", 1).await.unwrap();
  drop(child);

  let err = parent.clone_partial_state_from(&child_path).await.unwrap_err();
  assert!(matches!(err, Error::CloneNotAllowed(_)));
  assert!(parent.counters().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_clone_leaves_parent_usable() {
  let dir = tempfile::tempdir().unwrap();
  let parent = SqliteStateStore::open(dir.path().join("parent.db")).await.unwrap();

  let broken_path = dir.path().join("broken.db");
  let broken = SqliteStateStore::open(&broken_path).await.unwrap();
  broken.update_entities(vec![record("c", 3, 1)]).await.unwrap();
  drop(broken);
  let conn = rusqlite::Connection::open(&broken_path).unwrap();
  conn.execute_batch("DROP TABLE diff_queue").unwrap();
  drop(conn);

  let err = parent.clone_partial_state_from(&broken_path).await.unwrap_err();
  assert!(!matches!(err, Error::CloneNotAllowed(_)));
  assert_eq!(parent.total_operations("c".into()).await.unwrap(), None);

  let child_path = dir.path().join("child.db");
  let child = SqliteStateStore::open(&child_path).await.unwrap();
  child.update_entities(vec![record("d", 2, 2)]).await.unwrap();
  drop(child);

  parent.clone_partial_state_from(&child_path).await.unwrap();
  assert_eq!(parent.total_operations("d".into()).await.unwrap(), Some(2));
  assert_eq!(parent.total_operations("c".into()).await.unwrap(), None);
}
