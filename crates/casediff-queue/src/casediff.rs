//! Diffing loaded case documents against their migrated counterparts.

use std::collections::HashMap;

use casediff_core::{
  case::Document,
  diff::{Diff, DiffType, DocDiffs, json_diff, path},
  loader::DocumentLoader,
  rule::RuleSet,
  store::StateStore,
};
use serde_json::json;

use crate::{Error, Result};

/// Diff each old document against the new document with the same id.
///
/// A new document that does not exist produces a single `missing` diff at
/// path `*`. Diffs explained by `rules` are dropped, or reported as changes
/// when the matching rule carries a reason.
pub async fn diff_documents<L: DocumentLoader>(
  new_loader: &L,
  rules: &RuleSet,
  old_docs: &[Document],
) -> Result<Vec<DocDiffs>> {
  let ids: Vec<String> = old_docs.iter().map(|doc| doc.id.clone()).collect();
  let new_docs: HashMap<String, Document> = new_loader
    .load(&ids)
    .await
    .map_err(Error::loader)?
    .into_iter()
    .map(|doc| (doc.id.clone(), doc))
    .collect();

  let results = old_docs
    .iter()
    .map(|old| {
      let kind = old.kind().to_owned();
      let Some(new) = new_docs.get(&old.id) else {
        return DocDiffs {
          kind,
          doc_id: old.id.clone(),
          diffs: vec![Diff::new(DiffType::Missing, path(["*"]), Some(json!("?")), None)],
          changes: vec![],
        };
      };
      let diffs = json_diff(old.to_json(), new.to_json());
      let filtered = rules.filter_with_changes(&kind, old.to_json(), new.to_json(), diffs);
      if !filtered.diffs.is_empty() {
        tracing::debug!(doc_id = %old.id, diffs = filtered.diffs.len(), "case has diffs");
      }
      DocDiffs { kind, doc_id: old.id.clone(), diffs: filtered.diffs, changes: filtered.changes }
    })
    .collect();
  Ok(results)
}

/// Diff `old_docs` and persist the results, returning them.
pub async fn diff_and_save<S, L>(
  store: &S,
  new_loader: &L,
  rules: &RuleSet,
  old_docs: &[Document],
) -> Result<Vec<DocDiffs>>
where
  S: StateStore,
  L: DocumentLoader,
{
  let results = diff_documents(new_loader, rules, old_docs).await?;
  store.save_diff_results(results.clone()).await.map_err(Error::store)?;
  Ok(results)
}
