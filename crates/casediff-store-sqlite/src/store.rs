//! [`SqliteStateStore`]: the SQLite implementation of [`StateStore`].

use std::{
  collections::{BTreeMap, HashSet},
  path::Path,
};

use casediff_core::{
  builtin::CASE_KINDS,
  case::CaseRecord,
  diff::{Change, Diff, DocDiffs},
  store::{EntityCounts, ProcessedCounts, StateStore},
};
use rusqlite::OptionalExtension as _;
use serde_json::Value;

use crate::{
  Error, Result,
  encode::{
    EncodedResult, RESUME_NOT_ALLOWED, RawDocRow, decode_count, decode_value, encode_changes,
    encode_count, encode_diffs, encode_value, now, resume_key,
  },
  schema::{SCHEMA, TABLES},
};

/// Resume-state keys a child diff process may own.
const CLONEABLE_KEYS: &[&str] = &["resume-CaseDiffQueue"];

/// Keys a child store may hold that are never copied back.
const LOCAL_KEYS: &[&str] = &["ProcessNotAllowed"];

/// Selects documents when reading diffs or changes back. Empty lists select
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocFilter {
  pub kinds: Vec<String>,
  pub ids:   Vec<String>,
}

impl DocFilter {
  pub fn kinds(kinds: impl IntoIterator<Item = impl Into<String>>) -> Self {
    Self { kinds: kinds.into_iter().map(Into::into).collect(), ids: vec![] }
  }

  fn where_clause(&self) -> (String, Vec<String>) {
    let mut conds = vec![];
    let mut params = vec![];
    for (column, values) in [("kind", &self.kinds), ("doc_id", &self.ids)] {
      if !values.is_empty() {
        let marks = vec!["?"; values.len()].join(", ");
        conds.push(format!("{column} IN ({marks})"));
        params.extend(values.iter().cloned());
      }
    }
    let clause = if conds.is_empty() {
      String::new()
    } else {
      format!("WHERE {}", conds.join(" AND "))
    };
    (clause, params)
  }
}

enum Popped {
  Absent,
  NotAllowed,
  Saved(String),
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// Case diff state backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStateStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStateStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  // ── Diffs and changes ─────────────────────────────────────────────────

  /// Replace the diffs stored for `(kind, doc_id)`. An empty set deletes
  /// the row.
  pub async fn replace_diffs(&self, kind: &str, doc_id: &str, diffs: Vec<Diff>) -> Result<()> {
    let payload = (!diffs.is_empty()).then(|| encode_diffs(&diffs)).transpose()?;
    self.replace_payload("diffs", kind, doc_id, payload).await
  }

  /// Replace the changes stored for `(kind, doc_id)`.
  pub async fn replace_changes(
    &self,
    kind: &str,
    doc_id: &str,
    changes: Vec<Change>,
  ) -> Result<()> {
    let payload = (!changes.is_empty()).then(|| encode_changes(&changes)).transpose()?;
    self.replace_payload("changes", kind, doc_id, payload).await
  }

  async fn replace_payload(
    &self,
    table: &'static str,
    kind: &str,
    doc_id: &str,
    payload: Option<String>,
  ) -> Result<()> {
    let kind = kind.to_owned();
    let doc_id = doc_id.to_owned();
    let at = now();

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
          &format!("DELETE FROM {table} WHERE kind = ?1 AND doc_id = ?2"),
          rusqlite::params![kind, doc_id],
        )?;
        if let Some(payload) = payload {
          tx.execute(
            &format!(
              "INSERT INTO {table} (kind, doc_id, payload, recorded_at) VALUES (?1, ?2, ?3, ?4)"
            ),
            rusqlite::params![kind, doc_id, payload, at],
          )?;
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn read_rows(&self, table: &'static str, filter: &DocFilter) -> Result<Vec<RawDocRow>> {
    let (where_clause, params) = filter.where_clause();

    let rows = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT kind, doc_id, payload FROM {table} {where_clause} ORDER BY kind, doc_id"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params_from_iter(params), |row| {
            Ok(RawDocRow {
              kind:    row.get(0)?,
              doc_id:  row.get(1)?,
              payload: row.get(2)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(rows)
  }

  /// Stored diffs, one entry per document.
  pub async fn doc_diffs(&self, filter: &DocFilter) -> Result<Vec<DocDiffs>> {
    self
      .read_rows("diffs", filter)
      .await?
      .into_iter()
      .map(RawDocRow::into_diffs)
      .collect()
  }

  /// Stored changes, one entry per document.
  pub async fn doc_changes(&self, filter: &DocFilter) -> Result<Vec<DocDiffs>> {
    self
      .read_rows("changes", filter)
      .await?
      .into_iter()
      .map(RawDocRow::into_changes)
      .collect()
  }

  async fn ids_in(&self, table: &'static str, kinds: &[String]) -> Result<Vec<String>> {
    let filter = DocFilter { kinds: kinds.to_vec(), ids: vec![] };
    let (where_clause, params) = filter.where_clause();

    let ids = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT DISTINCT doc_id FROM {table} {where_clause} ORDER BY doc_id"
        ))?;
        let ids = stmt
          .query_map(rusqlite::params_from_iter(params), |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
      })
      .await?;
    Ok(ids)
  }

  /// Ids of documents of the given kinds that have diffs.
  pub async fn ids_with_diffs(&self, kinds: &[String]) -> Result<Vec<String>> {
    self.ids_in("diffs", kinds).await
  }

  /// Ids of documents of the given kinds that have changes.
  pub async fn ids_with_changes(&self, kinds: &[String]) -> Result<Vec<String>> {
    self.ids_in("changes", kinds).await
  }

  /// Ids recorded as missing from a bulk load.
  pub async fn missing_docs(&self, kind: &str) -> Result<Vec<String>> {
    let kind = kind.to_owned();
    let ids = self
      .conn
      .call(move |conn| {
        let mut stmt =
          conn.prepare("SELECT doc_id FROM missing_docs WHERE kind = ?1 ORDER BY doc_id")?;
        let ids = stmt
          .query_map([kind], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
      })
      .await?;
    Ok(ids)
  }

  // ── Counters ──────────────────────────────────────────────────────────

  #[cfg(test)]
  pub async fn increment_counter(&self, kind: &str, n: i64) -> Result<()> {
    let kind = kind.to_owned();
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO counts (kind, value) VALUES (?1, ?2)
           ON CONFLICT(kind) DO UPDATE SET value = value + excluded.value",
          rusqlite::params![kind, n],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Diffed-document counters by kind.
  pub async fn counters(&self) -> Result<BTreeMap<String, i64>> {
    let counts = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare("SELECT kind, value FROM counts")?;
        let rows = stmt
          .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
          .collect::<rusqlite::Result<BTreeMap<String, i64>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(counts)
  }

  /// Permanently delete diffs, changes, counters and all progress.
  pub async fn reset(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        let tx = conn.transaction()?;
        for table in TABLES {
          tx.execute(&format!("DELETE FROM {table}"), [])?;
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    tracing::info!("state store reset");
    Ok(())
  }
}

// ─── StateStore impl ─────────────────────────────────────────────────────────

impl StateStore for SqliteStateStore {
  type Error = Error;

  // ── Operation counts ──────────────────────────────────────────────────

  async fn update_entities(&self, records: Vec<CaseRecord>) -> Result<Vec<EntityCounts>> {
    let rows: Vec<(String, i64, i64)> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let mut rows = Vec::with_capacity(records.len());
        {
          let mut upsert = tx.prepare(
            "INSERT INTO entity_operations (id, total, processed) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
               total     = MAX(total, excluded.total),
               processed = processed + excluded.processed
             RETURNING total, processed",
          )?;
          for rec in records {
            let (total, processed) = upsert.query_row(
              rusqlite::params![
                rec.id,
                encode_count(rec.total_operations),
                encode_count(rec.processed_operations),
              ],
              |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            rows.push((rec.id, total, processed));
          }
        }
        tx.commit()?;
        Ok(rows)
      })
      .await?;

    rows
      .into_iter()
      .map(|(id, total, processed)| {
        Ok(EntityCounts { id, total: decode_count(total)?, processed: decode_count(processed)? })
      })
      .collect()
  }

  async fn add_processed_operations(
    &self,
    deltas: Vec<(String, u32)>,
  ) -> Result<Vec<ProcessedCounts>> {
    let rows: Vec<(String, Option<i64>, i64)> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let mut rows = Vec::with_capacity(deltas.len());
        {
          let mut update = tx.prepare(
            "UPDATE entity_operations SET processed = processed + ?2
             WHERE id = ?1
             RETURNING total, processed",
          )?;
          for (id, delta) in deltas {
            let delta = encode_count(delta);
            let found: Option<(i64, i64)> = update
              .query_row(rusqlite::params![id, delta], |row| Ok((row.get(0)?, row.get(1)?)))
              .optional()?;
            match found {
              Some((total, processed)) => rows.push((id, Some(total), processed)),
              None => rows.push((id, None, delta)),
            }
          }
        }
        tx.commit()?;
        Ok(rows)
      })
      .await?;

    rows
      .into_iter()
      .map(|(id, total, processed)| {
        Ok(ProcessedCounts {
          id,
          total: total.map(decode_count).transpose()?,
          processed: decode_count(processed)?,
        })
      })
      .collect()
  }

  async fn total_operations(&self, id: String) -> Result<Option<u32>> {
    let total: Option<i64> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT total FROM entity_operations WHERE id = ?1",
              [id],
              |row| row.get(0),
            )
            .optional()?,
        )
      })
      .await?;
    total.map(decode_count).transpose()
  }

  async fn unprocessed_entities_page(
    &self,
    after: Option<String>,
    limit: usize,
  ) -> Result<Vec<(String, u32)>> {
    let limit = limit as i64;
    let rows: Vec<(String, i64)> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT id, total FROM entity_operations
           WHERE processed < total AND (?1 IS NULL OR id > ?1)
           ORDER BY id
           LIMIT ?2",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![after, limit], |row| Ok((row.get(0)?, row.get(1)?)))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    rows
      .into_iter()
      .map(|(id, total)| Ok((id, decode_count(total)?)))
      .collect()
  }

  // ── Durable diff queue ────────────────────────────────────────────────

  async fn add_to_diff_queue(&self, ids: Vec<String>) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        {
          let mut insert = tx.prepare("INSERT OR IGNORE INTO diff_queue (id) VALUES (?1)")?;
          for id in ids {
            insert.execute([id])?;
          }
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn undiffed_ids_page(&self, after: Option<String>, limit: usize) -> Result<Vec<String>> {
    let limit = limit as i64;
    let ids = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT id FROM diff_queue
           WHERE (?1 IS NULL OR id > ?1)
           ORDER BY id
           LIMIT ?2",
        )?;
        let ids = stmt
          .query_map(rusqlite::params![after, limit], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
      })
      .await?;
    Ok(ids)
  }

  async fn count_undiffed(&self) -> Result<u64> {
    let n: i64 = self
      .conn
      .call(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM diff_queue", [], |row| row.get(0))?))
      .await?;
    Ok(n as u64)
  }

  // ── Diff results ──────────────────────────────────────────────────────

  async fn save_diff_results(&self, results: Vec<DocDiffs>) -> Result<()> {
    let encoded = results.iter().map(EncodedResult::encode).collect::<Result<Vec<_>>>()?;
    let at = now();

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let mut per_kind: BTreeMap<String, i64> = BTreeMap::new();
        for table in ["diffs", "changes"] {
          let mut delete =
            tx.prepare(&format!("DELETE FROM {table} WHERE kind = ?1 AND doc_id = ?2"))?;
          let mut insert = tx.prepare(&format!(
            "INSERT INTO {table} (kind, doc_id, payload, recorded_at) VALUES (?1, ?2, ?3, ?4)"
          ))?;
          for res in &encoded {
            delete.execute(rusqlite::params![res.kind, res.doc_id])?;
            let payload = if table == "diffs" { &res.diffs } else { &res.changes };
            if let Some(payload) = payload {
              insert.execute(rusqlite::params![res.kind, res.doc_id, payload, at])?;
            }
          }
        }
        {
          let mut dequeue = tx.prepare("DELETE FROM diff_queue WHERE id = ?1")?;
          let mut diffed = tx.prepare("INSERT OR IGNORE INTO diffed_ids (id) VALUES (?1)")?;
          for res in &encoded {
            dequeue.execute([&res.doc_id])?;
            diffed.execute([&res.doc_id])?;
            *per_kind.entry(res.kind.clone()).or_default() += 1;
          }
          let mut count = tx.prepare(
            "INSERT INTO counts (kind, value) VALUES (?1, ?2)
             ON CONFLICT(kind) DO UPDATE SET value = value + excluded.value",
          )?;
          for (kind, n) in &per_kind {
            count.execute(rusqlite::params![kind, n])?;
          }
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn add_missing_docs(&self, kind: String, ids: Vec<String>) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        {
          let mut insert =
            tx.prepare("INSERT OR IGNORE INTO missing_docs (kind, doc_id) VALUES (?1, ?2)")?;
          for id in ids {
            insert.execute(rusqlite::params![kind, id])?;
          }
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  // ── Key/value and resume state ────────────────────────────────────────

  async fn get_value(&self, key: String) -> Result<Option<Value>> {
    let raw: Option<String> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row("SELECT value FROM key_value WHERE key = ?1", [key], |row| row.get(0))
            .optional()?,
        )
      })
      .await?;
    raw.as_deref().map(decode_value).transpose()
  }

  async fn set_value(&self, key: String, value: Value) -> Result<()> {
    let raw = encode_value(&value)?;
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT OR REPLACE INTO key_value (key, value) VALUES (?1, ?2)",
          rusqlite::params![key, raw],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn set_resume_state(&self, key: String, state: Value) -> Result<()> {
    self.set_value(resume_key(&key), state).await
  }

  async fn pop_resume_state(&self, key: String, default: Value) -> Result<Value> {
    let stored_key = resume_key(&key);
    let popped = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let raw: Option<String> = tx
          .query_row("SELECT value FROM key_value WHERE key = ?1", [&stored_key], |row| {
            row.get(0)
          })
          .optional()?;
        let popped = match raw {
          Some(raw) if raw == RESUME_NOT_ALLOWED => return Ok(Popped::NotAllowed),
          Some(raw) => Popped::Saved(raw),
          None => Popped::Absent,
        };
        tx.execute(
          "INSERT OR REPLACE INTO key_value (key, value) VALUES (?1, ?2)",
          rusqlite::params![stored_key, RESUME_NOT_ALLOWED],
        )?;
        tx.commit()?;
        Ok(popped)
      })
      .await?;

    match popped {
      Popped::Absent => Ok(default),
      Popped::Saved(raw) => decode_value(&raw),
      Popped::NotAllowed => Err(Error::ResumeNotAllowed(key)),
    }
  }

  async fn clone_partial_state_from<'a>(&'a self, path: &'a Path) -> Result<()> {
    let source = path.to_string_lossy().into_owned();

    // Verify first: the source must contain nothing the copy below would
    // silently leave behind.
    let (tables, kinds, keys) = self
      .conn
      .call(move |conn| {
        conn.execute("ATTACH DATABASE ?1 AS child", [&source])?;
        let read = || -> rusqlite::Result<(Vec<String>, Vec<String>, Vec<String>)> {
          let tables = conn
            .prepare("SELECT name FROM child.sqlite_master WHERE type = 'table'")?
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
          let kinds = conn
            .prepare(
              "SELECT kind FROM child.diffs
               UNION SELECT kind FROM child.changes
               UNION SELECT kind FROM child.counts
               UNION SELECT kind FROM child.missing_docs",
            )?
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
          let keys = conn
            .prepare("SELECT key FROM child.key_value")?
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
          Ok((tables, kinds, keys))
        };
        let found = read();
        if found.is_err() {
          conn.execute("DETACH DATABASE child", [])?;
        }
        Ok(found?)
      })
      .await?;

    let violation = check_cloneable(&tables, &kinds, &keys);
    if let Some(violation) = violation {
      self
        .conn
        .call(|conn| {
          conn.execute("DETACH DATABASE child", [])?;
          Ok(())
        })
        .await?;
      return Err(Error::CloneNotAllowed(violation));
    }

    let kinds_list = CASE_KINDS
      .iter()
      .map(|k| format!("'{k}'"))
      .collect::<Vec<_>>()
      .join(", ");
    let keys_list = CLONEABLE_KEYS
      .iter()
      .map(|k| format!("'{k}'"))
      .collect::<Vec<_>>()
      .join(", ");

    self
      .conn
      .call(move |conn| {
        let copied = conn.transaction().and_then(|tx| {
          tx.execute_batch(&format!(
            "INSERT OR REPLACE INTO entity_operations (id, total, processed)
               SELECT id, total, processed FROM child.entity_operations;
             DELETE FROM diffs WHERE kind IN ({kinds_list});
             INSERT INTO diffs (kind, doc_id, payload, recorded_at)
               SELECT kind, doc_id, payload, recorded_at FROM child.diffs;
             DELETE FROM changes WHERE kind IN ({kinds_list});
             INSERT INTO changes (kind, doc_id, payload, recorded_at)
               SELECT kind, doc_id, payload, recorded_at FROM child.changes;
             INSERT OR REPLACE INTO counts (kind, value)
               SELECT kind, value FROM child.counts;
             INSERT OR IGNORE INTO missing_docs (kind, doc_id)
               SELECT kind, doc_id FROM child.missing_docs;
             INSERT OR IGNORE INTO diff_queue (id)
               SELECT id FROM child.diff_queue;
             INSERT OR IGNORE INTO diffed_ids (id)
               SELECT id FROM child.diffed_ids;
             DELETE FROM diff_queue WHERE id IN (SELECT id FROM child.diffed_ids);
             INSERT OR REPLACE INTO key_value (key, value)
               SELECT key, value FROM child.key_value WHERE key IN ({keys_list});"
          ))?;
          tx.commit()
        });
        conn.execute("DETACH DATABASE child", [])?;
        Ok(copied?)
      })
      .await?;

    tracing::info!(source = %path.display(), "copied case diff state");
    Ok(())
  }
}

/// Describe the first thing in a child store that the clone routine does not
/// know how to copy, if any.
fn check_cloneable(tables: &[String], kinds: &[String], keys: &[String]) -> Option<String> {
  let known: HashSet<&str> = TABLES.iter().copied().collect();
  if let Some(table) = tables.iter().find(|t| !known.contains(t.as_str())) {
    return Some(format!("unexpected table {table:?}"));
  }
  if let Some(kind) = kinds.iter().find(|k| !CASE_KINDS.contains(&k.as_str())) {
    return Some(format!("unexpected document kind {kind:?}"));
  }
  if let Some(key) = keys
    .iter()
    .find(|k| !CLONEABLE_KEYS.contains(&k.as_str()) && !LOCAL_KEYS.contains(&k.as_str()))
  {
    return Some(format!("unexpected key {key:?}"));
  }
  None
}
