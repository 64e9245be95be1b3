//! Declarative ignore rules.
//!
//! Document shapes drift between the two backends in explainable ways:
//! renamed fields, reordered lists, timestamp precision, backfilled
//! defaults. Each known pattern is described by an [`IgnoreRule`]; the
//! [`RuleSet`] filters structural diffs through those rules so that only
//! unexplained discrepancies are reported.
//!
//! A rule matches a diff when its four matchers (type, path, old value, new
//! value) accept the diff and its [`Check`] returns something other than
//! [`Verdict::Keep`]. The first matching rule, in declaration order, decides
//! the diff's fate.

use std::{
  collections::{HashMap, HashSet},
  fmt,
  sync::Arc,
};

use chrono::{DateTime, NaiveDateTime};
use serde::Deserialize;
use serde_json::Value;

use crate::{
  Error, Result,
  diff::{Change, Diff, DiffType, Path, PathElem, value_at},
};

// ─── Matchers ────────────────────────────────────────────────────────────────

/// Matches one element of a diff path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
  Elem(PathElem),
  /// Any single element.
  AnyElem,
  /// Zero or more trailing elements; only valid as the last segment.
  Rest,
}

/// Matches the path of a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathMatcher {
  Any,
  Exact(Path),
  Pattern(Vec<PathSegment>),
}

impl PathMatcher {
  /// Build a matcher from segments, collapsing wildcard-free patterns to
  /// [`PathMatcher::Exact`] so they can be indexed.
  pub fn from_segments(segments: Vec<PathSegment>) -> Self {
    if segments.iter().all(|s| matches!(s, PathSegment::Elem(_))) {
      let path = segments
        .into_iter()
        .filter_map(|s| match s {
          PathSegment::Elem(e) => Some(e),
          _ => None,
        })
        .collect();
      Self::Exact(path)
    } else {
      Self::Pattern(segments)
    }
  }

  pub fn matches(&self, path: &[PathElem]) -> bool {
    match self {
      Self::Any => true,
      Self::Exact(p) => p.as_slice() == path,
      Self::Pattern(segments) => pattern_matches(segments, path),
    }
  }
}

fn pattern_matches(segments: &[PathSegment], path: &[PathElem]) -> bool {
  match (segments.split_first(), path.split_first()) {
    (None, None) => true,
    (Some((PathSegment::Rest, _)), _) => true,
    (Some((PathSegment::AnyElem, rest)), Some((_, tail))) => pattern_matches(rest, tail),
    (Some((PathSegment::Elem(e), rest)), Some((p, tail))) => {
      e == p && pattern_matches(rest, tail)
    }
    _ => false,
  }
}

/// Matches the old or new value of a diff.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueMatcher {
  Any,
  /// The value is absent on that side.
  Missing,
  Is(Value),
}

impl ValueMatcher {
  pub fn matches(&self, value: Option<&Value>) -> bool {
    match self {
      Self::Any => true,
      Self::Missing => value.is_none(),
      Self::Is(expected) => value == Some(expected),
    }
  }
}

// ─── Checks ──────────────────────────────────────────────────────────────────

/// The outcome of evaluating a rule's check against a diff.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
  /// The rule does not apply; keep scanning.
  Keep,
  /// The diff is explained and dropped.
  Drop,
  /// The diff is dropped and these diffs are reported in its place.
  Replace(Vec<Diff>),
}

pub type PredicateFn =
  dyn Fn(&Value, &Value, &IgnoreRule, &Diff) -> Verdict + Send + Sync;

/// A programmatic check, for drift patterns that cannot be expressed with the
/// built-in checks.
#[derive(Clone)]
pub struct Predicate(pub Arc<PredicateFn>);

impl Predicate {
  pub fn new(
    f: impl Fn(&Value, &Value, &IgnoreRule, &Diff) -> Verdict + Send + Sync + 'static,
  ) -> Self {
    Self(Arc::new(f))
  }
}

impl fmt::Debug for Predicate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("Predicate(..)") }
}

/// Additional condition a rule evaluates once its matchers accept a diff.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Check {
  /// Matching the matchers is enough.
  #[default]
  Always,
  /// Both values are timestamps denoting the same instant.
  DateEquivalent,
  /// The diff lies inside a list whose elements are equal as a multiset.
  /// Otherwise the whole list is reported once as a `set_mismatch`.
  UnorderedList,
  /// A field called `old` in the old document is called `new` in the new
  /// one. Equal values are dropped; otherwise a single `complex` diff
  /// replaces both `missing` diffs.
  RenamedField { old: String, new: String },
  /// The new document fills in `value` where the old one had nothing.
  BackfilledDefault { value: Value },
  #[serde(skip)]
  Custom(Predicate),
}

impl Check {
  fn evaluate(
    &self,
    old_doc: &Value,
    new_doc: &Value,
    rule: &IgnoreRule,
    diff: &Diff,
  ) -> Verdict {
    match self {
      Self::Always => Verdict::Drop,
      Self::DateEquivalent => match (&diff.old_value, &diff.new_value) {
        (Some(Value::String(a)), Some(Value::String(b))) if same_instant(a, b) => {
          Verdict::Drop
        }
        _ => Verdict::Keep,
      },
      Self::UnorderedList => unordered_list(old_doc, new_doc, diff),
      Self::RenamedField { old, new } => renamed_field(old_doc, new_doc, diff, old, new),
      Self::BackfilledDefault { value } => {
        let old_empty = matches!(diff.old_value, None | Some(Value::Null));
        if old_empty && diff.new_value.as_ref() == Some(value) {
          Verdict::Drop
        } else {
          Verdict::Keep
        }
      }
      Self::Custom(predicate) => (predicate.0)(old_doc, new_doc, rule, diff),
    }
  }
}

fn parse_instant(s: &str) -> Option<NaiveDateTime> {
  if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
    return Some(dt.naive_utc());
  }
  ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
    .iter()
    .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

fn same_instant(a: &str, b: &str) -> bool {
  match (parse_instant(a), parse_instant(b)) {
    (Some(a), Some(b)) => a == b,
    _ => false,
  }
}

/// The path of the innermost list containing `path`.
fn list_path(path: &[PathElem]) -> Option<&[PathElem]> {
  let idx = path.iter().rposition(|e| matches!(e, PathElem::Index(_)))?;
  Some(&path[..idx])
}

fn sorted_elements(list: &[Value]) -> Vec<String> {
  let mut items: Vec<String> = list.iter().map(Value::to_string).collect();
  items.sort();
  items
}

fn unordered_list(old_doc: &Value, new_doc: &Value, diff: &Diff) -> Verdict {
  let Some(list_path) = list_path(&diff.path) else {
    return Verdict::Keep;
  };
  let old_list = value_at(old_doc, list_path);
  let new_list = value_at(new_doc, list_path);
  match (old_list, new_list) {
    (Some(Value::Array(a)), Some(Value::Array(b))) => {
      if sorted_elements(a) == sorted_elements(b) {
        Verdict::Drop
      } else {
        Verdict::Replace(vec![Diff::new(
          DiffType::SetMismatch,
          list_path.to_vec(),
          old_list.cloned(),
          new_list.cloned(),
        )])
      }
    }
    _ => Verdict::Keep,
  }
}

fn renamed_field(
  old_doc: &Value,
  new_doc: &Value,
  diff: &Diff,
  old_name: &str,
  new_name: &str,
) -> Verdict {
  let Some((PathElem::Key(last), parent)) = diff.path.split_last() else {
    return Verdict::Keep;
  };
  if last != old_name && last != new_name {
    return Verdict::Keep;
  }
  let mut old_path = parent.to_vec();
  old_path.push(PathElem::from(old_name));
  let mut new_path = parent.to_vec();
  new_path.push(PathElem::from(new_name));
  let old_value = value_at(old_doc, &old_path);
  let new_value = value_at(new_doc, &new_path);
  let empty = |v: Option<&Value>| matches!(v, None | Some(Value::Null));
  if old_value == new_value || (empty(old_value) && empty(new_value)) {
    return Verdict::Drop;
  }
  let mut path = parent.to_vec();
  path.push(PathElem::from(old_name));
  path.push(PathElem::from(new_name));
  Verdict::Replace(vec![Diff::new(
    DiffType::Complex,
    path,
    old_value.cloned(),
    new_value.cloned(),
  )])
}

// ─── Rules ───────────────────────────────────────────────────────────────────

/// A declarative description of one expected drift pattern.
#[derive(Debug, Clone)]
pub struct IgnoreRule {
  pub diff_type: Option<DiffType>,
  pub path:      PathMatcher,
  pub old:       ValueMatcher,
  pub new:       ValueMatcher,
  pub check:     Check,
  /// When set, a matching diff is recorded as a [`Change`] with this reason
  /// instead of vanishing.
  pub reason:    Option<String>,
}

impl Default for IgnoreRule {
  fn default() -> Self {
    Self {
      diff_type: None,
      path:      PathMatcher::Any,
      old:       ValueMatcher::Any,
      new:       ValueMatcher::Any,
      check:     Check::Always,
      reason:    None,
    }
  }
}

impl IgnoreRule {
  /// A rule ignoring diffs of `diff_type` (any when `None`) at an exact path.
  pub fn ignore(diff_type: Option<DiffType>, path: Path) -> Self {
    Self { diff_type, path: PathMatcher::Exact(path), ..Self::default() }
  }

  pub fn with_check(mut self, check: Check) -> Self {
    self.check = check;
    self
  }

  pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
    self.reason = Some(reason.into());
    self
  }

  fn matchers_accept(&self, diff: &Diff) -> bool {
    self.diff_type.is_none_or(|t| t == diff.diff_type)
      && self.path.matches(&diff.path)
      && self.old.matches(diff.old_value.as_ref())
      && self.new.matches(diff.new_value.as_ref())
  }
}

/// A rule as written in a configuration file.
///
/// ```toml
/// [[ignore_rules]]
/// kind  = "CommCareCase*"
/// type  = "diff"
/// path  = ["xform_ids", "*"]
/// check = { name = "unordered_list" }
/// ```
///
/// Path elements may be keys, indices, `"*"` (any one element) or `"**"`
/// (anything that follows). `old` / `new` match literal values;
/// `old_missing` / `new_missing` match absence.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
  pub kind:        String,
  #[serde(rename = "type")]
  pub diff_type:   Option<String>,
  pub path:        Option<Vec<Value>>,
  pub old:         Option<Value>,
  pub new:         Option<Value>,
  #[serde(default)]
  pub old_missing: bool,
  #[serde(default)]
  pub new_missing: bool,
  #[serde(default)]
  pub check:       Check,
  pub reason:      Option<String>,
}

impl RuleSpec {
  pub fn into_rule(self) -> Result<(String, IgnoreRule)> {
    let invalid = |reason: String| Error::InvalidRule { kind: self.kind.clone(), reason };

    let diff_type = self
      .diff_type
      .as_deref()
      .map(|t| t.parse::<DiffType>().map_err(|_| Error::UnknownDiffType(t.to_owned())))
      .transpose()?;

    let path = match &self.path {
      None => PathMatcher::Any,
      Some(elems) => {
        let mut segments = Vec::with_capacity(elems.len());
        for (i, elem) in elems.iter().enumerate() {
          let segment = match elem {
            Value::String(s) if s == "*" => PathSegment::AnyElem,
            Value::String(s) if s == "**" => {
              if i + 1 != elems.len() {
                return Err(invalid("\"**\" must be the last path element".into()));
              }
              PathSegment::Rest
            }
            Value::String(s) => PathSegment::Elem(PathElem::Key(s.clone())),
            Value::Number(n) => match n.as_u64() {
              Some(i) => PathSegment::Elem(PathElem::Index(i as usize)),
              None => return Err(invalid(format!("bad path index {n}"))),
            },
            other => return Err(invalid(format!("bad path element {other}"))),
          };
          segments.push(segment);
        }
        PathMatcher::from_segments(segments)
      }
    };

    let value_matcher = |value: &Option<Value>, missing: bool, side: &str| {
      match (value, missing) {
        (Some(_), true) => Err(invalid(format!("{side} cannot be both a value and missing"))),
        (Some(v), false) => Ok(ValueMatcher::Is(v.clone())),
        (None, true) => Ok(ValueMatcher::Missing),
        (None, false) => Ok(ValueMatcher::Any),
      }
    };
    let old = value_matcher(&self.old, self.old_missing, "old")?;
    let new = value_matcher(&self.new, self.new_missing, "new")?;

    let rule = IgnoreRule {
      diff_type,
      path,
      old,
      new,
      check: self.check.clone(),
      reason: self.reason.clone(),
    };
    Ok((self.kind, rule))
  }
}

// ─── Rule set ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct KindRules {
  /// Rules with a literal path, keyed by that path.
  by_path:  HashMap<Path, Vec<usize>>,
  /// Rules with wildcard paths.
  fallback: Vec<usize>,
}

/// The result of filtering a document's diffs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filtered {
  pub diffs:   Vec<Diff>,
  pub changes: Vec<Change>,
}

/// Ignore rules grouped by document kind.
///
/// A kind ending in `*` applies to every kind with that prefix, so rules
/// for `CommCareCase*` also cover `CommCareCase-Deleted`.
#[derive(Debug, Default)]
pub struct RuleSet {
  rules:    Vec<IgnoreRule>,
  exact:    HashMap<String, KindRules>,
  prefixed: Vec<(String, KindRules)>,
}

impl RuleSet {
  pub fn new() -> Self { Self::default() }

  /// Append a rule; declaration order is evaluation order.
  pub fn add(&mut self, kind: &str, rule: IgnoreRule) {
    let index = self.rules.len();
    let kind_rules = match kind.strip_suffix('*') {
      Some(prefix) => {
        match self.prefixed.iter().position(|(p, _)| p == prefix) {
          Some(pos) => &mut self.prefixed[pos].1,
          None => {
            self.prefixed.push((prefix.to_owned(), KindRules::default()));
            let last = self.prefixed.len() - 1;
            &mut self.prefixed[last].1
          }
        }
      }
      None => self.exact.entry(kind.to_owned()).or_default(),
    };
    match &rule.path {
      PathMatcher::Exact(path) => {
        kind_rules.by_path.entry(path.clone()).or_default().push(index)
      }
      _ => kind_rules.fallback.push(index),
    }
    self.rules.push(rule);
  }

  pub fn with(mut self, kind: &str, rule: IgnoreRule) -> Self {
    self.add(kind, rule);
    self
  }

  /// Append rules parsed from configuration.
  pub fn extend_from_specs(&mut self, specs: impl IntoIterator<Item = RuleSpec>) -> Result<()> {
    for spec in specs {
      let (kind, rule) = spec.into_rule()?;
      self.add(&kind, rule);
    }
    Ok(())
  }

  pub fn len(&self) -> usize { self.rules.len() }

  pub fn is_empty(&self) -> bool { self.rules.is_empty() }

  fn applicable<'a>(&'a self, kind: &str) -> Vec<&'a KindRules> {
    self
      .exact
      .get(kind)
      .into_iter()
      .chain(
        self
          .prefixed
          .iter()
          .filter(|(prefix, _)| kind.starts_with(prefix.as_str()))
          .map(|(_, rules)| rules),
      )
      .collect()
  }

  /// Candidate rule indices for `path`, in declaration order.
  fn candidates(&self, groups: &[&KindRules], path: &[PathElem]) -> Vec<usize> {
    let mut indices: Vec<usize> = groups
      .iter()
      .flat_map(|g| {
        g.by_path
          .get(path)
          .map(Vec::as_slice)
          .unwrap_or_default()
          .iter()
          .chain(g.fallback.iter())
          .copied()
      })
      .collect();
    indices.sort_unstable();
    indices
  }

  fn first_match(
    &self,
    groups: &[&KindRules],
    old_doc: &Value,
    new_doc: &Value,
    diff: &Diff,
  ) -> Option<(&IgnoreRule, Verdict)> {
    self.candidates(groups, &diff.path).into_iter().find_map(|i| {
      let rule = &self.rules[i];
      if !rule.matchers_accept(diff) {
        return None;
      }
      match rule.check.evaluate(old_doc, new_doc, rule, diff) {
        Verdict::Keep => None,
        verdict => Some((rule, verdict)),
      }
    })
  }

  /// Remove diffs explained by the rules for `kind`.
  pub fn filter(&self, kind: &str, old_doc: &Value, new_doc: &Value, diffs: Vec<Diff>) -> Vec<Diff> {
    self.filter_with_changes(kind, old_doc, new_doc, diffs).diffs
  }

  /// Like [`RuleSet::filter`], also returning the diffs matched by rules
  /// that carry a reason, as [`Change`]s.
  ///
  /// Replacement diffs are emitted as they are, without being filtered
  /// again. Every emitted diff is unique by `(diff_type, path)`.
  pub fn filter_with_changes(
    &self,
    kind: &str,
    old_doc: &Value,
    new_doc: &Value,
    diffs: Vec<Diff>,
  ) -> Filtered {
    let groups = self.applicable(kind);
    let mut out = Filtered::default();
    let mut emitted: HashSet<(DiffType, Path)> = HashSet::new();
    let mut emit = |diff: Diff, out: &mut Filtered| {
      if emitted.insert((diff.diff_type, diff.path.clone())) {
        out.diffs.push(diff);
      }
    };

    for diff in diffs {
      if groups.is_empty() {
        emit(diff, &mut out);
        continue;
      }
      match self.first_match(&groups, old_doc, new_doc, &diff) {
        None => emit(diff, &mut out),
        Some((rule, Verdict::Drop)) => {
          if let Some(reason) = &rule.reason {
            out.changes.push(Change { diff, reason: reason.clone() });
          }
        }
        Some((_, Verdict::Replace(replacements))) => {
          for replacement in replacements {
            emit(replacement, &mut out);
          }
        }
        Some((_, Verdict::Keep)) => unreachable!("keep verdicts are never matches"),
      }
    }
    out
  }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::diff::{json_diff, path};

  #[test]
  fn ignore_rule_suppresses_diff() {
    let old = json!({"a": 1});
    let new = json!({"a": 2});
    let diffs = json_diff(&old, &new);
    assert_eq!(diffs.len(), 1);

    let rules = RuleSet::new()
      .with("CommCareCase", IgnoreRule::ignore(Some(DiffType::Diff), path(["a"])));
    assert_eq!(rules.filter("CommCareCase", &old, &new, diffs), vec![]);
  }

  #[test]
  fn rules_for_other_kinds_do_not_apply() {
    let old = json!({"a": 1});
    let new = json!({"a": 2});
    let rules = RuleSet::new()
      .with("XFormInstance", IgnoreRule::ignore(Some(DiffType::Diff), path(["a"])));
    let diffs = json_diff(&old, &new);
    assert_eq!(rules.filter("CommCareCase", &old, &new, diffs.clone()), diffs);
  }

  #[test]
  fn prefixed_kind_applies_to_variants() {
    let old = json!({"a": 1});
    let new = json!({"a": 2});
    let rules = RuleSet::new()
      .with("CommCareCase*", IgnoreRule::ignore(None, path(["a"])));
    let diffs = json_diff(&old, &new);
    assert!(rules.filter("CommCareCase-Deleted", &old, &new, diffs).is_empty());
  }

  #[test]
  fn replacement_diffs_are_emitted_once() {
    let old = json!({"a": 1, "b": 1});
    let new = json!({"a": 2, "b": 2});
    let replacements = vec![
      Diff::new(DiffType::Diff, path(["b"]), Some(json!("x")), Some(json!("y"))),
      Diff::new(DiffType::Complex, path(["a", "b"]), None, None),
    ];
    let reps = replacements.clone();
    let rules = RuleSet::new()
      .with(
        "CommCareCase",
        IgnoreRule::ignore(Some(DiffType::Diff), path(["a"]))
          .with_check(Check::Custom(Predicate::new(move |_, _, _, _| {
            Verdict::Replace(reps.clone())
          }))),
      );

    let filtered = rules.filter("CommCareCase", &old, &new, json_diff(&old, &new));
    // The original "b" diff collides with the replacement at ("diff", ["b"]).
    assert_eq!(filtered, replacements);
  }

  #[test]
  fn first_matching_rule_governs() {
    let old = json!({"a": 1});
    let new = json!({"a": 2});
    let rules = RuleSet::new()
      .with(
        "CommCareCase",
        IgnoreRule::ignore(None, path(["a"])).with_check(Check::Custom(Predicate::new(
          |_, _, _, _| Verdict::Keep,
        ))),
      )
      .with("CommCareCase", IgnoreRule::ignore(None, path(["a"])).with_reason("expected"))
      .with(
        "CommCareCase",
        IgnoreRule::ignore(None, path(["a"])).with_check(Check::Custom(Predicate::new(
          |_, _, _, _| panic!("later rule must not be evaluated"),
        ))),
      );
    let filtered =
      rules.filter_with_changes("CommCareCase", &old, &new, json_diff(&old, &new));
    assert!(filtered.diffs.is_empty());
    assert_eq!(filtered.changes.len(), 1);
    assert_eq!(filtered.changes[0].reason, "expected");
  }

  #[test]
  fn date_equivalent_only_drops_same_instant() {
    let rule = IgnoreRule::ignore(Some(DiffType::Diff), path(["modified_on"]))
      .with_check(Check::DateEquivalent);
    let rules = RuleSet::new().with("CommCareCase", rule);

    let old = json!({"modified_on": "2016-04-01T15:39:42Z"});
    let same = json!({"modified_on": "2016-04-01T15:39:42.000000Z"});
    let other = json!({"modified_on": "2016-04-01T10:29:00.000000Z"});
    assert!(rules.filter("CommCareCase", &old, &same, json_diff(&old, &same)).is_empty());
    assert_eq!(rules.filter("CommCareCase", &old, &other, json_diff(&old, &other)).len(), 1);
  }

  #[test]
  fn unordered_list_drops_reordering_and_reports_real_mismatch_once() {
    let rule = IgnoreRule {
      path: PathMatcher::from_segments(vec![
        PathSegment::Elem("xform_ids".into()),
        PathSegment::AnyElem,
      ]),
      check: Check::UnorderedList,
      ..IgnoreRule::default()
    };
    let rules = RuleSet::new().with("CommCareCase", rule);

    let old = json!({"xform_ids": ["a", "b", "c"]});
    let reordered = json!({"xform_ids": ["c", "a", "b"]});
    assert!(
      rules
        .filter("CommCareCase", &old, &reordered, json_diff(&old, &reordered))
        .is_empty()
    );

    let changed = json!({"xform_ids": ["c", "a", "d"]});
    let filtered = rules.filter("CommCareCase", &old, &changed, json_diff(&old, &changed));
    assert_eq!(
      filtered,
      vec![Diff::new(
        DiffType::SetMismatch,
        path(["xform_ids"]),
        Some(json!(["a", "b", "c"])),
        Some(json!(["c", "a", "d"])),
      )]
    );
  }

  #[test]
  fn renamed_field_with_equal_value_is_dropped() {
    let rules = RuleSet::new().with(
      "XFormDeprecated",
      IgnoreRule {
        diff_type: Some(DiffType::Missing),
        path: PathMatcher::Any,
        check: Check::RenamedField { old: "deprecated_date".into(), new: "edited_on".into() },
        ..IgnoreRule::default()
      },
    );
    let old = json!({"deprecated_date": "abc"});
    let good = json!({"edited_on": "abc"});
    assert!(rules.filter("XFormDeprecated", &old, &good, json_diff(&old, &good)).is_empty());

    let bad = json!({"edited_on": "123"});
    let filtered = rules.filter("XFormDeprecated", &old, &bad, json_diff(&old, &bad));
    assert_eq!(
      filtered,
      vec![Diff::new(
        DiffType::Complex,
        path(["deprecated_date", "edited_on"]),
        Some(json!("abc")),
        Some(json!("123")),
      )]
    );
  }

  #[test]
  fn backfilled_default() {
    let rules = RuleSet::new().with(
      "CommCareCase",
      IgnoreRule::ignore(Some(DiffType::Missing), path(["external_id"]))
        .with_check(Check::BackfilledDefault { value: json!("") }),
    );
    let old = json!({});
    let new = json!({"external_id": ""});
    assert!(rules.filter("CommCareCase", &old, &new, json_diff(&old, &new)).is_empty());
    let new = json!({"external_id": "abc"});
    assert_eq!(rules.filter("CommCareCase", &old, &new, json_diff(&old, &new)).len(), 1);
  }

  #[test]
  fn rule_spec_parses_wildcards_and_checks() {
    let spec: RuleSpec = serde_json::from_value(json!({
      "kind": "CommCareCase*",
      "type": "missing",
      "path": ["indices", "*", "**"],
      "new_missing": true,
      "check": {"name": "renamed_field", "old": "a", "new": "b"},
      "reason": "renamed",
    }))
    .unwrap();
    let (kind, rule) = spec.into_rule().unwrap();
    assert_eq!(kind, "CommCareCase*");
    assert_eq!(rule.diff_type, Some(DiffType::Missing));
    assert_eq!(rule.new, ValueMatcher::Missing);
    assert!(rule.path.matches(&[PathElem::from("indices"), 0.into(), "x".into()]));
    assert!(!rule.path.matches(&path(["other", "x"])));
    assert!(matches!(rule.check, Check::RenamedField { .. }));
  }

  #[test]
  fn rule_spec_rejects_unknown_diff_type() {
    let spec: RuleSpec =
      serde_json::from_value(json!({"kind": "CommCareCase", "type": "bogus"})).unwrap();
    assert!(matches!(spec.into_rule(), Err(Error::UnknownDiffType(_))));
  }
}
