//! The stock rule set for case documents.

use serde_json::json;

use crate::{
  diff::{DiffType, PathElem, path},
  rule::{Check, IgnoreRule, PathMatcher, PathSegment, RuleSet, ValueMatcher},
};

pub const CASE_KIND: &str = "CommCareCase";

/// Kinds whose diffs the case diff queue owns.
pub const CASE_KINDS: &[&str] = &["CommCareCase", "CommCareCase-Deleted"];

/// Bookkeeping fields that exist only in the legacy store.
const LEGACY_ONLY_FIELDS: &[&str] = &[
  "_rev",
  "#export_tag",
  "computed_",
  "computed_modified_on_",
  "initial_processing_complete",
  "_attachments",
  "case_attachments",
];

const DATE_FIELDS: &[&str] = &["modified_on", "opened_on", "closed_on", "server_modified_on"];

fn list_elements(name: &str) -> PathMatcher {
  PathMatcher::Pattern(vec![
    PathSegment::Elem(PathElem::from(name)),
    PathSegment::AnyElem,
    PathSegment::Rest,
  ])
}

/// Rules for drift that every case migration is known to produce.
pub fn case_rules() -> RuleSet {
  let any_case = "CommCareCase*";
  let mut rules = RuleSet::new();

  for field in LEGACY_ONLY_FIELDS {
    rules.add(
      any_case,
      IgnoreRule { new: ValueMatcher::Missing, ..IgnoreRule::ignore(None, path([*field])) },
    );
  }

  for field in DATE_FIELDS {
    rules.add(
      any_case,
      IgnoreRule::ignore(Some(DiffType::Diff), path([*field])).with_check(Check::DateEquivalent),
    );
  }

  for list in ["xform_ids", "indices", "actions"] {
    rules.add(
      any_case,
      IgnoreRule { path: list_elements(list), check: Check::UnorderedList, ..IgnoreRule::default() },
    );
  }

  for field in ["closed_by", "external_id", "location_id", "opened_by"] {
    rules.add(
      any_case,
      IgnoreRule::ignore(Some(DiffType::Missing), path([field]))
        .with_check(Check::BackfilledDefault { value: json!("") }),
    );
  }

  for field in ["deletion_id", "deleted_on"] {
    rules.add(
      any_case,
      IgnoreRule {
        old: ValueMatcher::Missing,
        new: ValueMatcher::Is(json!(null)),
        ..IgnoreRule::ignore(Some(DiffType::Missing), path([field]))
      },
    );
  }

  for (old, new) in [("-deletion_id", "deletion_id"), ("-deletion_date", "deleted_on")] {
    rules.add(
      "CommCareCase-Deleted",
      IgnoreRule {
        diff_type: Some(DiffType::Missing),
        check: Check::RenamedField { old: old.into(), new: new.into() },
        ..IgnoreRule::default()
      },
    );
  }

  rules.add(
    any_case,
    IgnoreRule::ignore(Some(DiffType::Diff), path(["server_modified_on"]))
      .with_reason("server modification date changes when a case is rebuilt"),
  );

  rules
}
