//! Tag-based query operations: simple tag queries,
//! paginated listing and boolean-combinator complex queries, all
//! reading through the [`crate::index::TagIndex`] and cached in
//! [`crate::cache::QueryCache`].

use std::collections::BTreeSet;

use crate::index::TagIndex;
use crate::record::{Scope, Tag};

/// How multiple tags combine in a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    And,
    Or,
    /// Keys with none of the given tags: `universe \ union(tags)`.
    Not,
}

/// One clause of a [`complex_query`]: combine `tag`'s matches into the
/// running result using `operator`. A multi-tag clause is expressed as several
/// single-tag `Condition`s sharing that operator back to back — AND and
/// OR are associative, so folding them one tag at a time is equivalent
/// to folding the whole list at once.
#[derive(Debug, Clone)]
pub struct Condition {
    pub tag: Tag,
    pub operator: Operator,
}

impl Condition {
    pub fn and(tag: impl Into<Tag>) -> Self {
        Self { tag: tag.into(), operator: Operator::And }
    }

    pub fn or(tag: impl Into<Tag>) -> Self {
        Self { tag: tag.into(), operator: Operator::Or }
    }

    pub fn not(tag: impl Into<Tag>) -> Self {
        Self { tag: tag.into(), operator: Operator::Not }
    }
}

/// Keys carrying `tags` under `scope`, combined with `operator`
///: AND intersects, OR unions, NOT returns keys with
/// none of `tags` out of every key known to the index in this scope.
pub fn query_tags(index: &TagIndex, scope: &Scope, tags: &[Tag], operator: Operator) -> Vec<String> {
    if tags.is_empty() {
        return Vec::new();
    }
    let union_or_intersection = |combine_or: bool| {
        let mut sets = tags.iter().map(|tag| index.keys_for_tag(scope, tag));
        let mut acc = sets.next().unwrap_or_default();
        for set in sets {
            acc = if combine_or {
                acc.union(&set).cloned().collect()
            } else {
                acc.intersection(&set).cloned().collect()
            };
        }
        acc
    };
    let result: BTreeSet<String> = match operator {
        Operator::And => union_or_intersection(false),
        Operator::Or => union_or_intersection(true),
        Operator::Not => {
            let excluded = union_or_intersection(true);
            index.all_keys(scope).difference(&excluded).cloned().collect()
        }
    };
    let mut result: Vec<String> = result.into_iter().collect();
    result.sort_unstable();
    result
}

/// Slice `keys` into a page of `page_size` starting at `page` (0-based).
pub fn paginate(keys: &[String], page: usize, page_size: usize) -> Vec<String> {
    if page_size == 0 {
        return Vec::new();
    }
    let start = page.saturating_mul(page_size).min(keys.len());
    let end = (start + page_size).min(keys.len());
    keys[start..end].to_vec()
}

/// Evaluate a left-fold boolean combination of tag conditions. An empty
/// condition list returns no keys.
pub fn complex_query(index: &TagIndex, scope: &Scope, conditions: &[Condition]) -> Vec<String> {
    let mut iter = conditions.iter();
    let mut acc: BTreeSet<String> = match iter.next() {
        Some(first) => index.keys_for_tag(scope, &first.tag),
        None => return Vec::new(),
    };
    for condition in iter {
        let matches = index.keys_for_tag(scope, &condition.tag);
        acc = match condition.operator {
            Operator::And => acc.intersection(&matches).cloned().collect(),
            Operator::Or => acc.union(&matches).cloned().collect(),
            Operator::Not => acc.difference(&matches).cloned().collect(),
        };
    }
    let mut result: Vec<String> = acc.into_iter().collect();
    result.sort_unstable();
    result
}
