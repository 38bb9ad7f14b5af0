//! In-memory tag index: a forward map from key to its
//! tag set plus a reverse map from tag to the keys carrying it, kept in
//! sync with the catalog so that tag queries never need to scan every
//! record.

use std::collections::BTreeSet;

use dashmap::DashMap;

use crate::record::{Scope, Tag};

fn scope_prefix(scope: &Scope) -> String {
    format!("{}\0{}\0", scope.db, scope.namespace)
}

fn scoped(scope: &Scope, value: &str) -> String {
    format!("{}{}", scope_prefix(scope), value)
}

/// Tracks, per tag, how many live keys carry it — used to prioritize
/// `optimize()` and to answer "most popular tags" queries cheaply.
#[derive(Debug, Default, Clone, Copy)]
pub struct TagStats {
    pub key_count: usize,
}

/// Forward (key -> tags) and reverse (tag -> keys) indexes over tags,
/// scoped by `(db, namespace)`.
#[derive(Default)]
pub struct TagIndex {
    forward: DashMap<String, BTreeSet<Tag>>,
    reverse: DashMap<String, BTreeSet<String>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the tag set for `key`, updating the reverse index for
    /// both removed and added tags.
    pub fn set_tags(&self, scope: &Scope, key: &str, tags: &BTreeSet<Tag>) {
        let fk = scoped(scope, key);
        let previous = self.forward.insert(fk.clone(), tags.clone()).unwrap_or_default();
        for removed in previous.difference(tags) {
            let rk = scoped(scope, removed);
            if let Some(mut keys) = self.reverse.get_mut(&rk) {
                keys.remove(&fk);
            }
        }
        for added in tags.difference(&previous) {
            let rk = scoped(scope, added);
            self.reverse.entry(rk).or_default().insert(fk.clone());
        }
    }

    pub fn remove_key(&self, scope: &Scope, key: &str) {
        let fk = scoped(scope, key);
        if let Some((_, tags)) = self.forward.remove(&fk) {
            for tag in tags {
                let rk = scoped(scope, &tag);
                if let Some(mut keys) = self.reverse.get_mut(&rk) {
                    keys.remove(&fk);
                }
            }
        }
    }

    pub fn tags_for_key(&self, scope: &Scope, key: &str) -> BTreeSet<Tag> {
        self.forward.get(&scoped(scope, key)).map(|v| v.clone()).unwrap_or_default()
    }

    /// Keys carrying `tag` within `scope`, stripped of their scope
    /// prefix.
    pub fn keys_for_tag(&self, scope: &Scope, tag: &Tag) -> BTreeSet<String> {
        let prefix = scope_prefix(scope);
        self.reverse
            .get(&scoped(scope, tag))
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| k.strip_prefix(prefix.as_str()).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every key that has ever had a tag set assigned (even empty),
    /// within `scope`. This is the "universe" a `NOT` query subtracts
    /// from: `NOT` is the keys with none of the given tags, computed as
    /// (universe for db/ns) minus the union of the tag list. It relies
    /// on the store calling [`Self::set_tags`] for every write, tagged
    /// or not.
    pub fn all_keys(&self, scope: &Scope) -> BTreeSet<String> {
        let prefix = scope_prefix(scope);
        self.forward
            .iter()
            .filter_map(|entry| entry.key().strip_prefix(prefix.as_str()).map(str::to_string))
            .collect()
    }

    pub fn tag_stats(&self, scope: &Scope, tag: &Tag) -> TagStats {
        TagStats {
            key_count: self.keys_for_tag(scope, tag).len(),
        }
    }

    /// Drop reverse-index entries left empty by key removals. Index
    /// correctness never depends on calling this; it only reclaims
    /// memory.
    pub fn optimize(&self) {
        self.reverse.retain(|_, keys| !keys.is_empty());
    }

    pub fn forward_len(&self) -> usize {
        self.forward.len()
    }

    pub fn reverse_len(&self) -> usize {
        self.reverse.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(values: &[&str]) -> BTreeSet<Tag> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn set_tags_populates_forward_and_reverse() {
        let index = TagIndex::new();
        let scope = Scope::new("db", "ns");
        index.set_tags(&scope, "k1", &tags(&["red", "big"]));
        assert_eq!(index.tags_for_key(&scope, "k1"), tags(&["red", "big"]));
        assert_eq!(index.keys_for_tag(&scope, &"red".to_string()), ["k1".to_string()].into());
    }

    #[test]
    fn set_tags_again_removes_stale_reverse_entries() {
        let index = TagIndex::new();
        let scope = Scope::new("db", "ns");
        index.set_tags(&scope, "k1", &tags(&["red"]));
        index.set_tags(&scope, "k1", &tags(&["blue"]));
        assert!(index.keys_for_tag(&scope, &"red".to_string()).is_empty());
        assert_eq!(index.keys_for_tag(&scope, &"blue".to_string()), ["k1".to_string()].into());
    }

    #[test]
    fn remove_key_clears_both_directions() {
        let index = TagIndex::new();
        let scope = Scope::new("db", "ns");
        index.set_tags(&scope, "k1", &tags(&["red"]));
        index.remove_key(&scope, "k1");
        assert!(index.tags_for_key(&scope, "k1").is_empty());
        assert!(index.keys_for_tag(&scope, &"red".to_string()).is_empty());
    }

    #[test]
    fn scopes_do_not_leak_into_each_other() {
        let index = TagIndex::new();
        let db1 = Scope::new("db1", "ns");
        let db2 = Scope::new("db2", "ns");
        index.set_tags(&db1, "k1", &tags(&["red"]));
        assert!(index.keys_for_tag(&db2, &"red".to_string()).is_empty());
    }

    #[test]
    fn all_keys_tracks_every_tagged_write_including_untagged() {
        let index = TagIndex::new();
        let scope = Scope::new("db", "ns");
        index.set_tags(&scope, "k1", &tags(&["red"]));
        index.set_tags(&scope, "k2", &BTreeSet::new());
        let mut keys: Vec<String> = index.all_keys(&scope).into_iter().collect();
        keys.sort();
        assert_eq!(keys, vec!["k1".to_string(), "k2".to_string()]);
    }

    #[test]
    fn optimize_prunes_empty_reverse_entries() {
        let index = TagIndex::new();
        let scope = Scope::new("db", "ns");
        index.set_tags(&scope, "k1", &tags(&["red"]));
        index.remove_key(&scope, "k1");
        assert_eq!(index.reverse_len(), 1);
        index.optimize();
        assert_eq!(index.reverse_len(), 0);
    }
}
