//! Metadata catalog: a `redb`-backed store of [`Metadata`] records for
//! backends that do not hold metadata natively.
//!
//! A `TableDefinition`/`MultimapTableDefinition` pair wrapped behind a
//! single catalog-wide mutex that serializes write transactions, while
//! reads use independent read transactions.

use std::path::Path;

use parking_lot::Mutex;
use redb::{Database, MultimapTableDefinition, ReadableTable, ReadableMultimapTable, TableDefinition, WriteTransaction};

use crate::error::{StoreError, StoreResult};
use crate::record::{Metadata, Scope, Tag};
use crate::wire;

const METADATA_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("metadata");
const TAGS_TABLE: MultimapTableDefinition<&str, &str> = MultimapTableDefinition::new("metadata_tags");

fn catalog_key(scope: &Scope, key: &str) -> String {
    format!("{}\0{}\0{}", scope.db, scope.namespace, key)
}

fn tag_key(scope: &Scope, tag: &str) -> String {
    format!("{}\0{}\0{}", scope.db, scope.namespace, tag)
}

/// Remove one record and its tag links within an already-open write
/// transaction, so a caller removing several records can commit them
/// all atomically. Caller holds `write_lock` and commits `txn`.
fn delete_in_txn(txn: &WriteTransaction, scope: &Scope, key: &str) -> StoreResult<Option<Metadata>> {
    let ck = catalog_key(scope, key);
    let removed = {
        let mut table = txn.open_table(METADATA_TABLE)?;
        let removed = table.remove(ck.as_str())?;
        match removed {
            Some(value) => Some(wire::decode::<Metadata>(value.value().as_slice())?),
            None => None,
        }
    };
    if let Some(record) = &removed {
        let mut tags_table = txn.open_multimap_table(TAGS_TABLE)?;
        for tag in &record.tags {
            tags_table.remove(tag_key(&record.scope, tag).as_str(), ck.as_str())?;
        }
    }
    Ok(removed)
}

/// Durable catalog of metadata records, independent of where value
/// bytes themselves are stored.
pub struct Catalog {
    db: Database,
    // redb write transactions are not meant to run concurrently from
    // one process; serialize them here.
    write_lock: Mutex<()>,
}

impl Catalog {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db = Database::create(path.as_ref())?;
        {
            let txn = db.begin_write()?;
            {
                txn.open_table(METADATA_TABLE)?;
                txn.open_multimap_table(TAGS_TABLE)?;
            }
            txn.commit()?;
        }
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    pub fn upsert(&self, record: &Metadata) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        let encoded = wire::encode(record)?;
        let ck = catalog_key(&record.scope, record.key.as_str());

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(METADATA_TABLE)?;
            if let Some(existing) = table.get(ck.as_str())? {
                let previous: Metadata = wire::decode(existing.value().as_slice())?;
                drop(existing);
                let mut tags_table = txn.open_multimap_table(TAGS_TABLE)?;
                for tag in &previous.tags {
                    tags_table.remove(tag_key(&previous.scope, tag).as_str(), ck.as_str())?;
                }
            }
            table.insert(ck.as_str(), encoded)?;
            let mut tags_table = txn.open_multimap_table(TAGS_TABLE)?;
            for tag in &record.tags {
                tags_table.insert(tag_key(&record.scope, tag).as_str(), ck.as_str())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get(&self, scope: &Scope, key: &str) -> StoreResult<Option<Metadata>> {
        let ck = catalog_key(scope, key);
        let txn = self.db.begin_read()?;
        let table = txn.open_table(METADATA_TABLE)?;
        match table.get(ck.as_str())? {
            Some(value) => Ok(Some(wire::decode(value.value().as_slice())?)),
            None => Ok(None),
        }
    }

    pub fn delete(&self, scope: &Scope, key: &str) -> StoreResult<Option<Metadata>> {
        let _guard = self.write_lock.lock();
        let txn = self.db.begin_write()?;
        let removed = delete_in_txn(&txn, scope, key)?;
        txn.commit()?;
        Ok(removed)
    }

    /// All metadata records under `scope`. Used by callers that already
    /// hold the whole set in memory (e.g. index rebuild); not intended
    /// for hot-path per-request use on large scopes.
    pub fn query_scope(&self, scope: &Scope) -> StoreResult<Vec<Metadata>> {
        let prefix = format!("{}\0{}\0", scope.db, scope.namespace);
        let txn = self.db.begin_read()?;
        let table = txn.open_table(METADATA_TABLE)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            if k.value().starts_with(&prefix) {
                out.push(wire::decode(v.value().as_slice())?);
            }
        }
        Ok(out)
    }

    /// Keys tagged `tag` within `scope`, via the reverse index.
    pub fn keys_for_tag(&self, scope: &Scope, tag: &Tag) -> StoreResult<Vec<String>> {
        let tk = tag_key(scope, tag);
        let txn = self.db.begin_read()?;
        let table = txn.open_multimap_table(TAGS_TABLE)?;
        let mut out = Vec::new();
        let prefix = format!("{}\0{}\0", scope.db, scope.namespace);
        for entry in table.get(tk.as_str())? {
            let ck = entry?;
            let ck = ck.value().to_string();
            if let Some(rest) = ck.strip_prefix(&prefix) {
                out.push(rest.to_string());
            }
        }
        Ok(out)
    }

    /// Delete and return every expired record under `scope`, all
    /// removals committed in a single transaction.
    pub fn cleanup_expired(&self, scope: &Scope, now: i64) -> StoreResult<Vec<Metadata>> {
        let candidates = self.query_scope(scope)?;
        let _guard = self.write_lock.lock();
        let txn = self.db.begin_write()?;
        let mut expired = Vec::new();
        for record in candidates {
            if record.is_expired(now) {
                if let Some(removed) = delete_in_txn(&txn, scope, record.key.as_str())? {
                    expired.push(removed);
                }
            }
        }
        txn.commit()?;
        Ok(expired)
    }

    /// Records under `scope` matching every constraint present in
    /// `query` (tags are conjunctive — a record must carry all of
    /// them). `key_pattern` is matched with [`like_matches`]; callers
    /// embedding a literal fragment should run it through
    /// [`escape_like_literal`] first so `%`/`_` in the literal aren't
    /// read as wildcards.
    pub fn query_metadata(&self, query: &MetadataQuery<'_>) -> StoreResult<Vec<Metadata>> {
        let mut tagged_keys: Option<std::collections::BTreeSet<String>> = None;
        if let Some(tags) = query.tags {
            for tag in tags {
                let keys: std::collections::BTreeSet<String> = self.keys_for_tag(query.scope, tag)?.into_iter().collect();
                tagged_keys = Some(match tagged_keys {
                    Some(acc) => acc.intersection(&keys).cloned().collect(),
                    None => keys,
                });
            }
        }

        let mut out = Vec::new();
        for record in self.query_scope(query.scope)? {
            if let Some(tagged_keys) = &tagged_keys {
                if !tagged_keys.contains(record.key.as_str()) {
                    continue;
                }
            }
            if let Some((min, max)) = query.size_range {
                if record.size < min || record.size > max {
                    continue;
                }
            }
            if let Some(has_ttl) = query.has_ttl {
                if record.ttl_seconds.is_some() != has_ttl {
                    continue;
                }
            }
            if let Some(pattern) = query.key_pattern {
                if !like_matches(pattern, record.key.as_str()) {
                    continue;
                }
            }
            out.push(record);
        }
        Ok(out)
    }
}

/// Constraints for [`Catalog::query_metadata`]; every `Some` field
/// narrows the match and all present constraints are ANDed together.
#[derive(Debug, Clone, Copy)]
pub struct MetadataQuery<'a> {
    pub scope: &'a Scope,
    /// Keys must carry every tag listed (intersection, not union).
    pub tags: Option<&'a [Tag]>,
    /// Inclusive `(min, max)` byte size.
    pub size_range: Option<(u64, u64)>,
    /// `Some(true)` matches only records with a TTL set, `Some(false)`
    /// only records without one.
    pub has_ttl: Option<bool>,
    /// A `%`/`_` glob pattern, pre-escaped by the caller via
    /// [`escape_like_literal`] wherever a literal fragment is embedded.
    pub key_pattern: Option<&'a str>,
}

/// Escape `%` and `_` in a literal fragment so it can be embedded in a
/// SQL-`LIKE`-style pattern without being interpreted as a wildcard.
pub fn escape_like_literal(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for ch in literal.chars() {
        if ch == '%' || ch == '_' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Match `text` against a `%`/`_` glob pattern where those wildcards can
/// be escaped with a leading backslash (companion to
/// [`escape_like_literal`]).
pub fn like_matches(pattern: &str, text: &str) -> bool {
    fn matches_from(pattern: &[char], text: &[char]) -> bool {
        match pattern.split_first() {
            None => text.is_empty(),
            Some(('\\', rest)) => match rest.split_first() {
                Some((&literal, rest)) => {
                    matches!(text.split_first(), Some((&c, tail)) if c == literal) && {
                        matches_from(rest, &text[1..])
                    }
                }
                None => false,
            },
            Some(('%', rest)) => {
                if matches_from(rest, text) {
                    return true;
                }
                !text.is_empty() && matches_from(pattern, &text[1..])
            }
            Some(('_', rest)) => !text.is_empty() && matches_from(rest, &text[1..]),
            Some((&c, rest)) => matches!(text.split_first(), Some((&t, tail)) if t == c) && {
                matches_from(rest, &text[1..])
            },
        }
    }
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    matches_from(&pattern, &text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::StoreKey;
    use std::collections::BTreeSet;

    fn sample(scope: &Scope, key: &str, tags: &[&str]) -> Metadata {
        Metadata {
            path: format!("path/{key}"),
            scope: scope.clone(),
            key: StoreKey::new(key).unwrap(),
            size: 10,
            created_at: 0,
            last_updated: 0,
            last_accessed: 0,
            ttl_seconds: None,
            tags: tags.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>(),
        }
    }

    #[test]
    fn upsert_get_delete_round_trips() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let catalog = Catalog::open(tmp.path()).unwrap();
        let scope = Scope::new("db", "ns");
        let record = sample(&scope, "k1", &["red", "big"]);
        catalog.upsert(&record).unwrap();
        assert_eq!(catalog.get(&scope, "k1").unwrap().unwrap().size, 10);
        catalog.delete(&scope, "k1").unwrap();
        assert!(catalog.get(&scope, "k1").unwrap().is_none());
    }

    #[test]
    fn tag_reverse_index_updates_on_overwrite() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let catalog = Catalog::open(tmp.path()).unwrap();
        let scope = Scope::new("db", "ns");
        catalog.upsert(&sample(&scope, "k1", &["red"])).unwrap();
        assert_eq!(catalog.keys_for_tag(&scope, &"red".to_string()).unwrap(), vec!["k1"]);
        catalog.upsert(&sample(&scope, "k1", &["blue"])).unwrap();
        assert!(catalog.keys_for_tag(&scope, &"red".to_string()).unwrap().is_empty());
        assert_eq!(catalog.keys_for_tag(&scope, &"blue".to_string()).unwrap(), vec!["k1"]);
    }

    #[test]
    fn cleanup_expired_removes_only_expired_records() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let catalog = Catalog::open(tmp.path()).unwrap();
        let scope = Scope::new("db", "ns");
        let mut expiring = sample(&scope, "expiring", &[]);
        expiring.ttl_seconds = Some(10);
        expiring.last_updated = 0;
        catalog.upsert(&expiring).unwrap();
        catalog.upsert(&sample(&scope, "forever", &[])).unwrap();

        let expired = catalog.cleanup_expired(&scope, 100).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key.as_str(), "expiring");
        assert!(catalog.get(&scope, "forever").unwrap().is_some());
    }

    #[test]
    fn like_matches_wildcards_and_escapes() {
        assert!(like_matches("a%c", "abbbc"));
        assert!(like_matches("a_c", "abc"));
        assert!(!like_matches("a_c", "abbc"));
        let escaped = escape_like_literal("50%_off");
        assert!(like_matches(&escaped, "50%_off"));
        assert!(!like_matches(&escaped, "50xoff"));
    }

    #[test]
    fn query_metadata_combines_tags_size_ttl_and_pattern() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let catalog = Catalog::open(tmp.path()).unwrap();
        let scope = Scope::new("db", "ns");

        let mut small_red = sample(&scope, "small-red", &["red"]);
        small_red.size = 5;
        catalog.upsert(&small_red).unwrap();

        let mut big_red = sample(&scope, "big-red", &["red", "big"]);
        big_red.size = 500;
        big_red.ttl_seconds = Some(60);
        catalog.upsert(&big_red).unwrap();

        catalog.upsert(&sample(&scope, "small-blue", &["blue"])).unwrap();

        let matches = catalog
            .query_metadata(&MetadataQuery {
                scope: &scope,
                tags: Some(&["red".to_string()]),
                size_range: Some((100, 1_000)),
                has_ttl: Some(true),
                key_pattern: None,
            })
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].key.as_str(), "big-red");

        let no_ttl = catalog
            .query_metadata(&MetadataQuery { scope: &scope, tags: Some(&["red".to_string()]), size_range: None, has_ttl: Some(false), key_pattern: None })
            .unwrap();
        assert_eq!(no_ttl.len(), 1);
        assert_eq!(no_ttl[0].key.as_str(), "small-red");
    }

    /// A key literally named `a_b%c` must only match a `key_pattern`
    /// that escapes its `_`/`%` as literals, proving `query_metadata`
    /// treats caller-escaped patterns as literal text, not wildcards.
    #[test]
    fn query_metadata_key_pattern_escapes_literal_wildcard_characters() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let catalog = Catalog::open(tmp.path()).unwrap();
        let scope = Scope::new("db", "ns");
        catalog.upsert(&sample(&scope, "a_b%c", &[])).unwrap();
        catalog.upsert(&sample(&scope, "axbyc", &[])).unwrap();

        let literal_pattern = escape_like_literal("a_b%c");
        let exact = catalog
            .query_metadata(&MetadataQuery { scope: &scope, tags: None, size_range: None, has_ttl: None, key_pattern: Some(&literal_pattern) })
            .unwrap();
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].key.as_str(), "a_b%c");

        let wildcard = catalog
            .query_metadata(&MetadataQuery { scope: &scope, tags: None, size_range: None, has_ttl: None, key_pattern: Some("a_b%c") })
            .unwrap();
        assert_eq!(
            wildcard.iter().map(|m| m.key.as_str()).collect::<BTreeSet<_>>(),
            BTreeSet::from(["a_b%c", "axbyc"])
        );
    }
}
