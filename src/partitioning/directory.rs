//! Directory (tag) based placement.
//!
//! A key's tag is the prefix before the first delimiter byte, e.g. `tenant7`
//! for `tenant7:orders:42`. Tags are looked up in an explicit table that is
//! part of the topology, so it is persisted and versioned with everything
//! else. Keys without a tag, or whose tag has no entry, go to the default
//! shard.

use crate::types::{KeyRange, ShardId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Default tag delimiter.
pub const DEFAULT_TAG_DELIMITER: u8 = b':';

/// Explicit tag -> shard table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    delimiter: u8,
    tags: BTreeMap<String, ShardId>,
    default_shard: ShardId,
}

impl Directory {
    pub fn new(delimiter: u8, default_shard: ShardId) -> Self {
        Self {
            delimiter,
            tags: BTreeMap::new(),
            default_shard,
        }
    }

    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    pub fn default_shard(&self) -> ShardId {
        self.default_shard
    }

    pub fn set_default(&mut self, shard: ShardId) {
        self.default_shard = shard;
    }

    pub fn tags(&self) -> &BTreeMap<String, ShardId> {
        &self.tags
    }

    /// Tag of a key, if it has one.
    pub fn tag_of<'a>(&self, key: &'a [u8]) -> Option<&'a str> {
        let pos = key.iter().position(|&b| b == self.delimiter)?;
        if pos == 0 {
            return None;
        }
        std::str::from_utf8(&key[..pos]).ok()
    }

    /// Shard explicitly mapped for the key's tag.
    pub fn mapped_owner(&self, key: &[u8]) -> Option<(&str, ShardId)> {
        let tag = self.tag_of(key)?;
        self.tags.get_key_value(tag).map(|(t, &s)| (t.as_str(), s))
    }

    /// Owner of a key: its mapped tag's shard, or the default.
    pub fn owner_of(&self, key: &[u8]) -> ShardId {
        self.mapped_owner(key)
            .map(|(_, shard)| shard)
            .unwrap_or(self.default_shard)
    }

    /// Owner of a tag, mapped or not.
    pub fn owner_of_tag(&self, tag: &str) -> ShardId {
        self.tags.get(tag).copied().unwrap_or(self.default_shard)
    }

    pub fn is_mapped(&self, tag: &str) -> bool {
        self.tags.contains_key(tag)
    }

    pub fn assign(&mut self, tag: impl Into<String>, shard: ShardId) {
        self.tags.insert(tag.into(), shard);
    }

    /// Tags mapped to a shard.
    pub fn tags_of(&self, shard: ShardId) -> Vec<String> {
        self.tags
            .iter()
            .filter(|(_, &s)| s == shard)
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// Every shard the directory references.
    pub fn shards(&self) -> BTreeSet<ShardId> {
        let mut shards: BTreeSet<ShardId> = self.tags.values().copied().collect();
        shards.insert(self.default_shard);
        shards
    }

    /// Key interval holding exactly the keys with this tag.
    pub fn tag_bounds(&self, tag: &str) -> KeyRange {
        let mut start = tag.as_bytes().to_vec();
        start.push(self.delimiter);
        let mut end = tag.as_bytes().to_vec();
        match self.delimiter.checked_add(1) {
            Some(next) => {
                end.push(next);
                KeyRange::new(start, end)
            }
            None => KeyRange::starting_at(start),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_extraction() {
        let dir = Directory::new(DEFAULT_TAG_DELIMITER, 0);
        assert_eq!(dir.tag_of(b"tenant7:orders:42"), Some("tenant7"));
        assert_eq!(dir.tag_of(b"untagged"), None);
        assert_eq!(dir.tag_of(b":leading"), None);
    }

    #[test]
    fn test_mapped_and_default_owners() {
        let mut dir = Directory::new(b'/', 0);
        dir.assign("eu", 2);
        assert_eq!(dir.owner_of(b"eu/user-1"), 2);
        assert_eq!(dir.owner_of(b"us/user-1"), 0);
        assert_eq!(dir.owner_of(b"plain"), 0);
        assert_eq!(dir.owner_of_tag("us"), 0);
        assert_eq!(dir.tags_of(2), vec!["eu".to_string()]);
        assert_eq!(dir.shards().into_iter().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn test_tag_bounds_cover_only_tagged_keys() {
        let dir = Directory::new(DEFAULT_TAG_DELIMITER, 0);
        let bounds = dir.tag_bounds("acme");
        assert!(bounds.contains(b"acme:1"));
        assert!(bounds.contains(b"acme:zzz"));
        assert!(!bounds.contains(b"acme"));
        assert!(!bounds.contains(b"acmex:1"));
    }
}
