use std::collections::{BTreeMap, BTreeSet};

use crate::store::ContentRecord;

pub const TITLE_CHAIN_DELIMITER: &str = " -> ";

#[derive(Debug, Clone)]
struct IndexEntry {
    title: String,
    parent_id: Option<String>,
}

/// Parent links between content records, keyed by source ID.
#[derive(Debug, Clone, Default)]
pub struct ContentIndex {
    entries: BTreeMap<String, IndexEntry>,
}

impl ContentIndex {
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a ContentRecord>,
    {
        let mut index = Self::default();
        for record in records {
            index.insert(&record.id, &record.title, record.parent_id.as_deref());
        }
        index
    }

    pub fn insert(&mut self, id: &str, title: &str, parent_id: Option<&str>) {
        self.entries.insert(
            id.to_string(),
            IndexEntry {
                title: title.to_string(),
                parent_id: parent_id.map(str::to_string),
            },
        );
    }

    /// Known ancestors of `id`, nearest first. The walk stops at a missing
    /// parent or the first repeated ID.
    pub fn ancestors(&self, id: &str) -> Vec<&str> {
        let mut out = Vec::new();
        let mut seen = BTreeSet::from([id]);
        let mut current = self.entries.get(id);
        while let Some(entry) = current {
            let Some(parent_id) = entry.parent_id.as_deref() else {
                break;
            };
            let Some((parent_key, parent)) = self.entries.get_key_value(parent_id) else {
                break;
            };
            if !seen.insert(parent_key.as_str()) {
                break;
            }
            out.push(parent_key.as_str());
            current = Some(parent);
        }
        out
    }

    /// Titles from the root down to `id`, joined with `delimiter`.
    pub fn title_chain(&self, id: &str, delimiter: &str) -> Option<String> {
        let own = self.entries.get(id)?;
        let mut titles: Vec<&str> = self
            .ancestors(id)
            .into_iter()
            .filter_map(|ancestor| self.entries.get(ancestor))
            .map(|entry| entry.title.as_str())
            .collect();
        titles.reverse();
        titles.push(own.title.as_str());
        Some(titles.join(delimiter))
    }
}
