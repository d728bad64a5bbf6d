//! Short identifier index.
//!
//! `index.json` maps short ids to entity ids and keeps one counter per
//! prefix. It is only read and written under the `index` lock. The older
//! single-counter format is upgraded in memory on load and written back in
//! the current format by the next save.

use super::{codec, durable, Result};
use crate::core::ids::ShortId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// Current on-disk format version.
pub const INDEX_SCHEMA_VERSION: u32 = 2;

const fn current_schema_version() -> u32 {
    INDEX_SCHEMA_VERSION
}

/// Counter map and short-id aliases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdIndex {
    /// Next number to issue per counter key (`PREFIX` or `PREFIX-SUB`).
    pub next_sequence: BTreeMap<String, u64>,
    #[serde(default = "current_schema_version")]
    pub schema_version: u32,
    /// Short id to entity id.
    #[serde(default)]
    pub short_ids: BTreeMap<String, String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredIndex {
    Current(IdIndex),
    Legacy {
        next_number: u64,
        #[serde(default)]
        short_ids: BTreeMap<String, String>,
    },
}

impl Default for IdIndex {
    fn default() -> Self {
        Self {
            next_sequence: BTreeMap::new(),
            schema_version: INDEX_SCHEMA_VERSION,
            short_ids: BTreeMap::new(),
        }
    }
}

/// Highest number observed per counter key.
fn observed_maxima<'a>(short_ids: impl IntoIterator<Item = &'a String>) -> BTreeMap<String, u64> {
    let mut maxima = BTreeMap::new();
    for raw in short_ids {
        if let Some(short) = ShortId::parse(raw) {
            let entry = maxima.entry(short.counter_key()).or_insert(0);
            *entry = (*entry).max(short.number());
        }
    }
    maxima
}

impl IdIndex {
    /// Loads the index, upgrading the legacy format when found.
    ///
    /// `primary_prefix` names the counter the legacy global counter seeds;
    /// when `None` it is inferred from the existing short ids. A missing file
    /// loads as an empty index.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or matches neither format.
    pub fn load(path: &Path, primary_prefix: Option<&str>) -> Result<Self> {
        let Some(bytes) = durable::read_optional(path)? else {
            return Ok(Self::default());
        };
        match serde_json::from_slice::<StoredIndex>(&bytes)? {
            StoredIndex::Current(index) => Ok(index),
            StoredIndex::Legacy {
                next_number,
                short_ids,
            } => {
                let index = Self::upgrade_legacy(next_number, short_ids, primary_prefix);
                info!(
                    path = %path.display(),
                    counters = index.next_sequence.len(),
                    "upgraded legacy short-id index"
                );
                Ok(index)
            }
        }
    }

    fn upgrade_legacy(
        next_number: u64,
        short_ids: BTreeMap<String, String>,
        primary_prefix: Option<&str>,
    ) -> Self {
        let mut index = Self {
            next_sequence: observed_maxima(short_ids.keys())
                .into_iter()
                .map(|(key, max)| (key, max + 1))
                .collect(),
            schema_version: INDEX_SCHEMA_VERSION,
            short_ids,
        };
        let primary = primary_prefix
            .map(str::to_string)
            .or_else(|| index.infer_primary());
        if let Some(primary) = primary {
            let entry = index.next_sequence.entry(primary).or_insert(1);
            *entry = (*entry).max(next_number).max(1);
        }
        index
    }

    /// The counter key used by most short ids; ties go to the smallest key.
    #[must_use]
    pub fn infer_primary(&self) -> Option<String> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for raw in self.short_ids.keys() {
            if let Some(short) = ShortId::parse(raw) {
                *counts.entry(short.counter_key()).or_insert(0) += 1;
            }
        }
        // BTreeMap iterates keys ascending, so the first maximum wins ties.
        let mut best: Option<(String, usize)> = None;
        for (key, count) in counts {
            if best.as_ref().map_or(true, |(_, c)| count > *c) {
                best = Some((key, count));
            }
        }
        best.map(|(key, _)| key)
    }

    /// Issues the next short id for `counter_key` and maps it to `entity_id`.
    ///
    /// Numbers already present in the map are skipped, so a lagging counter
    /// never reissues an alias. Returns `None` if `counter_key` is malformed.
    pub fn allocate(&mut self, counter_key: &str, entity_id: &str) -> Option<ShortId> {
        let mut next = self.next_sequence.get(counter_key).copied().unwrap_or(1).max(1);
        let short = loop {
            let candidate = ShortId::from_counter(counter_key, next)?;
            if !self.short_ids.contains_key(&candidate.to_string()) {
                break candidate;
            }
            next += 1;
        };
        self.short_ids.insert(short.to_string(), entity_id.to_string());
        self.next_sequence.insert(counter_key.to_string(), next + 1);
        Some(short)
    }

    /// Looks up the entity behind a short id.
    #[must_use]
    pub fn resolve(&self, short_id: &str) -> Option<&str> {
        self.short_ids.get(short_id).map(String::as_str)
    }

    /// Counters that lag behind the short ids already issued.
    #[must_use]
    pub fn lagging_counters(&self) -> Vec<(String, u64, u64)> {
        observed_maxima(self.short_ids.keys())
            .into_iter()
            .filter_map(|(key, max)| {
                let next = self.next_sequence.get(&key).copied().unwrap_or(0);
                (next <= max).then_some((key, next, max))
            })
            .collect()
    }

    /// Recomputes an index from `(short_id, entity_id)` pairs.
    #[must_use]
    pub fn rebuild<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let short_ids: BTreeMap<String, String> = pairs.into_iter().collect();
        Self {
            next_sequence: observed_maxima(short_ids.keys())
                .into_iter()
                .map(|(key, max)| (key, max + 1))
                .collect(),
            schema_version: INDEX_SCHEMA_VERSION,
            short_ids,
        }
    }

    /// Writes the index atomically in canonical form.
    ///
    /// # Errors
    /// Returns an error if encoding or the atomic write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        durable::atomic_replace(path, &codec::encode_document(self)?)
    }
}
