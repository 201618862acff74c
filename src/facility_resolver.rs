//! Maps free-text facility names to DHIS2 org unit identifiers.
//!
//! The local facility list and the DHIS2 registry do not spell names the same way, so lookups
//! go through an index keyed by every name variant an org unit exposes, case-folded and trimmed.
//! A lookup tries an exact key first and then falls back to a substring scan in both directions.
//!
//! The substring scan walks keys in the order they were indexed, so when several keys qualify
//! the one inserted first wins. That makes the fallback deterministic for a given registry
//! response, even though which of several loosely matching facilities is "right" is not
//! something the index can know.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// A registered facility or location node in DHIS2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgUnit {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub short_name: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

impl OrgUnit {
    /// Name variants in indexing precedence order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        [&self.display_name, &self.name, &self.short_name, &self.code]
            .into_iter()
            .flatten()
            .map(String::as_str)
    }
}

/// Bulk source of org units, normally the DHIS2 registry.
#[async_trait]
pub trait OrgUnitSource: Send + Sync {
    async fn fetch_org_units(&self) -> Result<Vec<OrgUnit>>;
}

/// Case-folds and trims a facility name into an index key.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Name-keyed index over org units.
#[derive(Debug, Clone, Default)]
pub struct OrgUnitIndex {
    entries: Vec<(String, OrgUnit)>,
    positions: HashMap<String, usize>,
    unit_count: usize,
}

impl OrgUnitIndex {
    pub fn build(org_units: Vec<OrgUnit>) -> Self {
        let mut index = Self {
            unit_count: org_units.len(),
            ..Self::default()
        };

        for unit in org_units {
            let keys: Vec<String> = unit
                .names()
                .map(normalize_name)
                .filter(|key| !key.is_empty())
                .collect();

            for key in keys {
                if index.positions.contains_key(&key) {
                    continue;
                }
                index.positions.insert(key.clone(), index.entries.len());
                index.entries.push((key, unit.clone()));
            }
        }

        index
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Number of org units the index was built from.
    pub fn unit_count(&self) -> usize {
        self.unit_count
    }

    /// Exact lookup on an already normalized key.
    pub fn exact(&self, key: &str) -> Option<&OrgUnit> {
        self.positions.get(key).map(|&i| &self.entries[i].1)
    }

    /// First indexed key that contains `key` or is contained by it.
    pub fn substring(&self, key: &str) -> Option<&OrgUnit> {
        self.entries
            .iter()
            .find(|(indexed, _)| indexed.contains(key) || key.contains(indexed.as_str()))
            .map(|(_, unit)| unit)
    }

    /// Exact match, then substring match.
    pub fn find(&self, key: &str) -> Option<&OrgUnit> {
        self.exact(key).or_else(|| self.substring(key))
    }
}

/// Read-through cache of the org unit registry.
///
/// The index is built once per session. It is only refetched when a lookup finds it empty;
/// otherwise it is replaced only by an explicit [`rebuild_index`](Self::rebuild_index) or
/// [`refresh`](Self::refresh).
pub struct FacilityResolver {
    index: Mutex<OrgUnitIndex>,
    source: Arc<dyn OrgUnitSource>,
    fetch_timeout: Duration,
}

impl FacilityResolver {
    pub fn new(source: Arc<dyn OrgUnitSource>, fetch_timeout: Duration) -> Self {
        Self {
            index: Mutex::new(OrgUnitIndex::default()),
            source,
            fetch_timeout,
        }
    }

    /// Replaces the whole index. Returns the number of keys indexed.
    pub fn rebuild_index(&self, org_units: Vec<OrgUnit>) -> usize {
        let index = OrgUnitIndex::build(org_units);
        let keys = index.len();
        info!("Loaded {} org units ({} name keys)", index.unit_count(), keys);
        *self.lock_index() = index;
        keys
    }

    /// Fetches the registry and rebuilds the index from it.
    pub async fn refresh(&self) -> Result<usize> {
        let org_units = match tokio::time::timeout(self.fetch_timeout, self.source.fetch_org_units()).await {
            Ok(result) => result?,
            Err(_) => return Err(CoreError::Timeout(self.fetch_timeout.as_secs())),
        };
        Ok(self.rebuild_index(org_units))
    }

    /// Resolves a facility name to its org unit id, or `None` when nothing matches.
    pub async fn resolve(&self, facility_name: &str) -> Option<String> {
        self.lookup(facility_name).await.map(|unit| unit.id)
    }

    /// Resolves a facility name to its full org unit record.
    ///
    /// An empty index is refetched once before giving up. Fetch failures are logged and treated
    /// as an empty registry.
    pub async fn lookup(&self, facility_name: &str) -> Option<OrgUnit> {
        let key = normalize_name(facility_name);
        if key.is_empty() {
            return None;
        }

        if let Some(unit) = self.find(&key) {
            return Some(unit);
        }

        if !self.is_empty() {
            debug!("No org unit matches \"{facility_name}\"");
            return None;
        }

        info!("Org unit index is empty, loading facilities from DHIS2...");
        if let Err(e) = self.refresh().await {
            warn!("Error loading org units: {e}");
        }

        let found = self.find(&key);
        if found.is_none() {
            debug!("No org unit matches \"{facility_name}\" after reload");
        }
        found
    }

    pub fn is_empty(&self) -> bool {
        self.lock_index().is_empty()
    }

    /// Copy of the current index.
    pub fn index(&self) -> OrgUnitIndex {
        self.lock_index().clone()
    }

    fn find(&self, key: &str) -> Option<OrgUnit> {
        self.lock_index().find(key).cloned()
    }

    fn lock_index(&self) -> MutexGuard<'_, OrgUnitIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
