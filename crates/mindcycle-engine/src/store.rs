//! PersistenceStore implementations: in-memory and one-JSON-file-per-cycle

use crate::error::StoreError;
use crate::ports::PersistenceStore;
use async_trait::async_trait;
use mindcycle_core::{MindMoment, MomentId, SigilArt};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

// ============================================================
// In-memory
// ============================================================

#[derive(Default)]
struct MemoryInner {
    by_cycle: BTreeMap<u64, MindMoment>,
    by_id: HashMap<MomentId, u64>,
}

/// Volatile store. Used when no store path is configured, and in tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with historical moments (ids are assigned).
    pub fn with_moments(moments: impl IntoIterator<Item = MindMoment>) -> Self {
        let mut inner = MemoryInner::default();
        for mut moment in moments {
            let id = MomentId::new(uuid::Uuid::new_v4().to_string());
            moment.id = Some(id.clone());
            inner.by_id.insert(id, moment.cycle);
            inner.by_cycle.insert(moment.cycle, moment);
        }
        Self { inner: RwLock::new(inner) }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_cycle.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn insert_mind_moment(&self, moment: &MindMoment) -> Result<MomentId, StoreError> {
        let id = MomentId::new(uuid::Uuid::new_v4().to_string());
        let mut stored = moment.clone();
        stored.id = Some(id.clone());
        stored.art = None;

        let mut inner = self.inner.write().await;
        if let Some(old) = inner.by_cycle.insert(stored.cycle, stored) {
            if let Some(old_id) = old.id {
                inner.by_id.remove(&old_id);
            }
        }
        inner.by_id.insert(id.clone(), moment.cycle);
        Ok(id)
    }

    async fn update_mind_moment_art(&self, id: &MomentId, art: &SigilArt) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let cycle = *inner
            .by_id
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let moment = inner
            .by_cycle
            .get_mut(&cycle)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        moment.art = Some(art.clone());
        Ok(())
    }

    async fn prior_moments(&self, limit: usize) -> Result<Vec<MindMoment>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.by_cycle.values().rev().take(limit).cloned().collect())
    }

    async fn eligible_dream_cycles(&self) -> Result<Vec<u64>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_cycle
            .values()
            .filter(|m| m.is_dream_eligible())
            .map(|m| m.cycle)
            .collect())
    }

    async fn mind_moment_by_cycle(&self, cycle: u64) -> Result<Option<MindMoment>, StoreError> {
        Ok(self.inner.read().await.by_cycle.get(&cycle).cloned())
    }

    async fn latest_cycle(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.inner.read().await.by_cycle.keys().next_back().copied())
    }
}

// ============================================================
// JSON files
// ============================================================

const FILE_PREFIX: &str = "moment-";
const ID_PREFIX: &str = "cycle-";

/// One `moment-<cycle>.json` per moment under a directory.
/// Writes go to a `.json.tmp` sibling first and are renamed into place.
pub struct JsonFileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open (creating if needed) a store directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        debug!("JSON store at {}", dir.display());
        Ok(Self { dir, write_lock: Mutex::new(()) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, cycle: u64) -> PathBuf {
        self.dir.join(format!("{}{:010}.json", FILE_PREFIX, cycle))
    }

    fn id_for(cycle: u64) -> MomentId {
        MomentId::new(format!("{}{}", ID_PREFIX, cycle))
    }

    fn cycle_of(id: &MomentId) -> Result<u64, StoreError> {
        id.as_str()
            .strip_prefix(ID_PREFIX)
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Persisted cycles, ascending.
    async fn cycles(&self) -> Result<Vec<u64>, StoreError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut cycles = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(cycle) = name
                .strip_prefix(FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(|n| n.parse::<u64>().ok())
            {
                cycles.push(cycle);
            }
        }
        cycles.sort_unstable();
        Ok(cycles)
    }

    async fn read(&self, cycle: u64) -> Result<Option<MindMoment>, StoreError> {
        match tokio::fs::read_to_string(self.path_for(cycle)).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read, skipping (and logging) records that no longer parse.
    async fn read_lenient(&self, cycle: u64) -> Option<MindMoment> {
        match self.read(cycle).await {
            Ok(m) => m,
            Err(e) => {
                warn!("Skipping unreadable moment {}: {}", cycle, e);
                None
            }
        }
    }

    async fn write(&self, moment: &MindMoment) -> Result<(), StoreError> {
        let path = self.path_for(moment.cycle);
        let json = serde_json::to_string_pretty(moment)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceStore for JsonFileStore {
    async fn insert_mind_moment(&self, moment: &MindMoment) -> Result<MomentId, StoreError> {
        let id = Self::id_for(moment.cycle);
        let mut stored = moment.clone();
        stored.id = Some(id.clone());
        stored.art = None;

        let _guard = self.write_lock.lock().await;
        self.write(&stored).await?;
        Ok(id)
    }

    async fn update_mind_moment_art(&self, id: &MomentId, art: &SigilArt) -> Result<(), StoreError> {
        let cycle = Self::cycle_of(id)?;
        let _guard = self.write_lock.lock().await;
        let mut moment = self
            .read(cycle)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        moment.art = Some(art.clone());
        self.write(&moment).await
    }

    async fn prior_moments(&self, limit: usize) -> Result<Vec<MindMoment>, StoreError> {
        let mut out = Vec::with_capacity(limit);
        for cycle in self.cycles().await?.into_iter().rev() {
            if out.len() >= limit {
                break;
            }
            if let Some(m) = self.read_lenient(cycle).await {
                out.push(m);
            }
        }
        Ok(out)
    }

    async fn eligible_dream_cycles(&self) -> Result<Vec<u64>, StoreError> {
        let mut out = Vec::new();
        for cycle in self.cycles().await? {
            if let Some(m) = self.read_lenient(cycle).await {
                if m.is_dream_eligible() {
                    out.push(cycle);
                }
            }
        }
        Ok(out)
    }

    async fn mind_moment_by_cycle(&self, cycle: u64) -> Result<Option<MindMoment>, StoreError> {
        self.read(cycle).await
    }

    async fn latest_cycle(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.cycles().await?.last().copied())
    }
}
