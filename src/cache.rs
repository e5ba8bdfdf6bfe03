//! Artifact cache
//!
//! Every distinct specialization of a kernel is translated and built at most
//! once per process. Builds of the same key are serialized on a per-key slot;
//! different keys build in parallel. With persistence enabled, artifacts are
//! also written below the cache directory and reloaded by later processes.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::artifact::CompiledArtifact;
use crate::cppast::TranslationUnit;
use crate::error::KernelResult;
use crate::kernel::{Kernel, KernelId, Specialization};
use crate::toolchain::Toolchain;
use crate::translator::translate;

const META_FILE: &str = "meta.json";
const UNIT_FILE: &str = "unit.json";

/// Everything a built artifact depends on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub kernel: KernelId,
    pub spec: Specialization,
    pub toolchain: String,
}

impl CacheKey {
    pub fn new(kernel: &Kernel, spec: &Specialization, toolchain: &dyn Toolchain) -> Self {
        Self {
            kernel: kernel.identity(),
            spec: spec.clone(),
            toolchain: toolchain.name(),
        }
    }

    /// blake3 hex digest of the key's JSON form
    pub fn fingerprint(&self) -> String {
        // Maps in the key are BTreeMaps, so the JSON is canonical
        let json = serde_json::to_vec(self).unwrap_or_default();
        blake3::hash(&json).to_hex().to_string()
    }
}

type Slot = Arc<Mutex<Option<Arc<CompiledArtifact>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct ArtifactCache {
    disk: Option<PathBuf>,
    slots: Mutex<HashMap<CacheKey, Slot>>,
    builds: AtomicUsize,
    disk_loads: AtomicUsize,
}

impl ArtifactCache {
    /// Memory-only cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache that also persists artifacts below `dir`
    pub fn with_disk(dir: impl Into<PathBuf>) -> Self {
        Self {
            disk: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn disk_dir(&self) -> Option<&Path> {
        self.disk.as_deref()
    }

    /// Number of toolchain builds performed by this cache
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Number of artifacts reloaded from disk instead of built
    pub fn disk_loads(&self) -> usize {
        self.disk_loads.load(Ordering::SeqCst)
    }

    /// Number of artifacts held in memory
    pub fn len(&self) -> usize {
        lock(&self.slots)
            .values()
            .filter(|slot| lock(slot).is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The artifact for `spec`, building it on first use
    pub fn get_or_build(
        &self,
        kernel: &Kernel,
        spec: &Specialization,
        toolchain: &dyn Toolchain,
    ) -> KernelResult<Arc<CompiledArtifact>> {
        let key = CacheKey::new(kernel, spec, toolchain);
        let slot = lock(&self.slots).entry(key.clone()).or_default().clone();

        let mut entry = lock(&slot);
        if let Some(artifact) = entry.as_ref() {
            log::debug!("cache hit for {}", key.kernel);
            return Ok(artifact.clone());
        }
        log::debug!("cache miss for {} ({:?} on {})", key.kernel, key.spec.policy, key.spec.space);

        // A failed build leaves the slot empty so the next call retries
        let artifact = Arc::new(self.build(kernel, &key, toolchain)?);
        *entry = Some(artifact.clone());
        Ok(artifact)
    }

    fn entry_dir(&self, key: &CacheKey, fingerprint: &str) -> Option<PathBuf> {
        self.disk
            .as_ref()
            .map(|root| root.join(key.spec.space.tag()).join(fingerprint))
    }

    fn build(&self, kernel: &Kernel, key: &CacheKey, toolchain: &dyn Toolchain) -> KernelResult<CompiledArtifact> {
        let fingerprint = key.fingerprint();
        let mut dir = self.entry_dir(key, &fingerprint);

        if let Some(dir) = &dir {
            if let Some(artifact) = self.load(key, &fingerprint, dir, toolchain) {
                self.disk_loads.fetch_add(1, Ordering::SeqCst);
                log::debug!("loaded {} from {}", key.kernel, dir.display());
                return Ok(artifact);
            }
        }

        let unit = Arc::new(translate(kernel, &key.spec)?);
        if let Some(path) = &dir {
            if let Err(err) = std::fs::create_dir_all(path) {
                log::warn!("not persisting {}: cannot create {}: {}", key.kernel, path.display(), err);
                dir = None;
            }
        }

        let built = toolchain.build(unit.clone(), &key.spec, dir.as_deref())?;
        let count = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
        log::info!("built {} with {} (build #{})", key.kernel, key.toolchain, count);

        if let Some(path) = &dir {
            if let Err(err) = persist(key, &unit, path) {
                log::warn!("failed to persist {} to {}: {}", key.kernel, path.display(), err);
            }
        }

        Ok(CompiledArtifact::new(key.kernel.clone(), fingerprint, key.toolchain.clone(), unit, built.launcher)
            .with_source(built.source)
            .with_location(dir))
    }

    /// Reload a persisted entry; any unreadable or mismatched file is a miss
    fn load(
        &self,
        key: &CacheKey,
        fingerprint: &str,
        dir: &Path,
        toolchain: &dyn Toolchain,
    ) -> Option<CompiledArtifact> {
        let meta = dir.join(META_FILE);
        if !meta.is_file() {
            return None;
        }
        let stored: CacheKey = match read_json(&meta) {
            Ok(stored) => stored,
            Err(err) => {
                log::warn!("ignoring corrupt cache entry {}: {}", meta.display(), err);
                return None;
            }
        };
        if &stored != key {
            log::warn!("ignoring cache entry {} written for a different key", dir.display());
            return None;
        }
        let unit: TranslationUnit = match read_json(&dir.join(UNIT_FILE)) {
            Ok(unit) => unit,
            Err(err) => {
                log::warn!("ignoring cache entry {}: {}", dir.display(), err);
                return None;
            }
        };
        let unit = Arc::new(unit);
        let launcher = match toolchain.load(unit.clone(), &key.spec, dir) {
            Ok(Some(launcher)) => launcher,
            Ok(None) => return None,
            Err(err) => {
                log::warn!("ignoring cache entry {}: {}", dir.display(), err);
                return None;
            }
        };
        let source = std::fs::read_to_string(dir.join(crate::toolchain::SOURCE_FILE)).ok();
        Some(
            CompiledArtifact::new(key.kernel.clone(), fingerprint.to_string(), key.toolchain.clone(), unit, launcher)
                .with_source(source)
                .with_location(Some(dir.to_path_buf())),
        )
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> KernelResult<T> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Write the unit, then the key; the key file marks the entry complete
fn persist(key: &CacheKey, unit: &TranslationUnit, dir: &Path) -> KernelResult<()> {
    for (name, json) in [
        (UNIT_FILE, serde_json::to_vec_pretty(unit)?),
        (META_FILE, serde_json::to_vec_pretty(key)?),
    ] {
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(&json)?;
        file.persist(dir.join(name)).map_err(|err| err.error)?;
    }
    Ok(())
}
