//! Runtime configuration
//!
//! Defaults, overridden by an optional JSON file, overridden by environment
//! variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

pub const ENV_CACHE_DIR: &str = "KOKKOS_JIT_CACHE_DIR";
pub const ENV_NO_DISK_CACHE: &str = "KOKKOS_JIT_NO_DISK_CACHE";
pub const ENV_TOOLCHAIN: &str = "KOKKOS_JIT_TOOLCHAIN";
pub const ENV_CXX: &str = "CXX";
pub const ENV_KOKKOS_ROOT: &str = "KOKKOS_ROOT";
pub const ENV_CXX_FLAGS: &str = "KOKKOS_JIT_CXXFLAGS";

/// Which toolchain builds artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolchainKind {
    /// Execute translation units with the built-in host back-end
    #[default]
    Host,
    /// Compile rendered source with a C++ compiler against Kokkos
    Cxx,
}

impl std::str::FromStr for ToolchainKind {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" => Ok(ToolchainKind::Host),
            "cxx" | "native" => Ok(ToolchainKind::Cxx),
            other => Err(KernelError::precondition(format!(
                "unknown toolchain '{}' (expected 'host' or 'cxx')",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the on-disk artifact cache; the platform cache directory when unset
    pub cache_dir: Option<PathBuf>,
    pub disk_cache: bool,
    pub toolchain: ToolchainKind,
    pub cxx: String,
    /// Kokkos installation prefix (`include/` and `lib/` below it)
    pub kokkos_root: Option<PathBuf>,
    pub cxx_flags: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: None,
            disk_cache: true,
            toolchain: ToolchainKind::default(),
            cxx: "c++".to_string(),
            kokkos_root: None,
            cxx_flags: vec!["-O3".to_string(), "-std=c++17".to_string()],
        }
    }
}

impl Config {
    /// Defaults with the process environment applied
    pub fn from_env() -> KernelResult<Self> {
        Self::default().with_env(|key| std::env::var(key).ok())
    }

    /// Read a JSON file, then apply the process environment
    pub fn load(path: &Path) -> KernelResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        log::debug!("loaded configuration from {}", path.display());
        config.with_env(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps variable names to values
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> KernelResult<Self> {
        if let Some(dir) = lookup(ENV_CACHE_DIR).filter(|d| !d.is_empty()) {
            self.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(value) = lookup(ENV_NO_DISK_CACHE) {
            self.disk_cache = matches!(value.trim(), "" | "0" | "false");
        }
        if let Some(kind) = lookup(ENV_TOOLCHAIN) {
            self.toolchain = kind.parse()?;
        }
        if let Some(cxx) = lookup(ENV_CXX).filter(|c| !c.is_empty()) {
            self.cxx = cxx;
        }
        if let Some(root) = lookup(ENV_KOKKOS_ROOT).filter(|r| !r.is_empty()) {
            self.kokkos_root = Some(PathBuf::from(root));
        }
        if let Some(flags) = lookup(ENV_CXX_FLAGS) {
            self.cxx_flags = flags.split_whitespace().map(str::to_string).collect();
        }
        Ok(self)
    }

    /// Directory artifacts persist to, if persistence is enabled
    pub fn disk_cache_dir(&self) -> Option<PathBuf> {
        if !self.disk_cache {
            return None;
        }
        self.cache_dir.clone().or_else(|| {
            directories::ProjectDirs::from("org", "kokkos-jit", "kokkos-jit")
                .map(|dirs| dirs.cache_dir().to_path_buf())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.disk_cache);
        assert_eq!(config.toolchain, ToolchainKind::Host);
        assert_eq!(config.cxx, "c++");
    }

    #[test]
    fn test_environment_overrides() {
        let config = Config::default()
            .with_env(env(&[
                (ENV_CACHE_DIR, "/tmp/kernels"),
                (ENV_TOOLCHAIN, "cxx"),
                (ENV_CXX, "clang++"),
                (ENV_CXX_FLAGS, "-O2  -march=native"),
            ]))
            .unwrap();
        assert_eq!(config.cache_dir, Some(PathBuf::from("/tmp/kernels")));
        assert_eq!(config.disk_cache_dir(), Some(PathBuf::from("/tmp/kernels")));
        assert_eq!(config.toolchain, ToolchainKind::Cxx);
        assert_eq!(config.cxx, "clang++");
        assert_eq!(config.cxx_flags, vec!["-O2", "-march=native"]);

        let config = Config::default().with_env(env(&[(ENV_NO_DISK_CACHE, "1")])).unwrap();
        assert_eq!(config.disk_cache_dir(), None);

        assert!(Config::default().with_env(env(&[(ENV_TOOLCHAIN, "gcc")])).is_err());
    }

    #[test]
    fn test_partial_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "toolchain": "cxx", "kokkos_root": "/opt/kokkos" }"#).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let config: Config = serde_json::from_str(&text).unwrap();
        assert_eq!(config.toolchain, ToolchainKind::Cxx);
        assert_eq!(config.kokkos_root, Some(PathBuf::from("/opt/kokkos")));
        assert!(config.disk_cache);
    }
}
