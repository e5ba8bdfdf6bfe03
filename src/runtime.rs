//! Process-scoped runtime
//!
//! A [`Runtime`] owns the configuration, the artifact cache and the
//! toolchain. Most programs use the global one through the free functions
//! below; it is created on first use from the environment, or explicitly
//! with [`init`].

use std::sync::{Arc, OnceLock};

use crate::artifact::CompiledArtifact;
use crate::cache::ArtifactCache;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::dtype::Scalar;
use crate::error::{KernelError, KernelResult};
use crate::kernel::{Accumulator, Args, Kernel, Specialization};
use crate::policy::Policy;
use crate::toolchain::{self, Toolchain};

pub struct Runtime {
    config: Config,
    cache: ArtifactCache,
    toolchain: Box<dyn Toolchain>,
}

impl Runtime {
    /// Runtime with the toolchain named by `config`
    pub fn new(config: Config) -> Self {
        let toolchain = toolchain::from_config(&config);
        Self::with_toolchain(config, toolchain)
    }

    pub fn with_toolchain(config: Config, toolchain: Box<dyn Toolchain>) -> Self {
        let cache = match config.disk_cache_dir() {
            Some(dir) => ArtifactCache::with_disk(dir),
            None => ArtifactCache::new(),
        };
        log::debug!(
            "runtime using toolchain '{}', disk cache {:?}",
            toolchain.name(),
            cache.disk_dir()
        );
        Self {
            config,
            cache,
            toolchain,
        }
    }

    pub fn from_env() -> KernelResult<Self> {
        Ok(Self::new(Config::from_env()?))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn toolchain(&self) -> &dyn Toolchain {
        self.toolchain.as_ref()
    }

    pub fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher::new(&self.cache, self.toolchain.as_ref())
    }

    /// Build (or fetch) the artifact for one specialization
    pub fn compile(&self, kernel: &Kernel, spec: &Specialization) -> KernelResult<Arc<CompiledArtifact>> {
        self.cache.get_or_build(kernel, spec, self.toolchain.as_ref())
    }

    pub fn parallel_for(&self, policy: impl Into<Policy>, kernel: &Kernel, args: &Args) -> KernelResult<()> {
        self.dispatcher().parallel_for(policy, kernel, args)
    }

    pub fn parallel_reduce(
        &self,
        label: &str,
        policy: impl Into<Policy>,
        kernel: &Kernel,
        init: impl Into<Accumulator>,
        args: &Args,
    ) -> KernelResult<Scalar> {
        self.dispatcher().parallel_reduce(label, policy, kernel, init, args)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("toolchain", &self.toolchain.name())
            .field("artifacts", &self.cache.len())
            .finish()
    }
}

static GLOBAL: OnceLock<Runtime> = OnceLock::new();

/// Install the global runtime; fails once it exists
pub fn init(config: Config) -> KernelResult<&'static Runtime> {
    let mut installed = false;
    let runtime = GLOBAL.get_or_init(|| {
        installed = true;
        Runtime::new(config)
    });
    if installed {
        Ok(runtime)
    } else {
        Err(KernelError::precondition("the global runtime is already initialized"))
    }
}

/// The global runtime, configured from the environment on first use
pub fn global() -> &'static Runtime {
    GLOBAL.get_or_init(|| {
        Runtime::from_env().unwrap_or_else(|err| {
            log::warn!("ignoring invalid environment configuration: {}", err);
            Runtime::new(Config::default())
        })
    })
}

pub fn parallel_for(policy: impl Into<Policy>, kernel: &Kernel, args: &Args) -> KernelResult<()> {
    global().parallel_for(policy, kernel, args)
}

pub fn parallel_reduce(
    label: &str,
    policy: impl Into<Policy>,
    kernel: &Kernel,
    init: impl Into<Accumulator>,
    args: &Args,
) -> KernelResult<Scalar> {
    global().parallel_reduce(label, policy, kernel, init, args)
}

/// Toolchain builds performed by the global runtime
pub fn compile_count() -> usize {
    global().cache().builds()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DataType;
    use crate::policy::{ExecutionSpace, RangePolicy};
    use crate::view::View;

    fn memory_only() -> Config {
        Config {
            disk_cache: false,
            ..Config::default()
        }
    }

    #[test]
    fn test_runtime_dispatch_and_counts() {
        let runtime = Runtime::new(memory_only());
        assert_eq!(runtime.toolchain().name(), "host");
        assert!(runtime.cache().disk_dir().is_none());

        let kernel = Kernel::new("def sq(i: int, x):\n    x[i] = i * i\n").unwrap();
        let x = View::new(DataType::Int64, &[5]).unwrap();
        let args = Args::new().view("x", &x);
        let policy = RangePolicy::new(ExecutionSpace::OpenMp, 0, 5).unwrap();
        runtime.parallel_for(policy.clone(), &kernel, &args).unwrap();
        runtime.parallel_for(policy, &kernel, &args).unwrap();
        assert_eq!(x.to_f64_vec(), vec![0.0, 1.0, 4.0, 9.0, 16.0]);
        assert_eq!(runtime.cache().builds(), 1);
    }

    #[test]
    fn test_compile_returns_cached_artifact() {
        let runtime = Runtime::new(memory_only());
        let kernel = Kernel::new("def k(i: int, x):\n    x[i] = 0.0\n").unwrap();
        let x = View::new(DataType::Float32, &[2]).unwrap();
        let spec = Specialization::new(
            &Args::new().view("x", &x),
            None,
            crate::policy::PolicyKind::Range,
            ExecutionSpace::Serial,
        );
        let a = runtime.compile(&kernel, &spec).unwrap();
        let b = runtime.compile(&kernel, &spec).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(format!("{:?}", runtime).contains("artifacts: 1"));
    }
}
