//! Toolchains turn a translation unit into something that can be launched
//!
//! [`HostToolchain`] hands the unit to the built-in interpreter.
//! [`CxxToolchain`] renders C++ source, compiles it into a shared library
//! against Kokkos, and calls the exported entry point.

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use libloading::Library;

use crate::artifact::{LaunchShape, Launcher};
use crate::codegen::{self, ENTRY_SYMBOL};
use crate::config::{Config, ToolchainKind};
use crate::cppast::{ParamRole, TranslationUnit};
use crate::dtype::{DataType, Scalar};
use crate::error::{KernelError, KernelResult};
use crate::interpreter;
use crate::kernel::{Arg, Args, CombineOp, Specialization};
use crate::policy::ExecutionSpace;
use crate::view::View;

pub const SOURCE_FILE: &str = "kernel.cpp";
pub const LIBRARY_FILE: &str = "kernel.so";

/// Output of a successful build
pub struct Built {
    pub launcher: Box<dyn Launcher>,
    /// Rendered source, when the toolchain renders any
    pub source: Option<String>,
}

pub trait Toolchain: Send + Sync {
    /// Identity folded into cache keys; differs whenever outputs may differ
    fn name(&self) -> String;

    /// Build `unit`, writing any outputs into `dir` when given
    fn build(&self, unit: Arc<TranslationUnit>, spec: &Specialization, dir: Option<&Path>) -> KernelResult<Built>;

    /// Reload an artifact built earlier into `dir`; `None` if it is unusable
    fn load(
        &self,
        unit: Arc<TranslationUnit>,
        spec: &Specialization,
        dir: &Path,
    ) -> KernelResult<Option<Box<dyn Launcher>>>;
}

/// Toolchain selected by `config`
pub fn from_config(config: &Config) -> Box<dyn Toolchain> {
    match config.toolchain {
        ToolchainKind::Host => Box::new(HostToolchain),
        ToolchainKind::Cxx => Box::new(CxxToolchain::new(config)),
    }
}

fn reduction_op(spec: &Specialization) -> CombineOp {
    spec.accumulator.map(|(_, op)| op).unwrap_or_default()
}

// -------------------------------------------------------------------------
// Host

#[derive(Debug, Clone, Copy, Default)]
pub struct HostToolchain;

impl Toolchain for HostToolchain {
    fn name(&self) -> String {
        "host".to_string()
    }

    fn build(&self, unit: Arc<TranslationUnit>, spec: &Specialization, _dir: Option<&Path>) -> KernelResult<Built> {
        log::debug!("prepared '{}' for host execution", unit.kernel.name);
        Ok(Built {
            launcher: Box::new(HostLauncher {
                unit,
                op: reduction_op(spec),
            }),
            source: None,
        })
    }

    fn load(
        &self,
        unit: Arc<TranslationUnit>,
        spec: &Specialization,
        _dir: &Path,
    ) -> KernelResult<Option<Box<dyn Launcher>>> {
        Ok(Some(Box::new(HostLauncher {
            unit,
            op: reduction_op(spec),
        })))
    }
}

struct HostLauncher {
    unit: Arc<TranslationUnit>,
    op: CombineOp,
}

impl Launcher for HostLauncher {
    fn launch(&self, shape: &LaunchShape, args: &Args) -> KernelResult<Option<Scalar>> {
        interpreter::execute(&self.unit, shape, args, self.op)
    }
}

// -------------------------------------------------------------------------
// Native

/// Compiles rendered source with a C++ compiler
#[derive(Debug, Clone)]
pub struct CxxToolchain {
    cxx: String,
    flags: Vec<String>,
    kokkos_root: Option<PathBuf>,
}

impl CxxToolchain {
    pub fn new(config: &Config) -> Self {
        Self {
            cxx: config.cxx.clone(),
            flags: config.cxx_flags.clone(),
            kokkos_root: config.kokkos_root.clone(),
        }
    }

    /// Full compiler invocation for `source` into `library`
    pub fn command(&self, space: ExecutionSpace, source: &Path, library: &Path) -> Command {
        let mut command = Command::new(&self.cxx);
        command.args(&self.flags).args(["-shared", "-fPIC"]);
        if space == ExecutionSpace::OpenMp {
            command.arg("-fopenmp");
        }
        if let Some(root) = &self.kokkos_root {
            let lib = root.join("lib");
            command
                .arg(format!("-I{}", root.join("include").display()))
                .arg(format!("-L{}", lib.display()))
                .arg(format!("-Wl,-rpath,{}", lib.display()));
        }
        command.arg(source).arg("-o").arg(library).arg("-lkokkoscore");
        command
    }

    fn compile(&self, unit: &TranslationUnit, spec: &Specialization, source: &str, dir: &Path) -> KernelResult<PathBuf> {
        let source_path = dir.join(SOURCE_FILE);
        let library = dir.join(LIBRARY_FILE);
        std::fs::write(&source_path, source)?;

        let mut command = self.command(spec.space, &source_path, &library);
        log::info!("compiling '{}' with {}", unit.kernel.name, self.cxx);
        log::debug!("{:?}", command);
        let output = command.output().map_err(|err| {
            KernelError::compilation(
                unit.kernel.name.clone(),
                source.to_string(),
                format!("failed to run '{}': {}", self.cxx, err),
            )
        })?;
        if !output.status.success() {
            let diagnostic = String::from_utf8_lossy(&output.stderr).into_owned();
            log::warn!("compilation of '{}' failed", unit.kernel.name);
            return Err(KernelError::compilation(
                unit.kernel.name.clone(),
                source.to_string(),
                diagnostic,
            ));
        }
        Ok(library)
    }
}

impl Toolchain for CxxToolchain {
    fn name(&self) -> String {
        let mut name = format!("cxx:{}", self.cxx);
        for flag in &self.flags {
            name.push(' ');
            name.push_str(flag);
        }
        if let Some(root) = &self.kokkos_root {
            name.push_str(&format!(" @{}", root.display()));
        }
        name
    }

    fn build(&self, unit: Arc<TranslationUnit>, spec: &Specialization, dir: Option<&Path>) -> KernelResult<Built> {
        let source = codegen::render(&unit, spec);
        // Without a persistent directory the temporary one lives as long as the library
        let (workdir, temporary) = match dir {
            Some(dir) => (dir.to_path_buf(), None),
            None => {
                let temp = tempfile::tempdir()?;
                (temp.path().to_path_buf(), Some(temp))
            }
        };
        let library = self.compile(&unit, spec, &source, &workdir)?;
        let mut launcher = NativeLauncher::open(&library, unit, spec)?;
        launcher._workdir = temporary;
        Ok(Built {
            launcher: Box::new(launcher),
            source: Some(source),
        })
    }

    fn load(
        &self,
        unit: Arc<TranslationUnit>,
        spec: &Specialization,
        dir: &Path,
    ) -> KernelResult<Option<Box<dyn Launcher>>> {
        let library = dir.join(LIBRARY_FILE);
        if !library.is_file() {
            return Ok(None);
        }
        match NativeLauncher::open(&library, unit, spec) {
            Ok(launcher) => Ok(Some(Box::new(launcher))),
            Err(err) => {
                log::warn!("ignoring unusable library {}: {}", library.display(), err);
                Ok(None)
            }
        }
    }
}

type EntryFn = unsafe extern "C" fn(*mut *mut c_void, *const i64, *const i64, *mut c_void);

/// Loaded shared library exporting the entry point
struct NativeLauncher {
    entry: EntryFn,
    unit: Arc<TranslationUnit>,
    accumulator: Option<DataType>,
    /// Kokkos launches from one library are not reentrant
    lock: Mutex<()>,
    // Field order matters: the library must outlive `entry` and unload before its directory goes
    _library: Library,
    _workdir: Option<tempfile::TempDir>,
}

impl NativeLauncher {
    fn open(path: &Path, unit: Arc<TranslationUnit>, spec: &Specialization) -> KernelResult<Self> {
        let symbol_error = |err: libloading::Error| {
            KernelError::compilation(
                unit.kernel.name.clone(),
                String::new(),
                format!("cannot load {}: {}", path.display(), err),
            )
        };
        // SAFETY: the library was produced by this toolchain from generated source
        let library = unsafe { Library::new(path) }.map_err(symbol_error)?;
        // SAFETY: the generated entry point has exactly the `EntryFn` signature
        let entry = unsafe {
            let symbol = library
                .get::<EntryFn>(ENTRY_SYMBOL.as_bytes())
                .map_err(symbol_error)?;
            *symbol
        };
        Ok(Self {
            entry,
            accumulator: spec.accumulator.map(|(dtype, _)| dtype),
            unit,
            lock: Mutex::new(()),
            _library: library,
            _workdir: None,
        })
    }
}

/// A byte buffer with the alignment of any scalar element type
fn aligned(bytes: &[u8]) -> Vec<u64> {
    let mut buffer = vec![0u64; bytes.len().div_ceil(8).max(1)];
    // SAFETY: the buffer holds at least `bytes.len()` bytes
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), buffer.as_mut_ptr() as *mut u8, bytes.len());
    }
    buffer
}

fn buffer_bytes(buffer: &[u64], len: usize) -> &[u8] {
    // SAFETY: `len` never exceeds the byte length of the buffer
    unsafe { std::slice::from_raw_parts(buffer.as_ptr() as *const u8, len.min(buffer.len() * 8)) }
}

/// Argument buffers for one launch
///
/// Views bound to several parameters share a single buffer so writes through
/// any of them survive the copy back.
struct Marshalled<'a> {
    buffers: Vec<Vec<u64>>,
    /// Buffer of each argument, in parameter order
    slots: Vec<usize>,
    /// Buffer, view and byte length of every distinct view
    views: Vec<(usize, &'a View, usize)>,
    shapes: Vec<i64>,
}

fn marshal<'a>(unit: &TranslationUnit, args: &'a Args) -> KernelResult<Marshalled<'a>> {
    let mut marshalled = Marshalled {
        buffers: Vec::new(),
        slots: Vec::new(),
        views: Vec::new(),
        shapes: Vec::new(),
    };
    for param in unit.kernel.arguments() {
        match (&param.role, args.get(&param.name)) {
            (ParamRole::View(_), Some(Arg::View(view))) => {
                marshalled.shapes.extend(view.extents().iter().map(|&e| e as i64));
                let shared = marshalled
                    .views
                    .iter()
                    .find(|(_, other, _)| {
                        other.shares_storage(view)
                            && other.extents() == view.extents()
                            && other.view_type() == view.view_type()
                    })
                    .map(|(slot, _, _)| *slot);
                let slot = match shared {
                    Some(slot) => slot,
                    None => {
                        let bytes = view.to_ne_bytes();
                        let slot = marshalled.buffers.len();
                        marshalled.views.push((slot, view, bytes.len()));
                        marshalled.buffers.push(aligned(&bytes));
                        slot
                    }
                };
                marshalled.slots.push(slot);
            }
            (ParamRole::Scalar(dtype), Some(Arg::Scalar(value, _))) => {
                marshalled.slots.push(marshalled.buffers.len());
                marshalled.buffers.push(aligned(&value.to_ne_bytes(*dtype)));
            }
            _ => {
                return Err(KernelError::precondition(format!(
                    "argument '{}' is missing or has the wrong kind",
                    param.name
                )))
            }
        }
    }
    Ok(marshalled)
}

impl Launcher for NativeLauncher {
    fn launch(&self, shape: &LaunchShape, args: &Args) -> KernelResult<Option<Scalar>> {
        let Marshalled {
            mut buffers,
            slots,
            views,
            shapes,
        } = marshal(&self.unit, args)?;

        let base: Vec<*mut c_void> = buffers
            .iter_mut()
            .map(|buffer| buffer.as_mut_ptr() as *mut c_void)
            .collect();
        let mut pointers: Vec<*mut c_void> = slots.iter().map(|&slot| base[slot]).collect();
        let launch = shape.params();
        let mut result = [0u64; 1];
        {
            let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            // SAFETY: every pointer refers to a live buffer laid out as the entry point expects
            unsafe {
                (self.entry)(
                    pointers.as_mut_ptr(),
                    launch.as_ptr(),
                    shapes.as_ptr(),
                    result.as_mut_ptr() as *mut c_void,
                );
            }
        }

        for (slot, view, len) in views {
            view.copy_from_ne_bytes(buffer_bytes(&buffers[slot], len));
        }
        Ok(self
            .accumulator
            .map(|dtype| Scalar::from_ne_bytes(&buffer_bytes(&result, 8)[..dtype.size()], dtype)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toolchain_names_distinguish_flags() {
        let config = Config::default();
        let a = CxxToolchain::new(&config);
        let b = CxxToolchain::new(&Config {
            cxx_flags: vec!["-O0".to_string()],
            ..config.clone()
        });
        assert_ne!(a.name(), b.name());
        assert_eq!(HostToolchain.name(), "host");
        assert_eq!(from_config(&config).name(), "host");
    }

    #[test]
    fn test_compile_command() {
        let toolchain = CxxToolchain::new(&Config {
            kokkos_root: Some(PathBuf::from("/opt/kokkos")),
            ..Config::default()
        });
        let command = toolchain.command(ExecutionSpace::OpenMp, Path::new("k.cpp"), Path::new("k.so"));
        let args: Vec<String> = command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(command.get_program(), "c++");
        assert!(args.contains(&"-fopenmp".to_string()));
        assert!(args.contains(&"-I/opt/kokkos/include".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("-lkokkoscore"));
    }

    #[test]
    fn test_missing_compiler_reports_source() {
        use crate::kernel::{Kernel, Specialization};
        use crate::policy::PolicyKind;
        use crate::view::View;

        let kernel = Kernel::new("def k(i: int, x):\n    x[i] = 1.0\n").unwrap();
        let x = View::new(DataType::Float64, &[4]).unwrap();
        let args = Args::new().view("x", &x);
        let spec = Specialization::new(&args, None, PolicyKind::Range, ExecutionSpace::Serial);
        let unit = Arc::new(crate::translator::translate(&kernel, &spec).unwrap());

        let toolchain = CxxToolchain::new(&Config {
            cxx: "/nonexistent/c++".to_string(),
            ..Config::default()
        });
        let err = match toolchain.build(unit, &spec, None) {
            Err(err) => err,
            Ok(_) => panic!("build with a missing compiler succeeded"),
        };
        match err {
            KernelError::Compilation { kernel, source_code, .. } => {
                assert_eq!(kernel, "k");
                assert!(source_code.contains(ENTRY_SYMBOL));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_aliased_views_share_a_buffer() {
        use crate::kernel::Kernel;
        use crate::policy::PolicyKind;

        let kernel = Kernel::new("def k(i: int, src, dst, n: int):\n    dst[i] = src[i] + n\n").unwrap();
        let x = View::from_slice(DataType::Int32, &[3], &[1, 2, 3]).unwrap();
        let y = View::new(DataType::Int32, &[3]).unwrap();

        let aliased = Args::new().view("src", &x).view("dst", &x.clone()).scalar("n", 1);
        let spec = Specialization::new(&aliased, None, PolicyKind::Range, ExecutionSpace::Serial);
        let unit = crate::translator::translate(&kernel, &spec).unwrap();

        let marshalled = marshal(&unit, &aliased).unwrap();
        assert_eq!(marshalled.buffers.len(), 2);
        assert_eq!(marshalled.slots, vec![0, 0, 1]);
        assert_eq!(marshalled.views.len(), 1);
        assert_eq!(marshalled.shapes, vec![3, 3]);

        let distinct = Args::new().view("src", &x).view("dst", &y).scalar("n", 1);
        let marshalled = marshal(&unit, &distinct).unwrap();
        assert_eq!(marshalled.slots, vec![0, 1, 2]);
        assert_eq!(marshalled.views.len(), 2);
    }
}
