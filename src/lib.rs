//! Kokkos kernel compiler
//!
//! This library translates kernel functions written in a small,
//! Python-shaped dialect into a Kokkos C++ AST, renders and builds them once
//! per specialization, and launches them under range, multi-dimensional
//! range and team policies.
//!
//! # Example
//!
//! ```rust
//! use kokkos_jit::{Args, DataType, ExecutionSpace, Kernel, RangePolicy, Runtime, Config, Scalar, View};
//!
//! let runtime = Runtime::new(Config { disk_cache: false, ..Config::default() });
//! let kernel = Kernel::new("def total(i: int, acc: Acc[float], x: View1D[double]):\n    acc += x[i]\n").unwrap();
//! let x = View::from_slice(DataType::Float64, &[3], &[1.0, 2.0, 3.0]).unwrap();
//! let policy = RangePolicy::new(ExecutionSpace::OpenMp, 0, 3).unwrap();
//! let sum = runtime
//!     .parallel_reduce("total", policy, &kernel, 0.0, &Args::new().view("x", &x))
//!     .unwrap();
//! assert_eq!(sum, Scalar::Float(6.0));
//! ```

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod error;
pub mod dtype;
pub mod view;
pub mod policy;
pub mod cppast;
pub mod algorithms;
pub mod kernel;
pub mod translator;
pub mod codegen;
pub mod config;
pub mod artifact;
pub mod toolchain;
pub mod cache;
pub mod interpreter;
pub mod dispatch;
pub mod runtime;

pub use artifact::{CompiledArtifact, LaunchShape, Launcher};
pub use cache::{ArtifactCache, CacheKey};
pub use codegen::CodeGenerator;
pub use config::{Config, ToolchainKind};
pub use cppast::TranslationUnit;
pub use dispatch::Dispatcher;
pub use dtype::{DataType, Scalar};
pub use error::{ErrorKind, KernelError, KernelResult, Location};
pub use kernel::{Accumulator, Arg, ArgType, Args, CombineOp, Kernel, KernelId, Specialization};
pub use parser::Parser;
pub use policy::{
    default_space, set_default_space, ExecutionSpace, MdRangePolicy, Policy, PolicyKind, RangePolicy,
    ScratchSize, Sizing, TeamPolicy,
};
pub use runtime::{compile_count, parallel_for, parallel_reduce, Runtime};
pub use toolchain::{CxxToolchain, HostToolchain, Toolchain};
pub use translator::{translate, Translator};
pub use view::{shmem_size, shmem_size_of, Layout, MemorySpace, View, ViewType};

/// Translate `kernel` for `spec` and render the native source
pub fn render_source(kernel: &Kernel, spec: &Specialization) -> KernelResult<String> {
    let unit = translate(kernel, spec)?;
    Ok(codegen::render(&unit, spec))
}
