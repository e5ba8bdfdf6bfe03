//! Kernel definitions, bound arguments and specialization keys

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ast::{FunctionDef, Param};
use crate::dtype::{DataType, Scalar};
use crate::error::{KernelError, KernelResult};
use crate::parser::Parser;
use crate::policy::{ExecutionSpace, PolicyKind};
use crate::view::{View, ViewType};

/// A registered kernel: one `def` plus the outer values it captured
///
/// Cloning is cheap; the parsed definition is shared.
#[derive(Debug, Clone)]
pub struct Kernel {
    source: Arc<str>,
    def: Arc<FunctionDef>,
    captures: BTreeMap<String, Scalar>,
    fingerprint: String,
}

impl Kernel {
    /// Parse and register a kernel from the source of a single function
    pub fn new(source: &str) -> KernelResult<Self> {
        let def = Parser::new(source)?.parse_single_function()?;
        let mut kernel = Self {
            source: Arc::from(source),
            def: Arc::new(def),
            captures: BTreeMap::new(),
            fingerprint: String::new(),
        };
        kernel.fingerprint = kernel.compute_fingerprint();
        Ok(kernel)
    }

    /// Capture an outer value; kernel bodies read it as a constant
    pub fn capture(mut self, name: &str, value: impl Into<Scalar>) -> Self {
        self.captures.insert(name.to_string(), value.into());
        self.fingerprint = self.compute_fingerprint();
        self
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn def(&self) -> &FunctionDef {
        &self.def
    }

    pub fn captures(&self) -> &BTreeMap<String, Scalar> {
        &self.captures
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn identity(&self) -> KernelId {
        KernelId {
            name: self.def.name.clone(),
            fingerprint: self.fingerprint.clone(),
        }
    }

    fn compute_fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.source.as_bytes());
        for (name, value) in &self.captures {
            hasher.update(b"\0");
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.to_string().as_bytes());
            hasher.update(value.dtype().to_string().as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    /// The trailing accumulator parameter, if the kernel declares one
    ///
    /// A parameter annotated `Acc[T]` always counts. Without annotations the
    /// last parameter counts when it is not bound by name and the dispatch
    /// is a reduction.
    pub fn accumulator_param(&self, spec: &Specialization) -> Option<&Param> {
        let params = &self.def.params;
        if let Some(param) = params.iter().find(|p| is_accumulator_annotation(p)) {
            return Some(param);
        }
        let last = params.last()?;
        let unbound = last.annotation.is_none() && !spec.args.contains_key(&last.name);
        if spec.accumulator.is_some() && params.len() > spec.policy.index_params() && unbound {
            Some(last)
        } else {
            None
        }
    }

    /// Policy shape implied by the leading parameter's annotation
    pub fn declared_policy(&self) -> Option<PolicyKind> {
        let first = self.def.params.first()?;
        match first.annotation.as_ref()?.base_name() {
            "TeamMember" => Some(PolicyKind::Team),
            "int" | "int32" | "int64" => {
                let indices = self
                    .def
                    .params
                    .iter()
                    .take_while(|p| {
                        p.annotation
                            .as_ref()
                            .map(|a| matches!(a.base_name(), "int" | "int32" | "int64"))
                            .unwrap_or(false)
                    })
                    .count();
                if indices == 1 {
                    Some(PolicyKind::Range)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

pub(crate) fn is_accumulator_annotation(param: &Param) -> bool {
    param
        .annotation
        .as_ref()
        .map(|a| a.base_name() == "Acc")
        .unwrap_or(false)
}

/// Name and source fingerprint of a kernel
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KernelId {
    pub name: String,
    pub fingerprint: String,
}

impl std::fmt::Display for KernelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, &self.fingerprint[..self.fingerprint.len().min(12)])
    }
}

/// How reduction partials are joined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CombineOp {
    #[default]
    Sum,
    Prod,
    Min,
    Max,
}

impl CombineOp {
    /// Neutral element in `dtype`
    pub fn identity(self, dtype: DataType) -> Scalar {
        let value = match self {
            CombineOp::Sum => Scalar::Int(0),
            CombineOp::Prod => Scalar::Int(1),
            CombineOp::Min if dtype.is_float() => Scalar::Float(f64::INFINITY),
            CombineOp::Max if dtype.is_float() => Scalar::Float(f64::NEG_INFINITY),
            CombineOp::Min => Scalar::Int(integer_limit(dtype, true)),
            CombineOp::Max => Scalar::Int(integer_limit(dtype, false)),
        };
        value.cast(dtype)
    }

    pub fn combine(self, dtype: DataType, a: Scalar, b: Scalar) -> Scalar {
        let value = if dtype.is_float() {
            let (x, y) = (a.as_f64(), b.as_f64());
            Scalar::Float(match self {
                CombineOp::Sum => x + y,
                CombineOp::Prod => x * y,
                CombineOp::Min => x.min(y),
                CombineOp::Max => x.max(y),
            })
        } else {
            let (x, y) = (a.as_i64(), b.as_i64());
            Scalar::Int(match self {
                CombineOp::Sum => x.wrapping_add(y),
                CombineOp::Prod => x.wrapping_mul(y),
                CombineOp::Min => x.min(y),
                CombineOp::Max => x.max(y),
            })
        };
        value.cast(dtype)
    }

    /// Native reducer template
    pub fn cpp_name(self) -> &'static str {
        match self {
            CombineOp::Sum => "Kokkos::Sum",
            CombineOp::Prod => "Kokkos::Prod",
            CombineOp::Min => "Kokkos::Min",
            CombineOp::Max => "Kokkos::Max",
        }
    }
}

fn integer_limit(dtype: DataType, max: bool) -> i64 {
    match (dtype, max) {
        (DataType::Int8, true) => i8::MAX as i64,
        (DataType::Int8, false) => i8::MIN as i64,
        (DataType::Int16, true) => i16::MAX as i64,
        (DataType::Int16, false) => i16::MIN as i64,
        (DataType::Int32, true) => i32::MAX as i64,
        (DataType::Int32, false) => i32::MIN as i64,
        (DataType::UInt8, true) => u8::MAX as i64,
        (DataType::UInt16, true) => u16::MAX as i64,
        (DataType::UInt32, true) => u32::MAX as i64,
        (DataType::UInt64, true) => -1,
        (DataType::Bool, true) => 1,
        (_, false) if !dtype.is_signed() => 0,
        (_, true) => i64::MAX,
        (_, false) => i64::MIN,
    }
}

/// Reduction target of `parallel_reduce`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Accumulator {
    pub dtype: DataType,
    pub op: CombineOp,
    pub init: Scalar,
}

impl Accumulator {
    /// Sum into a value of `dtype`, starting from `init`
    pub fn sum(dtype: DataType, init: impl Into<Scalar>) -> Self {
        Self {
            dtype,
            op: CombineOp::Sum,
            init: init.into().cast(dtype),
        }
    }

    pub fn with_op(mut self, op: CombineOp) -> Self {
        self.op = op;
        self
    }
}

impl From<f64> for Accumulator {
    fn from(init: f64) -> Self {
        Accumulator::sum(DataType::Float64, init)
    }
}

impl From<i64> for Accumulator {
    fn from(init: i64) -> Self {
        Accumulator::sum(DataType::Int64, init)
    }
}

/// A value bound to a kernel parameter by name
#[derive(Debug, Clone)]
pub enum Arg {
    View(View),
    Scalar(Scalar, DataType),
}

impl Arg {
    pub fn arg_type(&self) -> ArgType {
        match self {
            Arg::View(view) => ArgType::View(view.view_type()),
            Arg::Scalar(_, dtype) => ArgType::Scalar(*dtype),
        }
    }
}

/// Named arguments of one dispatch
#[derive(Debug, Clone, Default)]
pub struct Args {
    values: BTreeMap<String, Arg>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(mut self, name: &str, view: &View) -> Self {
        self.values.insert(name.to_string(), Arg::View(view.clone()));
        self
    }

    /// Bind a scalar with its natural type (`int32`, `float64` or `bool`)
    pub fn scalar(self, name: &str, value: impl Into<Scalar>) -> Self {
        let value = value.into();
        let dtype = value.dtype();
        self.typed_scalar(name, value, dtype)
    }

    pub fn typed_scalar(mut self, name: &str, value: impl Into<Scalar>, dtype: DataType) -> Self {
        let value = value.into().cast(dtype);
        self.values.insert(name.to_string(), Arg::Scalar(value, dtype));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arg> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arg)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Specialization of one argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArgType {
    View(ViewType),
    Scalar(DataType),
}

/// The concrete types one compilation is specialized for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Specialization {
    pub args: BTreeMap<String, ArgType>,
    pub accumulator: Option<(DataType, CombineOp)>,
    pub policy: PolicyKind,
    pub space: ExecutionSpace,
}

impl Specialization {
    pub fn new(
        args: &Args,
        accumulator: Option<&Accumulator>,
        policy: PolicyKind,
        space: ExecutionSpace,
    ) -> Self {
        Self {
            args: args
                .iter()
                .map(|(name, arg)| (name.clone(), arg.arg_type()))
                .collect(),
            accumulator: accumulator.map(|a| (a.dtype, a.op)),
            policy,
            space,
        }
    }

    pub fn arg(&self, name: &str) -> KernelResult<ArgType> {
        self.args
            .get(name)
            .copied()
            .ok_or_else(|| KernelError::precondition(format!("argument '{}' is not bound", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "def axpy(i: int, a: float, x: View1D[double], y: View1D[double]):\n    y[i] = a * x[i] + y[i]\n";

    #[test]
    fn test_identity_tracks_source_and_captures() {
        let kernel = Kernel::new(SOURCE).unwrap();
        assert_eq!(kernel.name(), "axpy");
        assert_eq!(kernel.fingerprint().len(), 64);

        let same = Kernel::new(SOURCE).unwrap();
        assert_eq!(kernel.identity(), same.identity());

        let captured = same.capture("scale", 2.0);
        assert_ne!(kernel.identity(), captured.identity());
        assert_eq!(kernel.declared_policy(), Some(PolicyKind::Range));
    }

    #[test]
    fn test_accumulator_detection() {
        let annotated = Kernel::new("def k(i: int, acc: pk.Acc[pk.double], x):\n    acc += x[i]\n").unwrap();
        let spec = |args: &Args, acc: Option<&Accumulator>| {
            Specialization::new(args, acc, PolicyKind::Range, ExecutionSpace::OpenMp)
        };
        let none = Args::new();
        assert_eq!(annotated.accumulator_param(&spec(&none, None)).unwrap().name, "acc");

        let bare = Kernel::new("def k(i, x, total):\n    total += x[i]\n").unwrap();
        let x = View::new(DataType::Float64, &[4]).unwrap();
        let args = Args::new().view("x", &x);
        let acc = Accumulator::from(0.0);
        assert_eq!(bare.accumulator_param(&spec(&args, Some(&acc))).unwrap().name, "total");
        assert!(bare.accumulator_param(&spec(&args, None)).is_none());
    }

    #[test]
    fn test_combine_ops() {
        let f = DataType::Float64;
        assert_eq!(CombineOp::Sum.identity(f), Scalar::Float(0.0));
        assert_eq!(CombineOp::Max.identity(DataType::Int32), Scalar::Int(i32::MIN as i64));
        assert_eq!(
            CombineOp::Min.combine(f, Scalar::Float(2.0), Scalar::Float(-1.0)),
            Scalar::Float(-1.0)
        );
        assert_eq!(
            CombineOp::Prod.combine(DataType::Int32, Scalar::Int(3), Scalar::Int(4)),
            Scalar::Int(12)
        );
    }

    #[test]
    fn test_specialization_from_args() {
        let x = View::new(DataType::Float32, &[8, 2]).unwrap();
        let args = Args::new().view("x", &x).scalar("n", 8);
        let spec = Specialization::new(&args, None, PolicyKind::Range, ExecutionSpace::OpenMp);
        assert_eq!(spec.arg("n").unwrap(), ArgType::Scalar(DataType::Int32));
        match spec.arg("x").unwrap() {
            ArgType::View(ty) => assert_eq!((ty.dtype, ty.rank), (DataType::Float32, 2)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(spec.arg("missing").is_err());
    }
}
