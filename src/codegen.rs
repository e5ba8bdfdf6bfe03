//! Source generator for the native back-end
//!
//! Renders a [`TranslationUnit`] as one self-contained C++ file: includes,
//! algorithm helpers, a functor holding the kernel's views and scalars, and
//! an `extern "C"` entry point the toolchain loads. Rendering is a pure
//! function of the unit and specialization, so identical inputs always
//! produce byte-identical source.

use std::fmt::Write;

use crate::cppast::{
    BinaryOp, Block, Builtin, CType, Callee, Expr, FunctionDecl, Init, KernelFunction, Lambda,
    ParamDecl, ParamRole, Stmt, TranslationUnit,
};
use crate::dtype::{DataType, Scalar};
use crate::kernel::{CombineOp, Specialization};
use crate::policy::{ExecutionSpace, PolicyKind};
use crate::view::{MemorySpace, ViewType};

/// Symbol every generated library exports
pub const ENTRY_SYMBOL: &str = "kokkos_jit_launch";

/// Number of launch parameters passed for a team policy
pub const TEAM_LAUNCH_LEN: usize = 7;

const INDENT: &str = "  ";

/// Render `unit` for the execution space and reducer of `spec`
pub fn render(unit: &TranslationUnit, spec: &Specialization) -> String {
    CodeGenerator::new(spec).generate(unit)
}

/// Code generator for one specialization
pub struct CodeGenerator {
    space: ExecutionSpace,
    reducer: Option<(DataType, CombineOp)>,
    out: String,
}

impl CodeGenerator {
    pub fn new(spec: &Specialization) -> Self {
        Self {
            space: spec.space,
            reducer: spec.accumulator,
            out: String::new(),
        }
    }

    /// Generate the complete source file
    pub fn generate(mut self, unit: &TranslationUnit) -> String {
        self.preamble(&unit.kernel);
        for helper in &unit.helpers {
            render_function(&mut self.out, helper);
            self.out.push('\n');
        }
        self.functor(&unit.kernel);
        self.out.push_str("}  // namespace kokkos_jit\n\n");
        self.entry(&unit.kernel);

        log::debug!(
            "rendered kernel '{}' ({} bytes):\n{}",
            unit.kernel.name,
            self.out.len(),
            self.out
        );
        self.out
    }

    fn preamble(&mut self, kernel: &KernelFunction) {
        let out = &mut self.out;
        let _ = writeln!(out, "// kernel '{}', {:?} policy on {}", kernel.name, kernel.policy, self.space);
        out.push_str("#include <Kokkos_Core.hpp>\n");
        out.push_str("#include <cstdint>\n\n");
        out.push_str("namespace kokkos_jit {\n\n");
        let _ = writeln!(out, "using ExecSpace = {};", self.space.cpp_name());
        out.push_str("using TeamMember = Kokkos::TeamPolicy<ExecSpace>::member_type;\n\n");
    }

    fn functor(&mut self, kernel: &KernelFunction) {
        let out = &mut self.out;
        out.push_str("struct Functor {\n");
        for param in &kernel.params {
            match &param.role {
                ParamRole::View(view) => {
                    let _ = writeln!(out, "{}{} {};", INDENT, view_type(view, false), param.name);
                }
                ParamRole::Scalar(dtype) => {
                    let _ = writeln!(out, "{}{} {};", INDENT, dtype.cpp_name(), param.name);
                }
                _ => {}
            }
        }

        let mut params = Vec::new();
        for param in &kernel.params {
            match param.role {
                ParamRole::Index => params.push(format!("const int32_t {}", param.name)),
                ParamRole::TeamMember => params.push(format!("const TeamMember& {}", param.name)),
                _ => {}
            }
        }
        if let Some((name, dtype)) = kernel.accumulator() {
            params.push(format!("{}& {}", dtype.cpp_name(), name));
        }
        out.push('\n');
        let _ = writeln!(
            out,
            "{}KOKKOS_FUNCTION void operator()({}) const {{",
            INDENT,
            params.join(", ")
        );
        render_block(out, &kernel.body, 2);
        let _ = writeln!(out, "{}}}", INDENT);
        out.push_str("};\n\n");
    }

    fn entry(&mut self, kernel: &KernelFunction) {
        let out = &mut self.out;
        let _ = writeln!(
            out,
            "extern \"C\" void {}(void** args, const int64_t* launch, const int64_t* shapes, void* result) {{",
            ENTRY_SYMBOL
        );
        line(out, 1, "if (!Kokkos::is_initialized()) {");
        line(out, 2, "Kokkos::initialize();");
        line(out, 1, "}");
        line(out, 1, "using kokkos_jit::ExecSpace;");
        line(out, 1, "kokkos_jit::Functor __functor;");

        let mut copy_back = Vec::new();
        let mut shape = 0;
        for (slot, param) in kernel.arguments().enumerate() {
            match &param.role {
                ParamRole::View(view) => {
                    let extents: Vec<String> =
                        (shape..shape + view.rank).map(|i| format!("shapes[{}]", i)).collect();
                    shape += view.rank;
                    let host = format!("__host_{}", param.name);
                    line(
                        out,
                        1,
                        format!(
                            "{} {}(static_cast<{}*>(args[{}]), {});",
                            view_type(view, true),
                            host,
                            view.dtype.cpp_name(),
                            slot,
                            extents.join(", ")
                        ),
                    );
                    if view.space == MemorySpace::HostSpace {
                        line(out, 1, format!("__functor.{} = {};", param.name, host));
                    } else {
                        line(
                            out,
                            1,
                            format!(
                                "__functor.{0} = decltype(__functor.{0})(\"{0}\", {1});",
                                param.name,
                                extents.join(", ")
                            ),
                        );
                        line(out, 1, format!("Kokkos::deep_copy(__functor.{}, {});", param.name, host));
                        copy_back.push((param.name.clone(), host));
                    }
                }
                ParamRole::Scalar(dtype) => line(
                    out,
                    1,
                    format!(
                        "__functor.{} = *static_cast<const {}*>(args[{}]);",
                        param.name,
                        dtype.cpp_name(),
                        slot
                    ),
                ),
                _ => {}
            }
        }

        match kernel.policy {
            PolicyKind::Range => {
                line(out, 1, "Kokkos::RangePolicy<ExecSpace> __policy(launch[0], launch[1]);");
            }
            PolicyKind::MdRange(rank) => {
                let begin: Vec<String> = (0..rank).map(|i| format!("launch[{}]", i)).collect();
                let end: Vec<String> = (rank..2 * rank).map(|i| format!("launch[{}]", i)).collect();
                line(
                    out,
                    1,
                    format!(
                        "Kokkos::MDRangePolicy<ExecSpace, Kokkos::Rank<{}>> __policy({{{}}}, {{{}}});",
                        rank,
                        begin.join(", "),
                        end.join(", ")
                    ),
                );
            }
            PolicyKind::Team => {
                line(
                    out,
                    1,
                    "Kokkos::TeamPolicy<ExecSpace> __policy(launch[0], launch[1], launch[2]);",
                );
                for level in 0..2 {
                    line(
                        out,
                        1,
                        format!(
                            "__policy.set_scratch_size({}, Kokkos::PerTeam(launch[{}]), Kokkos::PerThread(launch[{}]));",
                            level,
                            3 + 2 * level,
                            4 + 2 * level
                        ),
                    );
                }
            }
        }

        match (kernel.accumulator(), self.reducer) {
            (Some((_, dtype)), reducer) => {
                let op = reducer.map(|(_, op)| op).unwrap_or_default();
                let value = dtype.cpp_name();
                line(out, 1, format!("{} __value = {}();", value, value));
                line(
                    out,
                    1,
                    format!(
                        "Kokkos::parallel_reduce(\"{}\", __policy, __functor, {}<{}>(__value));",
                        kernel.name,
                        op.cpp_name(),
                        value
                    ),
                );
                line(out, 1, "Kokkos::fence();");
                line(out, 1, format!("*static_cast<{}*>(result) = __value;", value));
            }
            (None, _) => {
                line(
                    out,
                    1,
                    format!("Kokkos::parallel_for(\"{}\", __policy, __functor);", kernel.name),
                );
                line(out, 1, "Kokkos::fence();");
                line(out, 1, "(void)result;");
            }
        }
        for (name, host) in copy_back {
            line(out, 1, format!("Kokkos::deep_copy({}, __functor.{});", host, name));
        }
        out.push_str("}\n");
    }
}

fn line(out: &mut String, indent: usize, text: impl AsRef<str>) {
    for _ in 0..indent {
        out.push_str(INDENT);
    }
    out.push_str(text.as_ref());
    out.push('\n');
}

/// `Kokkos::View<double**, Kokkos::LayoutRight, Kokkos::HostSpace>`
fn view_type(view: &ViewType, unmanaged_host: bool) -> String {
    let stars = "*".repeat(view.rank);
    if unmanaged_host {
        format!(
            "Kokkos::View<{}{}, {}, Kokkos::HostSpace, Kokkos::MemoryTraits<Kokkos::Unmanaged>>",
            view.dtype.cpp_name(),
            stars,
            view.layout.cpp_name()
        )
    } else {
        format!(
            "Kokkos::View<{}{}, {}, {}>",
            view.dtype.cpp_name(),
            stars,
            view.layout.cpp_name(),
            view.space.cpp_name()
        )
    }
}

/// Native spelling of a type
pub fn render_type(ty: &CType) -> String {
    match ty {
        CType::Scalar(dtype) => dtype.cpp_name().to_string(),
        CType::Void => "void".to_string(),
        CType::View(view) => view_type(view, false),
        CType::ScratchView { dtype, rank } => format!(
            "Kokkos::View<{}{}, ExecSpace::scratch_memory_space, Kokkos::MemoryTraits<Kokkos::Unmanaged>>",
            dtype.cpp_name(),
            "*".repeat(*rank)
        ),
        CType::TeamMember => "TeamMember".to_string(),
        CType::Pointer(inner) => format!("{}*", render_type(inner)),
        CType::Reference(inner) => format!("{}&", render_type(inner)),
        CType::Generic(name) => name.clone(),
    }
}

fn render_param(param: &ParamDecl) -> String {
    match &param.ty {
        CType::Scalar(dtype) => format!("const {} {}", dtype.cpp_name(), param.name),
        ty => format!("{} {}", render_type(ty), param.name),
    }
}

fn render_function(out: &mut String, function: &FunctionDecl) {
    if !function.template_params.is_empty() {
        let params: Vec<String> = function
            .template_params
            .iter()
            .map(|p| format!("class {}", p))
            .collect();
        let _ = writeln!(out, "template <{}>", params.join(", "));
    }
    let params: Vec<String> = function.params.iter().map(render_param).collect();
    let _ = writeln!(
        out,
        "KOKKOS_INLINE_FUNCTION {} {}({}) {{",
        render_type(&function.return_type),
        function.name,
        params.join(", ")
    );
    render_block(out, &function.body, 1);
    out.push_str("}\n");
}

fn render_block(out: &mut String, block: &Block, indent: usize) {
    for stmt in &block.stmts {
        render_stmt(out, stmt, indent);
    }
}

fn render_stmt(out: &mut String, stmt: &Stmt, indent: usize) {
    match stmt {
        Stmt::Decl(decl) => {
            let ty = render_type(&decl.ty);
            let text = match &decl.init {
                Init::None => format!("{} {};", ty, decl.name),
                Init::Assign(value) => format!("{} {} = {};", ty, decl.name, render_expr_at(value, indent)),
                Init::Construct(args) => {
                    let args: Vec<String> = args.iter().map(|a| render_expr_at(a, indent)).collect();
                    format!("{} {}({});", ty, decl.name, args.join(", "))
                }
            };
            line(out, indent, text);
        }
        Stmt::Expr(expr) => line(out, indent, format!("{};", render_expr_at(expr, indent))),
        Stmt::If {
            cond,
            then,
            otherwise,
        } => {
            line(out, indent, format!("if ({}) {{", render_expr_at(cond, indent)));
            render_block(out, then, indent + 1);
            if otherwise.is_empty() {
                line(out, indent, "}");
            } else {
                line(out, indent, "} else {");
                render_block(out, otherwise, indent + 1);
                line(out, indent, "}");
            }
        }
        Stmt::While { cond, body } => {
            line(out, indent, format!("while ({}) {{", render_expr_at(cond, indent)));
            render_block(out, body, indent + 1);
            line(out, indent, "}");
        }
        Stmt::For {
            var,
            dtype,
            begin,
            end,
            step,
            body,
        } => {
            let (compare, advance) = match *step {
                1 => ("<", format!("++{}", var)),
                -1 => (">", format!("--{}", var)),
                s if s > 0 => ("<", format!("{} += {}", var, s)),
                s => (">", format!("{} -= {}", var, -s)),
            };
            line(
                out,
                indent,
                format!(
                    "for ({} {} = {}; {} {} {}; {}) {{",
                    dtype.cpp_name(),
                    var,
                    render_expr_at(begin, indent),
                    var,
                    compare,
                    render_expr_at(end, indent),
                    advance
                ),
            );
            render_block(out, body, indent + 1);
            line(out, indent, "}");
        }
        Stmt::Return(None) => line(out, indent, "return;"),
        Stmt::Return(Some(value)) => line(out, indent, format!("return {};", render_expr_at(value, indent))),
        Stmt::Break => line(out, indent, "break;"),
        Stmt::Continue => line(out, indent, "continue;"),
        Stmt::Compound(block) => {
            line(out, indent, "{");
            render_block(out, block, indent + 1);
            line(out, indent, "}");
        }
    }
}

/// Render an expression on a single line
pub fn render_expr(expr: &Expr) -> String {
    render_expr_at(expr, 0)
}

const PREFIX: u8 = 12;
const PRIMARY: u8 = 13;

fn precedence(expr: &Expr) -> u8 {
    match expr {
        Expr::Assign { .. } => 0,
        Expr::Binary { op, .. } => op.precedence(),
        Expr::Unary { .. } | Expr::Cast { .. } => PREFIX,
        Expr::Literal(Scalar::Int(v)) if *v < 0 => PREFIX,
        Expr::Literal(Scalar::Float(v)) if v.is_sign_negative() => PREFIX,
        _ => PRIMARY,
    }
}

fn operand(expr: &Expr, min: u8, indent: usize) -> String {
    let text = render_expr_at(expr, indent);
    if precedence(expr) < min {
        format!("({})", text)
    } else {
        text
    }
}

fn render_expr_at(expr: &Expr, indent: usize) -> String {
    match expr {
        Expr::Literal(value) => render_literal(*value),
        Expr::DeclRef(name) => name.clone(),
        Expr::Binary { op, lhs, rhs } => {
            let p = op.precedence();
            // Mixed operands of shifts, bitwise and `||` are always grouped
            let grouped = |child: &Expr| match child {
                Expr::Binary { op: inner, .. } if inner != op => matches!(
                    op,
                    BinaryOp::Shl
                        | BinaryOp::Shr
                        | BinaryOp::BitAnd
                        | BinaryOp::BitOr
                        | BinaryOp::BitXor
                        | BinaryOp::LogicalOr
                ),
                _ => false,
            };
            let lhs_min = if grouped(lhs) { PRIMARY } else { p };
            let rhs_min = if grouped(rhs) { PRIMARY } else { p + 1 };
            format!(
                "{} {} {}",
                operand(lhs, lhs_min, indent),
                op.symbol(),
                operand(rhs, rhs_min, indent)
            )
        }
        Expr::Unary { op, operand: inner } => {
            // `- -1` must not render as `--1`
            let nested = matches!(**inner, Expr::Unary { .. }) || precedence(inner) == PREFIX;
            let text = render_expr_at(inner, indent);
            if nested || precedence(inner) < PREFIX {
                format!("{}({})", op.symbol(), text)
            } else {
                format!("{}{}", op.symbol(), text)
            }
        }
        Expr::Assign { op, target, value } => {
            let symbol = op.map(|op| format!("{}=", op.symbol())).unwrap_or_else(|| "=".to_string());
            format!(
                "{} {} {}",
                render_expr_at(target, indent),
                symbol,
                render_expr_at(value, indent)
            )
        }
        Expr::Call { callee, args } => {
            let args: Vec<String> = args.iter().map(|a| render_expr_at(a, indent)).collect();
            let args = args.join(", ");
            match callee {
                Callee::View(view) => format!("{}({})", view, args),
                Callee::Method { receiver, method } => format!("{}.{}({})", receiver, method.name(), args),
                Callee::Function(name) => format!("{}({})", name, args),
                Callee::Builtin(builtin) => format!("{}({})", builtin_name(*builtin), args),
            }
        }
        Expr::Cast { dtype, operand } => {
            format!("static_cast<{}>({})", dtype.cpp_name(), render_expr_at(operand, indent))
        }
        Expr::Lambda(lambda) => render_lambda(lambda, indent),
    }
}

fn builtin_name(builtin: Builtin) -> String {
    match builtin {
        Builtin::Math(math) => format!("Kokkos::{}", math.name()),
        Builtin::ParallelFor => "Kokkos::parallel_for".to_string(),
        Builtin::ParallelReduce => "Kokkos::parallel_reduce".to_string(),
        Builtin::Single => "Kokkos::single".to_string(),
        Builtin::Range(kind) => format!("Kokkos::{}", kind.name()),
        Builtin::Scope(scope) => format!("Kokkos::{}", scope.name()),
    }
}

fn render_lambda(lambda: &Lambda, indent: usize) -> String {
    let params: Vec<String> = lambda.params.iter().map(render_param).collect();
    let mut out = format!("[=]({}) {{\n", params.join(", "));
    render_block(&mut out, &lambda.body, indent + 1);
    for _ in 0..indent {
        out.push_str(INDENT);
    }
    out.push('}');
    out
}

fn render_literal(value: Scalar) -> String {
    match value {
        Scalar::Bool(b) => b.to_string(),
        Scalar::Int(v) if i32::try_from(v).is_ok() => v.to_string(),
        Scalar::Int(v) => format!("{}LL", v),
        Scalar::Float(v) if v.is_nan() => "Kokkos::Experimental::quiet_NaN<double>::value".to_string(),
        Scalar::Float(v) if v.is_infinite() => {
            let sign = if v < 0.0 { "-" } else { "" };
            format!("{}Kokkos::Experimental::infinity<double>::value", sign)
        }
        // Debug formatting always keeps a decimal point or exponent
        Scalar::Float(v) => format!("{:?}", v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms;
    use crate::cppast::{MathFunction, Method, UnaryOp};
    use crate::view::MemorySpace;
    use crate::kernel::{Accumulator, Args, Kernel};
    use crate::translator::translate;
    use crate::view::View;
    use pretty_assertions::assert_eq;

    fn var(name: &str) -> Expr {
        Expr::decl_ref(name)
    }

    #[test]
    fn test_parentheses_follow_precedence() {
        let sum = Expr::binary(BinaryOp::Add, var("a"), var("b"));
        assert_eq!(render_expr(&Expr::binary(BinaryOp::Mul, sum.clone(), var("c"))), "(a + b) * c");
        assert_eq!(render_expr(&Expr::binary(BinaryOp::Mul, var("c"), sum.clone())), "c * (a + b)");
        assert_eq!(render_expr(&Expr::binary(BinaryOp::Add, sum.clone(), var("c"))), "a + b + c");
        assert_eq!(
            render_expr(&Expr::binary(BinaryOp::Sub, var("c"), sum)),
            "c - (a + b)"
        );
        assert_eq!(
            render_expr(&Expr::unary(UnaryOp::Neg, Expr::int(-1))),
            "-(-1)"
        );
        assert_eq!(
            render_expr(&Expr::unary(UnaryOp::Deref, var("__ref_total"))),
            "*__ref_total"
        );
        assert_eq!(
            render_expr(&Expr::cast(DataType::Float64, var("n"))),
            "static_cast<double>(n)"
        );
    }

    #[test]
    fn test_calls_and_literals() {
        let call = Expr::call(
            Callee::Builtin(Builtin::Math(MathFunction::Pow)),
            vec![Expr::float(2.0), Expr::int(10)],
        );
        assert_eq!(render_expr(&call), "Kokkos::pow(2.0, 10)");
        assert_eq!(render_expr(&Expr::int(1 << 40)), "1099511627776LL");
        assert_eq!(
            render_expr(&Expr::method("team_member", Method::TeamRank, vec![])),
            "team_member.team_rank()"
        );
        assert_eq!(
            render_expr(&Expr::view_access("A", vec![var("i"), Expr::int(0)])),
            "A(i, 0)"
        );
    }

    #[test]
    fn test_lower_bound_rendering() {
        let mut out = String::new();
        render_function(&mut out, &algorithms::lower_bound());
        let expected = "\
template <class ViewType, class ValueType>
KOKKOS_INLINE_FUNCTION int32_t lower_bound(ViewType view, const int32_t size, ValueType value) {
  int32_t left = 0;
  int32_t right = size;
  int32_t mid;
  while (left < right) {
    mid = left + (right - left) / 2;
    if (view(mid) < value) {
      left = mid + 1;
    } else {
      right = mid;
    }
  }
  return left;
}
";
        assert_eq!(out, expected);
    }

    #[test]
    fn test_upper_bound_shift_is_parenthesized() {
        let mut out = String::new();
        render_function(&mut out, &algorithms::upper_bound());
        assert!(out.contains("while (left + 1 < right) {"));
        assert!(out.contains("mid = left + ((right - left) >> 1);"));
        assert!(out.contains("return right;"));
    }

    #[test]
    fn test_range_reduction_source() {
        let kernel = Kernel::new(
            "def total(i: int, acc: Acc[float], x: View1D[double]):\n    acc += x[i]\n",
        )
        .unwrap();
        let x = View::new(DataType::Float64, &[4]).unwrap();
        let args = Args::new().view("x", &x);
        let acc = Accumulator::from(0.0);
        let spec = Specialization::new(&args, Some(&acc), PolicyKind::Range, ExecutionSpace::OpenMp);
        let unit = translate(&kernel, &spec).unwrap();
        let source = render(&unit, &spec);

        assert!(source.contains("using ExecSpace = Kokkos::OpenMP;"));
        assert!(source.contains("  Kokkos::View<double*, Kokkos::LayoutRight, Kokkos::HostSpace> x;\n"));
        assert!(source.contains(
            "  KOKKOS_FUNCTION void operator()(const int32_t i, double& acc) const {\n    acc += x(i);\n  }\n"
        ));
        assert!(source.contains("Kokkos::parallel_reduce(\"total\", __policy, __functor, Kokkos::Sum<double>(__value));"));
        assert!(source.contains(&format!("extern \"C\" void {}(", ENTRY_SYMBOL)));
        assert_eq!(source, render(&unit, &spec));
    }

    #[test]
    fn test_team_source_with_nested_lambda() {
        let source = "\
def k(team_member, acc: Acc[float], x: View2D[double], M: int):
    e: int = team_member.league_rank()
    def inner(i: int, partial: Acc[float]):
        partial += x[e][i]
    row: float = parallel_reduce(TeamThreadRange(team_member, M), inner)
    acc += row
";
        let kernel = Kernel::new(source).unwrap();
        let x = View::new(DataType::Float64, &[2, 3])
            .unwrap()
            .with_space(MemorySpace::CudaSpace);
        let args = Args::new().view("x", &x).scalar("M", 3);
        let acc = Accumulator::from(0.0);
        let spec = Specialization::new(&args, Some(&acc), PolicyKind::Team, ExecutionSpace::Cuda);
        let unit = translate(&kernel, &spec).unwrap();
        let source = render(&unit, &spec);

        let expected_body = "\
  KOKKOS_FUNCTION void operator()(const TeamMember& team_member, double& acc) const {
    int32_t e = team_member.league_rank();
    double row;
    Kokkos::parallel_reduce(Kokkos::TeamThreadRange(team_member, M), [=](const int32_t i, double& partial) {
      partial += x(e, i);
    }, row);
    acc += row;
  }
";
        assert!(source.contains(expected_body), "{}", source);
        assert!(source.contains("__policy.set_scratch_size(1, Kokkos::PerTeam(launch[5]), Kokkos::PerThread(launch[6]));"));
        assert!(source.contains("Kokkos::deep_copy(__host_x, __functor.x);"));
    }
}
