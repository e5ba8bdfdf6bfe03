//! Native (Kokkos C++) abstract syntax tree
//!
//! Pure data: nodes are built bottom-up, children are exclusively owned by
//! their parent, and nothing is mutated after attachment. Rendering lives in
//! [`crate::codegen`]; execution on the host lives in [`crate::interpreter`].

use serde::{Deserialize, Serialize};

use crate::dtype::{DataType, Scalar};
use crate::policy::PolicyKind;
use crate::view::ViewType;

/// Native types appearing in declarations and parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CType {
    Scalar(DataType),
    Void,
    View(ViewType),
    /// Unmanaged view over team or thread scratch memory
    ScratchView { dtype: DataType, rank: usize },
    TeamMember,
    Pointer(Box<CType>),
    Reference(Box<CType>),
    /// Template parameter of a helper function
    Generic(String),
}

impl CType {
    pub fn scalar(&self) -> Option<DataType> {
        match self {
            CType::Scalar(dtype) => Some(*dtype),
            _ => None,
        }
    }

    /// Element type of a view or scratch view
    pub fn element(&self) -> Option<DataType> {
        match self {
            CType::View(view) => Some(view.dtype),
            CType::ScratchView { dtype, .. } => Some(*dtype),
            _ => None,
        }
    }

    /// Rank of a view or scratch view
    pub fn rank(&self) -> Option<usize> {
        match self {
            CType::View(view) => Some(view.rank),
            CType::ScratchView { rank, .. } => Some(*rank),
            _ => None,
        }
    }

    pub fn is_view(&self) -> bool {
        self.rank().is_some()
    }
}

/// Binary operators of the native language
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    LogicalAnd,
    LogicalOr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::LogicalAnd => "&&",
            BinaryOp::LogicalOr => "||",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
        }
    }

    /// Binding strength, higher binds tighter
    pub fn precedence(self) -> u8 {
        match self {
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => 10,
            BinaryOp::Add | BinaryOp::Sub => 9,
            BinaryOp::Shl | BinaryOp::Shr => 8,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 7,
            BinaryOp::Eq | BinaryOp::Ne => 6,
            BinaryOp::BitAnd => 5,
            BinaryOp::BitXor => 4,
            BinaryOp::BitOr => 3,
            BinaryOp::LogicalAnd => 2,
            BinaryOp::LogicalOr => 1,
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::LogicalAnd | BinaryOp::LogicalOr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
    BitNot,
    AddressOf,
    Deref,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Plus => "+",
            UnaryOp::Not => "!",
            UnaryOp::BitNot => "~",
            UnaryOp::AddressOf => "&",
            UnaryOp::Deref => "*",
        }
    }
}

/// Math functions available inside kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MathFunction {
    Sqrt,
    Exp,
    Log,
    Sin,
    Cos,
    Tan,
    Fabs,
    Abs,
    Floor,
    Ceil,
    Pow,
    Min,
    Max,
}

impl MathFunction {
    pub fn from_name(name: &str) -> Option<Self> {
        let function = match name {
            "sqrt" => MathFunction::Sqrt,
            "exp" => MathFunction::Exp,
            "log" => MathFunction::Log,
            "sin" => MathFunction::Sin,
            "cos" => MathFunction::Cos,
            "tan" => MathFunction::Tan,
            "fabs" => MathFunction::Fabs,
            "abs" => MathFunction::Abs,
            "floor" => MathFunction::Floor,
            "ceil" => MathFunction::Ceil,
            "pow" => MathFunction::Pow,
            "min" => MathFunction::Min,
            "max" => MathFunction::Max,
            _ => return None,
        };
        Some(function)
    }

    pub fn name(self) -> &'static str {
        match self {
            MathFunction::Sqrt => "sqrt",
            MathFunction::Exp => "exp",
            MathFunction::Log => "log",
            MathFunction::Sin => "sin",
            MathFunction::Cos => "cos",
            MathFunction::Tan => "tan",
            MathFunction::Fabs => "fabs",
            MathFunction::Abs => "abs",
            MathFunction::Floor => "floor",
            MathFunction::Ceil => "ceil",
            MathFunction::Pow => "pow",
            MathFunction::Min => "min",
            MathFunction::Max => "max",
        }
    }

    pub fn arity(self) -> usize {
        match self {
            MathFunction::Pow | MathFunction::Min | MathFunction::Max => 2,
            _ => 1,
        }
    }
}

/// Nested iteration ranges over a team handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeKind {
    TeamThreadRange,
    ThreadVectorRange,
    TeamVectorRange,
}

impl RangeKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "TeamThreadRange" => Some(RangeKind::TeamThreadRange),
            "ThreadVectorRange" => Some(RangeKind::ThreadVectorRange),
            "TeamVectorRange" => Some(RangeKind::TeamVectorRange),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RangeKind::TeamThreadRange => "TeamThreadRange",
            RangeKind::ThreadVectorRange => "ThreadVectorRange",
            RangeKind::TeamVectorRange => "TeamVectorRange",
        }
    }

    /// Iterations are split across the threads of the team
    pub fn spans_team(self) -> bool {
        !matches!(self, RangeKind::ThreadVectorRange)
    }
}

/// Scope of a single-execution block or scratch request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    PerTeam,
    PerThread,
}

impl Scope {
    pub fn name(self) -> &'static str {
        match self {
            Scope::PerTeam => "PerTeam",
            Scope::PerThread => "PerThread",
        }
    }
}

/// Library calls with fixed native spellings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Builtin {
    Math(MathFunction),
    /// `Kokkos::parallel_for(range, lambda)`
    ParallelFor,
    /// `Kokkos::parallel_reduce(range, lambda, result)`
    ParallelReduce,
    /// `Kokkos::single(scope(member), lambda)`
    Single,
    Range(RangeKind),
    Scope(Scope),
}

/// Methods called on a team handle or a view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    LeagueRank,
    LeagueSize,
    TeamRank,
    TeamSize,
    TeamBarrier,
    TeamScratch,
    ThreadScratch,
    Extent,
}

impl Method {
    pub fn from_name(name: &str) -> Option<Self> {
        let method = match name {
            "league_rank" => Method::LeagueRank,
            "league_size" => Method::LeagueSize,
            "team_rank" => Method::TeamRank,
            "team_size" => Method::TeamSize,
            "team_barrier" => Method::TeamBarrier,
            "team_scratch" => Method::TeamScratch,
            "thread_scratch" => Method::ThreadScratch,
            "extent" => Method::Extent,
            _ => return None,
        };
        Some(method)
    }

    pub fn name(self) -> &'static str {
        match self {
            Method::LeagueRank => "league_rank",
            Method::LeagueSize => "league_size",
            Method::TeamRank => "team_rank",
            Method::TeamSize => "team_size",
            Method::TeamBarrier => "team_barrier",
            Method::TeamScratch => "team_scratch",
            Method::ThreadScratch => "thread_scratch",
            Method::Extent => "extent",
        }
    }

    pub fn arity(self) -> usize {
        match self {
            Method::TeamScratch | Method::ThreadScratch | Method::Extent => 1,
            _ => 0,
        }
    }

    /// Methods on the team handle (everything except `extent`)
    pub fn on_team(self) -> bool {
        self != Method::Extent
    }
}

/// Target of a call expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Callee {
    /// Element access `v(i, j)`
    View(String),
    Method { receiver: String, method: Method },
    Builtin(Builtin),
    /// Helper function emitted into the translation unit
    Function(String),
}

/// A native expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Scalar),
    DeclRef(String),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    /// `target = value`, or `target op= value` when `op` is set
    Assign {
        op: Option<BinaryOp>,
        target: Box<Expr>,
        value: Box<Expr>,
    },
    Call {
        callee: Callee,
        args: Vec<Expr>,
    },
    /// `static_cast<T>(operand)`
    Cast {
        dtype: DataType,
        operand: Box<Expr>,
    },
    Lambda(Box<Lambda>),
}

impl Expr {
    pub fn int(value: i64) -> Self {
        Expr::Literal(Scalar::Int(value))
    }

    pub fn float(value: f64) -> Self {
        Expr::Literal(Scalar::Float(value))
    }

    pub fn bool(value: bool) -> Self {
        Expr::Literal(Scalar::Bool(value))
    }

    pub fn decl_ref(name: impl Into<String>) -> Self {
        Expr::DeclRef(name.into())
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        Expr::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn assign(target: Expr, value: Expr) -> Self {
        Expr::Assign {
            op: None,
            target: Box::new(target),
            value: Box::new(value),
        }
    }

    pub fn compound_assign(op: BinaryOp, target: Expr, value: Expr) -> Self {
        Expr::Assign {
            op: Some(op),
            target: Box::new(target),
            value: Box::new(value),
        }
    }

    pub fn call(callee: Callee, args: Vec<Expr>) -> Self {
        Expr::Call { callee, args }
    }

    pub fn view_access(view: impl Into<String>, indices: Vec<Expr>) -> Self {
        Expr::Call {
            callee: Callee::View(view.into()),
            args: indices,
        }
    }

    pub fn method(receiver: impl Into<String>, method: Method, args: Vec<Expr>) -> Self {
        Expr::Call {
            callee: Callee::Method {
                receiver: receiver.into(),
                method,
            },
            args,
        }
    }

    pub fn cast(dtype: DataType, operand: Expr) -> Self {
        Expr::Cast {
            dtype,
            operand: Box::new(operand),
        }
    }

    /// Expressions that may appear on the left of an assignment
    pub fn is_lvalue(&self) -> bool {
        match self {
            Expr::DeclRef(_) => true,
            Expr::Call {
                callee: Callee::View(_),
                ..
            } => true,
            Expr::Unary {
                op: UnaryOp::Deref,
                ..
            } => true,
            _ => false,
        }
    }
}

/// Parameter of a lambda or helper function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDecl {
    pub ty: CType,
    pub name: String,
}

impl ParamDecl {
    pub fn new(ty: CType, name: impl Into<String>) -> Self {
        Self {
            ty,
            name: name.into(),
        }
    }
}

/// A by-value closure `[=](params) { body }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lambda {
    /// Outer names the body reads, copied when the lambda is created
    pub captures: Vec<String>,
    pub params: Vec<ParamDecl>,
    pub body: Block,
}

/// Initializer of a variable declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Init {
    None,
    /// `T x = value;`
    Assign(Expr),
    /// `T x(args...);`
    Construct(Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarDecl {
    pub ty: CType,
    pub name: String,
    pub init: Init,
}

impl VarDecl {
    pub fn new(ty: CType, name: impl Into<String>, init: Init) -> Self {
        Self {
            ty,
            name: name.into(),
            init,
        }
    }
}

/// A braced statement sequence
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Block {
    pub stmts: Vec<Stmt>,
}

impl Block {
    pub fn new(stmts: Vec<Stmt>) -> Self {
        Self { stmts }
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }
}

impl From<Vec<Stmt>> for Block {
    fn from(stmts: Vec<Stmt>) -> Self {
        Self { stmts }
    }
}

/// A native statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Decl(VarDecl),
    Expr(Expr),
    If {
        cond: Expr,
        then: Block,
        otherwise: Block,
    },
    While {
        cond: Expr,
        body: Block,
    },
    /// `for (T var = begin; var < end; var += step)`, `>` when `step` is negative
    For {
        var: String,
        dtype: DataType,
        begin: Expr,
        end: Expr,
        step: i64,
        body: Block,
    },
    Return(Option<Expr>),
    Break,
    Continue,
    Compound(Block),
}

impl Stmt {
    pub fn if_else(cond: Expr, then: Vec<Stmt>, otherwise: Vec<Stmt>) -> Self {
        Stmt::If {
            cond,
            then: Block::new(then),
            otherwise: Block::new(otherwise),
        }
    }

    pub fn while_loop(cond: Expr, body: Vec<Stmt>) -> Self {
        Stmt::While {
            cond,
            body: Block::new(body),
        }
    }

    pub fn decl(ty: CType, name: impl Into<String>, init: Init) -> Self {
        Stmt::Decl(VarDecl::new(ty, name, init))
    }
}

/// A templated inline helper emitted ahead of the kernel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    pub template_params: Vec<String>,
    pub return_type: CType,
    pub params: Vec<ParamDecl>,
    pub body: Block,
}

/// Role of a kernel parameter in the launch signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamRole {
    /// Iteration index of a range or md-range policy
    Index,
    TeamMember,
    View(ViewType),
    Scalar(DataType),
    Accumulator(DataType),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelParam {
    pub name: String,
    pub role: ParamRole,
}

/// Scratch allocation recorded during translation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScratchRequirement {
    pub level: usize,
    pub scope: Scope,
    pub dtype: DataType,
    /// Extents with locals substituted; only kernel scalars and team queries remain
    pub extents: Vec<Expr>,
    /// Allocated unconditionally at the top level of the kernel body
    pub unconditional: bool,
}

/// The translated kernel body and its launch signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelFunction {
    pub name: String,
    pub policy: PolicyKind,
    pub params: Vec<KernelParam>,
    pub body: Block,
}

impl KernelFunction {
    /// Element type of the accumulator, for reduction kernels
    pub fn accumulator(&self) -> Option<(&str, DataType)> {
        self.params.iter().find_map(|p| match p.role {
            ParamRole::Accumulator(dtype) => Some((p.name.as_str(), dtype)),
            _ => None,
        })
    }

    pub fn is_reduction(&self) -> bool {
        self.accumulator().is_some()
    }

    /// Parameters bound by name at dispatch: views and scalars
    pub fn arguments(&self) -> impl Iterator<Item = &KernelParam> {
        self.params
            .iter()
            .filter(|p| matches!(p.role, ParamRole::View(_) | ParamRole::Scalar(_)))
    }
}

/// Everything rendered into one source file or executed by the host back-end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationUnit {
    pub helpers: Vec<FunctionDecl>,
    pub kernel: KernelFunction,
    pub scratch: Vec<ScratchRequirement>,
}

impl TranslationUnit {
    pub fn helper(&self, name: &str) -> Option<&FunctionDecl> {
        self.helpers.iter().find(|h| h.name == name)
    }

    /// Total number of statement and expression nodes
    pub fn node_count(&self) -> usize {
        let mut counter = NodeCounter::default();
        for helper in &self.helpers {
            walk_block(&mut counter, &helper.body);
        }
        walk_block(&mut counter, &self.kernel.body);
        counter.count
    }
}

/// Structural traversal over statements and expressions
pub trait Visitor {
    fn visit_stmt(&mut self, _stmt: &Stmt) {}
    fn visit_expr(&mut self, _expr: &Expr) {}
}

pub fn walk_block<V: Visitor + ?Sized>(visitor: &mut V, block: &Block) {
    for stmt in &block.stmts {
        walk_stmt(visitor, stmt);
    }
}

pub fn walk_stmt<V: Visitor + ?Sized>(visitor: &mut V, stmt: &Stmt) {
    visitor.visit_stmt(stmt);
    match stmt {
        Stmt::Decl(decl) => match &decl.init {
            Init::None => {}
            Init::Assign(expr) => walk_expr(visitor, expr),
            Init::Construct(args) => args.iter().for_each(|a| walk_expr(visitor, a)),
        },
        Stmt::Expr(expr) => walk_expr(visitor, expr),
        Stmt::If {
            cond,
            then,
            otherwise,
        } => {
            walk_expr(visitor, cond);
            walk_block(visitor, then);
            walk_block(visitor, otherwise);
        }
        Stmt::While { cond, body } => {
            walk_expr(visitor, cond);
            walk_block(visitor, body);
        }
        Stmt::For {
            begin, end, body, ..
        } => {
            walk_expr(visitor, begin);
            walk_expr(visitor, end);
            walk_block(visitor, body);
        }
        Stmt::Return(value) => {
            if let Some(value) = value {
                walk_expr(visitor, value);
            }
        }
        Stmt::Break | Stmt::Continue => {}
        Stmt::Compound(block) => walk_block(visitor, block),
    }
}

pub fn walk_expr<V: Visitor + ?Sized>(visitor: &mut V, expr: &Expr) {
    visitor.visit_expr(expr);
    match expr {
        Expr::Literal(_) | Expr::DeclRef(_) => {}
        Expr::Binary { lhs, rhs, .. } => {
            walk_expr(visitor, lhs);
            walk_expr(visitor, rhs);
        }
        Expr::Unary { operand, .. } | Expr::Cast { operand, .. } => walk_expr(visitor, operand),
        Expr::Assign { target, value, .. } => {
            walk_expr(visitor, target);
            walk_expr(visitor, value);
        }
        Expr::Call { args, .. } => args.iter().for_each(|a| walk_expr(visitor, a)),
        Expr::Lambda(lambda) => walk_block(visitor, &lambda.body),
    }
}

#[derive(Default)]
struct NodeCounter {
    count: usize,
}

impl Visitor for NodeCounter {
    fn visit_stmt(&mut self, _stmt: &Stmt) {
        self.count += 1;
    }

    fn visit_expr(&mut self, _expr: &Expr) {
        self.count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Calls(Vec<String>);

    impl Visitor for Calls {
        fn visit_expr(&mut self, expr: &Expr) {
            if let Expr::Call {
                callee: Callee::Function(name),
                ..
            } = expr
            {
                self.0.push(name.clone());
            }
        }
    }

    #[test]
    fn test_walk_reaches_lambda_bodies() {
        let lambda = Lambda {
            captures: vec!["v".to_string()],
            params: vec![ParamDecl::new(CType::Scalar(DataType::Int32), "i")],
            body: Block::new(vec![Stmt::Expr(Expr::call(
                Callee::Function("lower_bound".to_string()),
                vec![Expr::decl_ref("v"), Expr::int(4), Expr::int(2)],
            ))]),
        };
        let body = Block::new(vec![Stmt::if_else(
            Expr::bool(true),
            vec![Stmt::Expr(Expr::Lambda(Box::new(lambda)))],
            vec![],
        )]);

        let mut calls = Calls::default();
        walk_block(&mut calls, &body);
        assert_eq!(calls.0, vec!["lower_bound".to_string()]);
    }

    #[test]
    fn test_lvalues() {
        assert!(Expr::decl_ref("x").is_lvalue());
        assert!(Expr::view_access("v", vec![Expr::int(0)]).is_lvalue());
        assert!(Expr::unary(UnaryOp::Deref, Expr::decl_ref("__ref_x")).is_lvalue());
        assert!(!Expr::int(1).is_lvalue());
    }

    #[test]
    fn test_precedence_order() {
        assert!(BinaryOp::Mul.precedence() > BinaryOp::Add.precedence());
        assert!(BinaryOp::Add.precedence() > BinaryOp::Shr.precedence());
        assert!(BinaryOp::LogicalAnd.precedence() > BinaryOp::LogicalOr.precedence());
    }
}
