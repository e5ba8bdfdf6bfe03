//! Abstract Syntax Tree definitions for the kernel dialect

use crate::error::Location;

/// A parsed source file: one or more top-level kernel functions
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub functions: Vec<FunctionDef>,
}

/// A function definition, either a kernel or a nested work function
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<Param>,
    pub returns: Option<TypeExpr>,
    pub body: Vec<Stmt>,
    pub location: Location,
}

/// A function parameter with its optional annotation
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub annotation: Option<TypeExpr>,
    pub location: Location,
}

/// Type annotation: `int`, `View2D[float64]`, `pk.Acc[pk.double]`
#[derive(Debug, Clone, PartialEq)]
pub enum TypeExpr {
    Name(String),
    Generic { name: String, args: Vec<TypeExpr> },
}

impl TypeExpr {
    /// Name as written, qualifier included
    pub fn name(&self) -> &str {
        match self {
            TypeExpr::Name(name) => name,
            TypeExpr::Generic { name, .. } => name,
        }
    }

    /// Base name without any module qualifier
    pub fn base_name(&self) -> &str {
        let name = self.name();
        name.rsplit('.').next().unwrap_or(name)
    }
}

impl std::fmt::Display for TypeExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeExpr::Name(name) => write!(f, "{}", name),
            TypeExpr::Generic { name, args } => {
                write!(f, "{}[", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// A statement with its source location
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub location: Location,
}

/// Statement types
#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// `target = value`, `target: T = value` or a bare `target: T`
    Assign {
        target: Expr,
        annotation: Option<TypeExpr>,
        value: Option<Expr>,
    },
    /// `target op= value`
    AugAssign { target: Expr, op: BinOp, value: Expr },
    /// Expression evaluated for its effect
    Expr(Expr),
    /// `if` / `elif` / `else`; an `elif` chain nests in `orelse`
    If {
        cond: Expr,
        then: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    While { cond: Expr, body: Vec<Stmt> },
    /// `for var in range(...)`
    For { var: String, iter: Expr, body: Vec<Stmt> },
    Return(Option<Expr>),
    Break,
    Continue,
    Pass,
    Nonlocal(Vec<String>),
    /// Nested function definition
    FunctionDef(FunctionDef),
}

/// An expression with its source location
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub location: Location,
}

impl Expr {
    pub fn new(kind: ExprKind, location: Location) -> Self {
        Self { kind, location }
    }

    /// Name of a plain variable reference
    pub fn as_name(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Name(name) => Some(name),
            _ => None,
        }
    }

    /// Dotted path of a name or attribute chain: `pk.TeamThreadRange`
    pub fn dotted_path(&self) -> Option<String> {
        match &self.kind {
            ExprKind::Name(name) => Some(name.clone()),
            ExprKind::Attribute { value, attr } => {
                value.dotted_path().map(|base| format!("{}.{}", base, attr))
            }
            _ => None,
        }
    }
}

/// Expression types
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    NoneLit,
    Name(String),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary { op: UnaryOp, operand: Box<Expr> },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        keywords: Vec<(String, Expr)>,
    },
    Attribute { value: Box<Expr>, attr: String },
    /// `value[i]` or `value[i, j]`
    Subscript { value: Box<Expr>, indices: Vec<Expr> },
    Tuple(Vec<Expr>),
}

/// Binary operators, including comparisons and boolean connectives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }

    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl | BinOp::Shr
        )
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
    Invert,
}
