//! Kernel source to native AST translation
//!
//! Walks the parsed kernel definition with the concrete argument types of one
//! specialization and produces a [`TranslationUnit`]. Every local gets a
//! static type (annotated or inferred from its first assignment), nested
//! `def`s become lambdas at their point of use, and outer variables are
//! captured by value unless declared `nonlocal`.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::algorithms;
use crate::ast::{self, BinOp, ExprKind, FunctionDef, StmtKind, TypeExpr};
use crate::cppast::{
    BinaryOp, Block, Builtin, CType, Callee, Expr, FunctionDecl, Init, KernelFunction,
    KernelParam, Lambda, MathFunction, Method, ParamDecl, ParamRole, RangeKind,
    ScratchRequirement, Scope, Stmt, TranslationUnit, UnaryOp,
};
use crate::dtype::DataType;
use crate::error::{KernelError, KernelResult, Location};
use crate::kernel::{is_accumulator_annotation, ArgType, Kernel, Specialization};
use crate::policy::{PolicyKind, SCRATCH_LEVELS};
use crate::view::ViewType;

/// Translate `kernel` for the argument types in `spec`
pub fn translate(kernel: &Kernel, spec: &Specialization) -> KernelResult<TranslationUnit> {
    Translator::new(kernel, spec).translate()
}

#[derive(Debug, Clone, PartialEq)]
enum VarKind {
    Local,
    /// Kernel argument bound at dispatch; read-only
    Argument,
    /// Kernel or loop index; read-only
    Index,
    Member,
    Accumulator,
    /// `T* __ref_x = &x;`
    Pointer,
    /// Name declared `nonlocal`, accessed through the named pointer
    Alias(String),
}

#[derive(Debug, Clone)]
struct Var {
    ty: CType,
    kind: VarKind,
}

#[derive(Default)]
struct BlockScope {
    vars: HashMap<String, Var>,
    defs: HashMap<String, FunctionDef>,
}

/// The kernel body or one lambda
struct FunctionScope {
    blocks: Vec<BlockScope>,
    captures: BTreeSet<String>,
    loop_depth: usize,
}

impl FunctionScope {
    fn new() -> Self {
        Self {
            blocks: vec![BlockScope::default()],
            captures: BTreeSet::new(),
            loop_depth: 0,
        }
    }
}

/// Translator state for one kernel specialization
pub struct Translator<'a> {
    kernel: &'a Kernel,
    spec: &'a Specialization,
    functions: Vec<FunctionScope>,
    helpers: BTreeMap<String, FunctionDecl>,
    scratch: Vec<ScratchRequirement>,
    /// Kernel-level locals whose value is known before launch
    static_values: HashMap<String, Expr>,
}

impl<'a> Translator<'a> {
    pub fn new(kernel: &'a Kernel, spec: &'a Specialization) -> Self {
        Self {
            kernel,
            spec,
            functions: Vec::new(),
            helpers: BTreeMap::new(),
            scratch: Vec::new(),
            static_values: HashMap::new(),
        }
    }

    pub fn translate(mut self) -> KernelResult<TranslationUnit> {
        let kernel = self.kernel;
        let def = kernel.def();
        self.functions.push(FunctionScope::new());
        let params = self.kernel_params(def)?;
        let body = self.statements(&def.body)?;
        self.functions.pop();

        let unit = TranslationUnit {
            helpers: self.helpers.into_values().collect(),
            kernel: KernelFunction {
                name: def.name.clone(),
                policy: self.spec.policy,
                params,
                body: Block::new(body),
            },
            scratch: self.scratch,
        };
        log::debug!(
            "translated kernel '{}': {} nodes, {} helper(s), {} scratch allocation(s)",
            unit.kernel.name,
            unit.node_count(),
            unit.helpers.len(),
            unit.scratch.len()
        );
        Ok(unit)
    }

    // ---------------------------------------------------------------------
    // Scopes

    fn current(&self) -> usize {
        self.functions.len() - 1
    }

    fn function(&mut self) -> &mut FunctionScope {
        let current = self.current();
        &mut self.functions[current]
    }

    fn push_block(&mut self) {
        self.function().blocks.push(BlockScope::default());
    }

    fn pop_block(&mut self) {
        self.function().blocks.pop();
    }

    fn declare(&mut self, name: &str, ty: CType, kind: VarKind) {
        if let Some(block) = self.function().blocks.last_mut() {
            block.vars.insert(name.to_string(), Var { ty, kind });
        }
    }

    /// Find a visible variable without recording a capture
    fn lookup(&self, name: &str) -> Option<(usize, &Var)> {
        for (depth, function) in self.functions.iter().enumerate().rev() {
            for block in function.blocks.iter().rev() {
                if let Some(var) = block.vars.get(name) {
                    return Some((depth, var));
                }
            }
        }
        None
    }

    /// Find a visible variable and record it as captured by every lambda
    /// between its declaration and the current function
    fn resolve(&mut self, name: &str) -> Option<(usize, Var)> {
        let (depth, var) = self.lookup(name).map(|(d, v)| (d, v.clone()))?;
        for function in self.functions.iter_mut().skip(depth + 1) {
            function.captures.insert(name.to_string());
        }
        Some((depth, var))
    }

    fn declared_in_current(&self, name: &str) -> Option<&Var> {
        self.functions[self.current()]
            .blocks
            .iter()
            .rev()
            .find_map(|block| block.vars.get(name))
    }

    fn lookup_def(&self, name: &str) -> Option<FunctionDef> {
        self.functions
            .iter()
            .rev()
            .flat_map(|f| f.blocks.iter().rev())
            .find_map(|block| block.defs.get(name).cloned())
    }

    fn at_kernel_top_level(&self) -> bool {
        self.functions.len() == 1 && self.functions[0].blocks.len() == 1
    }

    // ---------------------------------------------------------------------
    // Kernel signature

    fn kernel_params(&mut self, def: &FunctionDef) -> KernelResult<Vec<KernelParam>> {
        let policy = self.spec.policy;
        let leading = policy.index_params();
        if def.params.len() < leading {
            return Err(KernelError::translation(
                def.location,
                format!(
                    "kernel '{}' needs {} leading index parameter(s) for a {:?} policy",
                    def.name, leading, policy
                ),
            ));
        }

        let accumulator = self.kernel.accumulator_param(self.spec).map(|p| p.name.clone());
        match (&accumulator, self.spec.accumulator) {
            (Some(name), None) => {
                return Err(KernelError::precondition(format!(
                    "kernel '{}' takes accumulator '{}' and must be dispatched with parallel_reduce",
                    def.name, name
                )))
            }
            (None, Some(_)) => {
                return Err(KernelError::precondition(format!(
                    "kernel '{}' has no accumulator parameter and cannot be dispatched with parallel_reduce",
                    def.name
                )))
            }
            _ => {}
        }

        let mut params = Vec::with_capacity(def.params.len());
        for (position, param) in def.params.iter().enumerate() {
            let (role, ty, kind) = if position < leading {
                self.index_param(param, policy)?
            } else if accumulator.as_deref() == Some(param.name.as_str()) {
                let dtype = match &param.annotation {
                    Some(TypeExpr::Generic { args, .. }) if !args.is_empty() => {
                        resolve_type(&args[0], param.location)?
                    }
                    _ => self
                        .spec
                        .accumulator
                        .map(|(dtype, _)| dtype)
                        .unwrap_or(DataType::Float64),
                };
                (
                    ParamRole::Accumulator(dtype),
                    CType::Reference(Box::new(CType::Scalar(dtype))),
                    VarKind::Accumulator,
                )
            } else {
                self.bound_param(param)?
            };
            self.declare(&param.name, ty, kind);
            params.push(KernelParam {
                name: param.name.clone(),
                role,
            });
        }
        Ok(params)
    }

    fn index_param(
        &self,
        param: &ast::Param,
        policy: PolicyKind,
    ) -> KernelResult<(ParamRole, CType, VarKind)> {
        let annotation = param.annotation.as_ref().map(|a| a.base_name().to_string());
        if policy == PolicyKind::Team {
            if let Some(name) = annotation.filter(|n| n != "TeamMember") {
                return Err(KernelError::precondition(format!(
                    "parameter '{}' is annotated '{}' but the kernel is dispatched with a team policy",
                    param.name, name
                )));
            }
            Ok((ParamRole::TeamMember, CType::TeamMember, VarKind::Member))
        } else {
            if let Some(name) = annotation.filter(|n| !matches!(n.as_str(), "int" | "int32" | "int64")) {
                return Err(KernelError::precondition(format!(
                    "parameter '{}' is annotated '{}' but the kernel is dispatched with a range policy",
                    param.name, name
                )));
            }
            Ok((ParamRole::Index, CType::Scalar(DataType::Int32), VarKind::Index))
        }
    }

    fn bound_param(&self, param: &ast::Param) -> KernelResult<(ParamRole, CType, VarKind)> {
        match self.spec.arg(&param.name)? {
            ArgType::View(bound) => {
                if let Some(annotation) = &param.annotation {
                    check_view_annotation(param, annotation, bound)?;
                }
                Ok((ParamRole::View(bound), CType::View(bound), VarKind::Argument))
            }
            ArgType::Scalar(bound) => {
                let dtype = match &param.annotation {
                    Some(annotation) => match DataType::from_name(annotation.name()) {
                        Some(dtype) => dtype,
                        None => {
                            return Err(KernelError::translation(
                                param.location,
                                format!(
                                    "parameter '{}' is annotated '{}' but bound to a {} scalar",
                                    param.name, annotation, bound
                                ),
                            ))
                        }
                    },
                    None => bound,
                };
                Ok((ParamRole::Scalar(dtype), CType::Scalar(dtype), VarKind::Argument))
            }
        }
    }

    // ---------------------------------------------------------------------
    // Statements

    fn statements(&mut self, stmts: &[ast::Stmt]) -> KernelResult<Vec<Stmt>> {
        let mut out = Vec::new();
        for stmt in stmts {
            out.extend(self.statement(stmt)?);
        }
        Ok(out)
    }

    fn block(&mut self, stmts: &[ast::Stmt]) -> KernelResult<Block> {
        self.push_block();
        let result = self.statements(stmts);
        self.pop_block();
        Ok(Block::new(result?))
    }

    fn statement(&mut self, stmt: &ast::Stmt) -> KernelResult<Vec<Stmt>> {
        let location = stmt.location;
        match &stmt.kind {
            StmtKind::Assign {
                target,
                annotation,
                value,
            } => self.assign(target, annotation.as_ref(), value.as_ref(), location),
            StmtKind::AugAssign { target, op, value } => {
                self.aug_assign(target, *op, value, location)
            }
            StmtKind::Expr(expr) => self.expr_statement(expr),
            StmtKind::If { cond, then, orelse } => {
                let (cond, _) = self.value(cond)?;
                let then = self.block(then)?;
                let otherwise = self.block(orelse)?;
                Ok(vec![Stmt::If {
                    cond,
                    then,
                    otherwise,
                }])
            }
            StmtKind::While { cond, body } => {
                let (cond, _) = self.value(cond)?;
                self.function().loop_depth += 1;
                let body = self.block(body);
                self.function().loop_depth -= 1;
                Ok(vec![Stmt::While { cond, body: body? }])
            }
            StmtKind::For { var, iter, body } => self.for_loop(var, iter, body, location),
            StmtKind::Return(value) => {
                if matches!(value, Some(v) if v.kind != ExprKind::NoneLit) {
                    return Err(KernelError::translation(
                        location,
                        "kernels and work functions cannot return a value",
                    ));
                }
                Ok(vec![Stmt::Return(None)])
            }
            StmtKind::Break | StmtKind::Continue => {
                if self.functions[self.current()].loop_depth == 0 {
                    return Err(KernelError::translation(location, "'break'/'continue' outside a loop"));
                }
                Ok(vec![match stmt.kind {
                    StmtKind::Break => Stmt::Break,
                    _ => Stmt::Continue,
                }])
            }
            StmtKind::Pass => Ok(vec![]),
            StmtKind::Nonlocal(_) => {
                if self.functions.len() == 1 {
                    return Err(KernelError::translation(
                        location,
                        "'nonlocal' is only valid inside a nested function",
                    ));
                }
                // Bound when the enclosing lambda was opened
                Ok(vec![])
            }
            StmtKind::FunctionDef(def) => {
                let function = self.function();
                if let Some(block) = function.blocks.last_mut() {
                    block.defs.insert(def.name.clone(), def.clone());
                }
                Ok(vec![])
            }
        }
    }

    fn assign(
        &mut self,
        target: &ast::Expr,
        annotation: Option<&TypeExpr>,
        value: Option<&ast::Expr>,
        location: Location,
    ) -> KernelResult<Vec<Stmt>> {
        let name = match &target.kind {
            ExprKind::Name(name) => name,
            ExprKind::Subscript { .. } => {
                if annotation.is_some() {
                    return Err(KernelError::translation(location, "view elements cannot be annotated"));
                }
                let value = value.ok_or_else(|| {
                    KernelError::translation(location, "view element assignment needs a value")
                })?;
                let (target, _) = self.view_element(target)?;
                let (value, _) = self.value(value)?;
                return Ok(vec![Stmt::Expr(Expr::assign(target, value))]);
            }
            _ => {
                return Err(KernelError::translation(
                    location,
                    "only names and view elements can be assigned",
                ))
            }
        };

        if let Some(value) = value {
            if self.builtin_name(value).as_deref() == Some("parallel_reduce") {
                return self.reduce_assign(name, annotation, value, location);
            }
        }
        let is_scratch = annotation.map(|a| scratch_rank(a.base_name()).is_some()).unwrap_or(false)
            || value
                .and_then(|v| self.builtin_name(v))
                .map(|n| scratch_rank(&n).is_some())
                .unwrap_or(false);
        if is_scratch {
            return self.scratch_decl(name, annotation, value, location);
        }

        let declared_here = self.declared_in_current(name).cloned();
        let declare = match (annotation, &declared_here) {
            (Some(_), None) => true,
            (None, None) => self.lookup(name).is_none(),
            (Some(annotation), Some(var)) => {
                let dtype = resolve_type(annotation, location)?;
                if var.ty != CType::Scalar(dtype) {
                    return Err(KernelError::translation(
                        location,
                        format!("'{}' is already declared with a different type", name),
                    ));
                }
                false
            }
            (None, Some(_)) => false,
        };

        if declare {
            return self.declare_local(name, annotation, value, location);
        }

        let value = value.ok_or_else(|| {
            KernelError::translation(location, format!("'{}' is already declared", name))
        })?;
        let target = self.assignable(name, location)?;
        let (value, _) = self.value(value)?;
        Ok(vec![Stmt::Expr(Expr::assign(target, value))])
    }

    fn declare_local(
        &mut self,
        name: &str,
        annotation: Option<&TypeExpr>,
        value: Option<&ast::Expr>,
        location: Location,
    ) -> KernelResult<Vec<Stmt>> {
        let annotated = annotation.map(|a| resolve_type(a, location)).transpose()?;
        let (init, dtype) = match value {
            Some(value) => {
                let (expr, inferred) = self.value(value)?;
                (Init::Assign(expr), annotated.unwrap_or(inferred))
            }
            None => match annotated {
                Some(dtype) => (Init::None, dtype),
                None => {
                    return Err(KernelError::translation(
                        location,
                        format!("cannot infer the type of '{}'", name),
                    ))
                }
            },
        };

        if self.functions.len() == 1 {
            match &init {
                Init::Assign(expr) => match self.static_value(expr) {
                    Some(value) => {
                        self.static_values.insert(name.to_string(), value);
                    }
                    None => {
                        self.static_values.remove(name);
                    }
                },
                _ => {
                    self.static_values.remove(name);
                }
            }
        }
        self.declare(name, CType::Scalar(dtype), VarKind::Local);
        Ok(vec![Stmt::decl(CType::Scalar(dtype), name, init)])
    }

    /// Target expression for writing `name` from the current function
    fn assignable(&mut self, name: &str, location: Location) -> KernelResult<Expr> {
        let current = self.current();
        let (depth, var) = self
            .resolve(name)
            .ok_or_else(|| KernelError::translation(location, format!("unknown name '{}'", name)))?;
        self.static_values.remove(name);
        match var.kind {
            VarKind::Alias(pointer) => {
                self.resolve(&pointer);
                Ok(Expr::unary(UnaryOp::Deref, Expr::decl_ref(pointer)))
            }
            VarKind::Argument => Err(KernelError::translation(
                location,
                format!("kernel argument '{}' is read-only", name),
            )),
            VarKind::Index => Err(KernelError::translation(
                location,
                format!("index '{}' cannot be assigned", name),
            )),
            VarKind::Member | VarKind::Pointer => Err(KernelError::translation(
                location,
                format!("'{}' cannot be assigned", name),
            )),
            VarKind::Local | VarKind::Accumulator => {
                if depth != current {
                    return Err(KernelError::translation(
                        location,
                        format!(
                            "cannot assign to outer variable '{}' from a nested function without declaring it nonlocal",
                            name
                        ),
                    ));
                }
                if var.ty.is_view() {
                    return Err(KernelError::translation(
                        location,
                        format!("view '{}' cannot be rebound", name),
                    ));
                }
                Ok(Expr::decl_ref(name))
            }
        }
    }

    fn aug_assign(
        &mut self,
        target: &ast::Expr,
        op: BinOp,
        value: &ast::Expr,
        location: Location,
    ) -> KernelResult<Vec<Stmt>> {
        let (target, target_type) = match &target.kind {
            ExprKind::Name(name) => {
                let target_type = match self.lookup(name) {
                    Some((_, var)) => value_type(&var.ty),
                    None => None,
                };
                let target_expr = self.assignable(name, location)?;
                let target_type = target_type.ok_or_else(|| {
                    KernelError::translation(location, format!("'{}' is not numeric", name))
                })?;
                (target_expr, target_type)
            }
            ExprKind::Subscript { .. } => self.view_element(target)?,
            _ => {
                return Err(KernelError::translation(
                    location,
                    "only names and view elements can be assigned",
                ))
            }
        };
        let (value, value_type) = self.value(value)?;

        let both_int = !target_type.is_float() && !value_type.is_float();
        let direct = match op {
            BinOp::Add => Some(BinaryOp::Add),
            BinOp::Sub => Some(BinaryOp::Sub),
            BinOp::Mul => Some(BinaryOp::Mul),
            BinOp::Div if !target_type.is_float() => {
                return Err(KernelError::translation(
                    location,
                    "'/=' on an integer target changes its type; use '//='",
                ))
            }
            BinOp::Div => Some(BinaryOp::Div),
            BinOp::FloorDiv if both_int => Some(BinaryOp::Div),
            BinOp::Mod if both_int => Some(BinaryOp::Rem),
            BinOp::BitAnd if both_int => Some(BinaryOp::BitAnd),
            BinOp::BitOr if both_int => Some(BinaryOp::BitOr),
            BinOp::BitXor if both_int => Some(BinaryOp::BitXor),
            BinOp::Shl if both_int => Some(BinaryOp::Shl),
            BinOp::Shr if both_int => Some(BinaryOp::Shr),
            _ => None,
        };
        let expr = match direct {
            Some(native) => Expr::compound_assign(native, target, value),
            None => {
                let (combined, _) =
                    self.binary(op, (target.clone(), target_type), (value, value_type), location)?;
                Expr::assign(target, combined)
            }
        };
        Ok(vec![Stmt::Expr(expr)])
    }

    fn expr_statement(&mut self, expr: &ast::Expr) -> KernelResult<Vec<Stmt>> {
        let location = expr.location;
        match &expr.kind {
            // Docstrings
            ExprKind::Str(_) => Ok(vec![]),
            ExprKind::Call { args, keywords, .. } => {
                if !keywords.is_empty() {
                    return Err(KernelError::translation(location, "keyword arguments are not supported"));
                }
                match self.builtin_name(expr).as_deref() {
                    Some("parallel_for") => self.nested_for(args, location),
                    Some("parallel_reduce") => Err(KernelError::translation(
                        location,
                        "the result of parallel_reduce must be assigned to a variable",
                    )),
                    Some("single") => self.single(args, location),
                    _ => {
                        let (expr, _) = self.expr(expr)?;
                        Ok(vec![Stmt::Expr(expr)])
                    }
                }
            }
            _ => Err(KernelError::translation(location, "expression statement has no effect")),
        }
    }

    fn for_loop(
        &mut self,
        var: &str,
        iter: &ast::Expr,
        body: &[ast::Stmt],
        location: Location,
    ) -> KernelResult<Vec<Stmt>> {
        let args = match &iter.kind {
            ExprKind::Call { args, keywords, .. }
                if keywords.is_empty() && self.builtin_name(iter).as_deref() == Some("range") =>
            {
                args
            }
            _ => {
                return Err(KernelError::translation(
                    location,
                    "for loops must iterate over range(...)",
                ))
            }
        };

        let (begin, end, step) = match args.len() {
            1 => (None, &args[0], 1),
            2 => (Some(&args[0]), &args[1], 1),
            3 => {
                let step = match args[2].kind {
                    ExprKind::Int(step) if step != 0 => step,
                    _ => {
                        return Err(KernelError::translation(
                            args[2].location,
                            "range step must be a non-zero integer literal",
                        ))
                    }
                };
                (Some(&args[0]), &args[1], step)
            }
            n => {
                return Err(KernelError::translation(
                    location,
                    format!("range takes 1 to 3 arguments, got {}", n),
                ))
            }
        };

        let (begin, begin_type) = match begin {
            Some(begin) => self.integer(begin)?,
            None => (Expr::int(0), DataType::Int32),
        };
        let (end, end_type) = self.integer(end)?;
        let dtype = begin_type.promote(end_type);

        self.push_block();
        self.declare(var, CType::Scalar(dtype), VarKind::Index);
        self.function().loop_depth += 1;
        let body = self.block(body);
        self.function().loop_depth -= 1;
        self.pop_block();

        Ok(vec![Stmt::For {
            var: var.to_string(),
            dtype,
            begin,
            end,
            step,
            body: body?,
        }])
    }

    // ---------------------------------------------------------------------
    // Hierarchical constructs

    fn nested_for(&mut self, args: &[ast::Expr], location: Location) -> KernelResult<Vec<Stmt>> {
        if args.len() != 2 {
            return Err(KernelError::translation(
                location,
                "parallel_for takes a range and a work function",
            ));
        }
        let range = self.nested_range(&args[0])?;
        let def = self.work_function(&args[1], 1)?;
        let index = self.index_decl(&def.params[0])?;
        let (mut pre, lambda) = self.lambda(&def, vec![(index, VarKind::Index)])?;
        pre.push(Stmt::Expr(Expr::call(
            Callee::Builtin(Builtin::ParallelFor),
            vec![range, Expr::Lambda(Box::new(lambda))],
        )));
        Ok(pre)
    }

    fn reduce_assign(
        &mut self,
        name: &str,
        annotation: Option<&TypeExpr>,
        value: &ast::Expr,
        location: Location,
    ) -> KernelResult<Vec<Stmt>> {
        let args = match &value.kind {
            ExprKind::Call { args, keywords, .. } if keywords.is_empty() && args.len() == 2 => args,
            _ => {
                return Err(KernelError::translation(
                    location,
                    "parallel_reduce takes a range and a work function",
                ))
            }
        };
        let range = self.nested_range(&args[0])?;
        let def = self.work_function(&args[1], 2)?;

        let declare = annotation.is_some() || self.declared_in_current(name).is_none();
        let (target, dtype) = if declare {
            let dtype = match annotation {
                Some(annotation) => resolve_type(annotation, location)?,
                None => match &def.params[1].annotation {
                    Some(TypeExpr::Generic { args, .. }) if !args.is_empty() => {
                        resolve_type(&args[0], location)?
                    }
                    _ => DataType::Float64,
                },
            };
            (Expr::decl_ref(name), dtype)
        } else {
            let dtype = self
                .lookup(name)
                .and_then(|(_, var)| value_type(&var.ty))
                .ok_or_else(|| KernelError::translation(location, format!("'{}' is not numeric", name)))?;
            (self.assignable(name, location)?, dtype)
        };

        let index = self.index_decl(&def.params[0])?;
        let partial = &def.params[1];
        if partial.annotation.is_some() && !is_accumulator_annotation(partial) {
            return Err(KernelError::translation(
                partial.location,
                format!("reduction parameter '{}' must be annotated Acc[T]", partial.name),
            ));
        }
        let partial = ParamDecl::new(
            CType::Reference(Box::new(CType::Scalar(dtype))),
            partial.name.clone(),
        );
        let (mut out, lambda) = self.lambda(
            &def,
            vec![(index, VarKind::Index), (partial, VarKind::Accumulator)],
        )?;

        if declare {
            self.declare(name, CType::Scalar(dtype), VarKind::Local);
            out.push(Stmt::decl(CType::Scalar(dtype), name, Init::None));
        }
        self.static_values.remove(name);
        out.push(Stmt::Expr(Expr::call(
            Callee::Builtin(Builtin::ParallelReduce),
            vec![range, Expr::Lambda(Box::new(lambda)), target],
        )));
        Ok(out)
    }

    fn single(&mut self, args: &[ast::Expr], location: Location) -> KernelResult<Vec<Stmt>> {
        if args.len() != 2 {
            return Err(KernelError::translation(
                location,
                "single takes PerTeam(member) or PerThread(member) and a work function",
            ));
        }
        let scope = match self.builtin_name(&args[0]).as_deref() {
            Some("PerTeam") => Scope::PerTeam,
            Some("PerThread") => Scope::PerThread,
            _ => {
                return Err(KernelError::translation(
                    args[0].location,
                    "single needs PerTeam(member) or PerThread(member)",
                ))
            }
        };
        let member = match &args[0].kind {
            ExprKind::Call { args, .. } if args.len() == 1 => self.member_ref(&args[0])?,
            _ => {
                return Err(KernelError::translation(
                    args[0].location,
                    format!("{} takes the team member", scope.name()),
                ))
            }
        };
        let def = self.work_function(&args[1], 0)?;
        let (mut out, lambda) = self.lambda(&def, vec![])?;
        out.push(Stmt::Expr(Expr::call(
            Callee::Builtin(Builtin::Single),
            vec![
                Expr::call(Callee::Builtin(Builtin::Scope(scope)), vec![member]),
                Expr::Lambda(Box::new(lambda)),
            ],
        )));
        Ok(out)
    }

    /// `TeamThreadRange(member, n)` or `TeamThreadRange(member, begin, end)`
    fn nested_range(&mut self, expr: &ast::Expr) -> KernelResult<Expr> {
        let kind = self
            .builtin_name(expr)
            .and_then(|name| RangeKind::from_name(&name))
            .ok_or_else(|| {
                KernelError::translation(
                    expr.location,
                    "expected TeamThreadRange, ThreadVectorRange or TeamVectorRange",
                )
            })?;
        let args = match &expr.kind {
            ExprKind::Call { args, .. } if (2..=3).contains(&args.len()) => args,
            _ => {
                return Err(KernelError::translation(
                    expr.location,
                    format!("{} takes the team member and one or two bounds", kind.name()),
                ))
            }
        };
        let mut out = vec![self.member_ref(&args[0])?];
        for bound in &args[1..] {
            out.push(self.integer(bound)?.0);
        }
        Ok(Expr::call(Callee::Builtin(Builtin::Range(kind)), out))
    }

    fn member_ref(&mut self, expr: &ast::Expr) -> KernelResult<Expr> {
        let name = expr.as_name().ok_or_else(|| {
            KernelError::translation(expr.location, "expected the team member")
        })?;
        match self.resolve(name) {
            Some((_, var)) if var.kind == VarKind::Member => Ok(Expr::decl_ref(name)),
            _ => Err(KernelError::translation(
                expr.location,
                format!("'{}' is not the team member", name),
            )),
        }
    }

    fn work_function(&self, expr: &ast::Expr, arity: usize) -> KernelResult<FunctionDef> {
        let name = expr.as_name().ok_or_else(|| {
            KernelError::translation(expr.location, "expected the name of a nested work function")
        })?;
        let def = self.lookup_def(name).ok_or_else(|| {
            KernelError::translation(expr.location, format!("unknown work function '{}'", name))
        })?;
        if def.params.len() != arity {
            return Err(KernelError::translation(
                def.location,
                format!(
                    "work function '{}' must take {} parameter(s), got {}",
                    name,
                    arity,
                    def.params.len()
                ),
            ));
        }
        Ok(def)
    }

    fn index_decl(&self, param: &ast::Param) -> KernelResult<ParamDecl> {
        if let Some(annotation) = &param.annotation {
            if !matches!(annotation.base_name(), "int" | "int32") {
                return Err(KernelError::translation(
                    param.location,
                    format!("index parameter '{}' must be an int", param.name),
                ));
            }
        }
        Ok(ParamDecl::new(CType::Scalar(DataType::Int32), param.name.clone()))
    }

    /// Translate a nested work function into a lambda
    ///
    /// Returns the statements that must precede the construct (pointer
    /// declarations for escaping `nonlocal` variables) and the lambda.
    fn lambda(
        &mut self,
        def: &FunctionDef,
        params: Vec<(ParamDecl, VarKind)>,
    ) -> KernelResult<(Vec<Stmt>, Lambda)> {
        let mut pre = Vec::new();
        let mut aliases = Vec::new();
        for (name, location) in collect_nonlocals(&def.body) {
            let (pointer, ty) = self.escape(&name, location, &mut pre)?;
            aliases.push((name, pointer, ty));
        }

        self.functions.push(FunctionScope::new());
        for (param, kind) in &params {
            self.declare(&param.name, param.ty.clone(), kind.clone());
        }
        for (name, pointer, ty) in aliases {
            self.declare(&name, ty, VarKind::Alias(pointer));
        }
        let body = self.statements(&def.body);
        let scope = self.functions.pop();
        let body = body?;

        let captures = scope.map(|s| s.captures.into_iter().collect()).unwrap_or_default();
        Ok((
            pre,
            Lambda {
                captures,
                params: params.into_iter().map(|(p, _)| p).collect(),
                body: Block::new(body),
            },
        ))
    }

    /// Give `name` an address a nested function can write through
    fn escape(
        &mut self,
        name: &str,
        location: Location,
        pre: &mut Vec<Stmt>,
    ) -> KernelResult<(String, CType)> {
        let current = self.current();
        let (depth, var) = self.resolve(name).ok_or_else(|| {
            KernelError::translation(
                location,
                format!("nonlocal '{}' has no binding in an enclosing function", name),
            )
        })?;
        match var.kind {
            VarKind::Alias(pointer) => {
                self.resolve(&pointer);
                Ok((pointer, var.ty))
            }
            VarKind::Local | VarKind::Accumulator if depth == current => {
                let dtype = value_type(&var.ty).ok_or_else(|| {
                    KernelError::translation(
                        location,
                        format!("only numeric variables can be declared nonlocal, '{}' is not", name),
                    )
                })?;
                let pointer = format!("__ref_{}", name);
                let pointer_type = CType::Pointer(Box::new(CType::Scalar(dtype)));
                let visible = matches!(
                    self.lookup(&pointer),
                    Some((d, v)) if d == current && v.kind == VarKind::Pointer
                );
                if !visible {
                    pre.push(Stmt::decl(
                        pointer_type.clone(),
                        pointer.clone(),
                        Init::Assign(Expr::unary(UnaryOp::AddressOf, Expr::decl_ref(name))),
                    ));
                    self.declare(&pointer, pointer_type, VarKind::Pointer);
                }
                self.static_values.remove(name);
                Ok((pointer, CType::Scalar(dtype)))
            }
            VarKind::Local | VarKind::Accumulator => Err(KernelError::translation(
                location,
                format!("nonlocal '{}' must name a variable of the directly enclosing function", name),
            )),
            _ => Err(KernelError::translation(
                location,
                format!("'{}' cannot be declared nonlocal", name),
            )),
        }
    }

    fn scratch_decl(
        &mut self,
        name: &str,
        annotation: Option<&TypeExpr>,
        value: Option<&ast::Expr>,
        location: Location,
    ) -> KernelResult<Vec<Stmt>> {
        let value = value.ok_or_else(|| {
            KernelError::translation(location, format!("scratch view '{}' needs an initializer", name))
        })?;
        let (func, args) = match &value.kind {
            ExprKind::Call { func, args, keywords } if keywords.is_empty() => (func, args),
            _ => {
                return Err(KernelError::translation(
                    location,
                    format!("scratch view '{}' must be created with ScratchViewND(...)", name),
                ))
            }
        };

        // `ScratchView1D(...)` or `ScratchView1D[T](...)`
        let (ctor, ctor_type) = match &func.kind {
            ExprKind::Subscript { value, indices } if indices.len() == 1 => {
                let element = indices[0].dotted_path().ok_or_else(|| {
                    KernelError::translation(location, "expected an element type")
                })?;
                (value.dotted_path(), Some(DataType::resolve(&element)?))
            }
            _ => (func.dotted_path(), None),
        };
        let ctor = ctor.unwrap_or_default();
        let rank = scratch_rank(ctor.rsplit('.').next().unwrap_or(&ctor)).ok_or_else(|| {
            KernelError::translation(location, format!("scratch view '{}' must be created with ScratchViewND(...)", name))
        })?;

        let annotated = match annotation {
            Some(annotation) => {
                if scratch_rank(annotation.base_name()) != Some(rank) {
                    return Err(KernelError::translation(
                        location,
                        format!("'{}' is annotated {} but created as {}", name, annotation, ctor),
                    ));
                }
                match annotation {
                    TypeExpr::Generic { args, .. } if !args.is_empty() => {
                        Some(DataType::resolve(&args[0].to_string())?)
                    }
                    _ => None,
                }
            }
            None => None,
        };
        let dtype = annotated.or(ctor_type).ok_or_else(|| {
            KernelError::type_error(format!("element type of scratch view '{}' is unspecified", name))
        })?;

        if args.len() != rank + 1 {
            return Err(KernelError::translation(
                location,
                format!("{} takes a scratch handle and {} extent(s)", ctor, rank),
            ));
        }
        let (member, level, scope) = self.scratch_handle(&args[0])?;
        let mut extents = Vec::with_capacity(rank);
        for extent in &args[1..] {
            extents.push(self.integer(extent)?.0);
        }

        if self.declared_in_current(name).is_some() {
            return Err(KernelError::translation(location, format!("'{}' is already declared", name)));
        }
        let ty = CType::ScratchView { dtype, rank };
        self.declare(name, ty.clone(), VarKind::Local);

        let requirement = ScratchRequirement {
            level,
            scope,
            dtype,
            extents: extents
                .iter()
                .map(|e| self.static_value(e).unwrap_or_else(|| e.clone()))
                .collect(),
            unconditional: self.at_kernel_top_level(),
        };
        self.scratch.push(requirement);

        let method = match scope {
            Scope::PerTeam => Method::TeamScratch,
            Scope::PerThread => Method::ThreadScratch,
        };
        let mut ctor_args = vec![Expr::method(member, method, vec![Expr::int(level as i64)])];
        ctor_args.extend(extents);
        Ok(vec![Stmt::decl(ty, name, Init::Construct(ctor_args))])
    }

    /// `member.team_scratch(level)` or `member.thread_scratch(level)`
    fn scratch_handle(&mut self, expr: &ast::Expr) -> KernelResult<(String, usize, Scope)> {
        let invalid = || {
            KernelError::translation(
                expr.location,
                "expected team_member.team_scratch(level) or team_member.thread_scratch(level)",
            )
        };
        let (func, args) = match &expr.kind {
            ExprKind::Call { func, args, .. } => (func, args),
            _ => return Err(invalid()),
        };
        let (receiver, attr) = match &func.kind {
            ExprKind::Attribute { value, attr } => (value, attr),
            _ => return Err(invalid()),
        };
        let scope = match attr.as_str() {
            "team_scratch" => Scope::PerTeam,
            "thread_scratch" => Scope::PerThread,
            _ => return Err(invalid()),
        };
        let level = match args.as_slice() {
            [arg] => match arg.kind {
                ExprKind::Int(level) if (0..SCRATCH_LEVELS as i64).contains(&level) => level as usize,
                _ => {
                    return Err(KernelError::translation(
                        arg.location,
                        "scratch level must be the literal 0 or 1",
                    ))
                }
            },
            _ => return Err(invalid()),
        };
        self.member_ref(receiver)?;
        let member = receiver.as_name().unwrap_or_default().to_string();
        Ok((member, level, scope))
    }

    // ---------------------------------------------------------------------
    // Expressions

    /// Name of a library call (`pk.single`, `range`), unless the callee is a
    /// variable or a nested work function
    fn builtin_name(&self, expr: &ast::Expr) -> Option<String> {
        let func = match &expr.kind {
            ExprKind::Call { func, .. } => func,
            _ => return None,
        };
        let func = match &func.kind {
            ExprKind::Subscript { value, .. } => value,
            _ => func,
        };
        let path = func.dotted_path()?;
        let root = path.split('.').next().unwrap_or(&path);
        if self.lookup(root).is_some() || self.lookup_def(root).is_some() {
            return None;
        }
        path.rsplit('.').next().map(str::to_string)
    }

    fn value(&mut self, expr: &ast::Expr) -> KernelResult<(Expr, DataType)> {
        let (translated, ty) = self.expr(expr)?;
        match value_type(&ty) {
            Some(dtype) => Ok((translated, dtype)),
            None if ty == CType::Void => Err(KernelError::translation(
                expr.location,
                "expression has no value",
            )),
            None => Err(KernelError::translation(expr.location, "expected a numeric value")),
        }
    }

    fn integer(&mut self, expr: &ast::Expr) -> KernelResult<(Expr, DataType)> {
        let (translated, dtype) = self.value(expr)?;
        if !dtype.is_integer() {
            return Err(KernelError::translation(
                expr.location,
                format!("expected an integer, found {}", dtype),
            ));
        }
        Ok((translated, dtype))
    }

    fn expr(&mut self, expr: &ast::Expr) -> KernelResult<(Expr, CType)> {
        let location = expr.location;
        match &expr.kind {
            ExprKind::Int(value) => {
                let dtype = if i32::try_from(*value).is_ok() {
                    DataType::Int32
                } else {
                    DataType::Int64
                };
                Ok((Expr::int(*value), CType::Scalar(dtype)))
            }
            ExprKind::Float(value) => Ok((Expr::float(*value), CType::Scalar(DataType::Float64))),
            ExprKind::Bool(value) => Ok((Expr::bool(*value), CType::Scalar(DataType::Bool))),
            ExprKind::Str(_) => Err(KernelError::translation(
                location,
                "string literals are not supported in kernels",
            )),
            ExprKind::NoneLit => Err(KernelError::translation(location, "'None' is not supported in kernels")),
            ExprKind::Name(name) => self.name_ref(name, location),
            ExprKind::Binary { op, lhs, rhs } => {
                let lhs = self.value(lhs)?;
                let rhs = self.value(rhs)?;
                let (expr, dtype) = self.binary(*op, lhs, rhs, location)?;
                Ok((expr, CType::Scalar(dtype)))
            }
            ExprKind::Unary { op, operand } => {
                let (operand, dtype) = self.value(operand)?;
                let (op, dtype) = match op {
                    ast::UnaryOp::Neg => (UnaryOp::Neg, dtype.promote(DataType::Bool)),
                    ast::UnaryOp::Pos => (UnaryOp::Plus, dtype.promote(DataType::Bool)),
                    ast::UnaryOp::Not => (UnaryOp::Not, DataType::Bool),
                    ast::UnaryOp::Invert if dtype.is_integer() => (UnaryOp::BitNot, dtype.promote(DataType::Bool)),
                    ast::UnaryOp::Invert => {
                        return Err(KernelError::translation(location, "'~' requires an integer operand"))
                    }
                };
                Ok((Expr::unary(op, operand), CType::Scalar(dtype)))
            }
            ExprKind::Call {
                func,
                args,
                keywords,
            } => {
                if !keywords.is_empty() {
                    return Err(KernelError::translation(location, "keyword arguments are not supported"));
                }
                self.call(expr, func, args)
            }
            ExprKind::Attribute { .. } => Err(KernelError::translation(
                location,
                format!(
                    "attribute '{}' is not supported outside a call",
                    expr.dotted_path().unwrap_or_default()
                ),
            )),
            ExprKind::Subscript { .. } => {
                let (access, dtype) = self.view_element(expr)?;
                Ok((access, CType::Scalar(dtype)))
            }
            ExprKind::Tuple(_) => Err(KernelError::translation(location, "tuples are not supported in kernels")),
        }
    }

    fn name_ref(&mut self, name: &str, location: Location) -> KernelResult<(Expr, CType)> {
        if let Some((_, var)) = self.resolve(name) {
            return Ok(match var.kind {
                VarKind::Alias(pointer) => {
                    self.resolve(&pointer);
                    (Expr::unary(UnaryOp::Deref, Expr::decl_ref(pointer)), var.ty)
                }
                _ => (Expr::decl_ref(name), var.ty),
            });
        }
        if let Some(value) = self.kernel.captures().get(name) {
            return Ok((Expr::Literal(*value), CType::Scalar(value.dtype())));
        }
        if self.lookup_def(name).is_some() {
            return Err(KernelError::translation(
                location,
                format!(
                    "work function '{}' can only be passed to parallel_for, parallel_reduce or single",
                    name
                ),
            ));
        }
        Err(KernelError::translation(location, format!("unknown name '{}'", name)))
    }

    fn binary(
        &mut self,
        op: BinOp,
        (lhs, lhs_type): (Expr, DataType),
        (rhs, rhs_type): (Expr, DataType),
        location: Location,
    ) -> KernelResult<(Expr, DataType)> {
        let promoted = lhs_type.promote(rhs_type);
        let both_int = !lhs_type.is_float() && !rhs_type.is_float();
        let native = |op| Expr::binary(op, lhs.clone(), rhs.clone());
        let result = match op {
            BinOp::And => (native(BinaryOp::LogicalAnd), DataType::Bool),
            BinOp::Or => (native(BinaryOp::LogicalOr), DataType::Bool),
            BinOp::Eq => (native(BinaryOp::Eq), DataType::Bool),
            BinOp::Ne => (native(BinaryOp::Ne), DataType::Bool),
            BinOp::Lt => (native(BinaryOp::Lt), DataType::Bool),
            BinOp::Le => (native(BinaryOp::Le), DataType::Bool),
            BinOp::Gt => (native(BinaryOp::Gt), DataType::Bool),
            BinOp::Ge => (native(BinaryOp::Ge), DataType::Bool),
            BinOp::Add => (native(BinaryOp::Add), promoted),
            BinOp::Sub => (native(BinaryOp::Sub), promoted),
            BinOp::Mul => (native(BinaryOp::Mul), promoted),
            BinOp::Div if both_int => (
                Expr::binary(
                    BinaryOp::Div,
                    Expr::cast(DataType::Float64, lhs.clone()),
                    Expr::cast(DataType::Float64, rhs.clone()),
                ),
                DataType::Float64,
            ),
            BinOp::Div => (native(BinaryOp::Div), promoted),
            BinOp::FloorDiv if both_int => (native(BinaryOp::Div), promoted),
            BinOp::FloorDiv => (
                Expr::call(
                    Callee::Builtin(Builtin::Math(MathFunction::Floor)),
                    vec![native(BinaryOp::Div)],
                ),
                promoted,
            ),
            BinOp::Mod if both_int => (native(BinaryOp::Rem), promoted),
            BinOp::Mod => {
                return Err(KernelError::translation(location, "'%' requires integer operands"))
            }
            BinOp::Pow => {
                let dtype = if both_int { DataType::Float64 } else { promoted };
                (
                    Expr::call(
                        Callee::Builtin(Builtin::Math(MathFunction::Pow)),
                        vec![to_float(lhs.clone(), lhs_type), to_float(rhs.clone(), rhs_type)],
                    ),
                    dtype,
                )
            }
            BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl | BinOp::Shr => {
                if !lhs_type.is_integer() || !rhs_type.is_integer() {
                    return Err(KernelError::translation(
                        location,
                        "bitwise operators require integer operands",
                    ));
                }
                let op = match op {
                    BinOp::BitAnd => BinaryOp::BitAnd,
                    BinOp::BitOr => BinaryOp::BitOr,
                    BinOp::BitXor => BinaryOp::BitXor,
                    BinOp::Shl => BinaryOp::Shl,
                    _ => BinaryOp::Shr,
                };
                (native(op), promoted)
            }
        };
        Ok(result)
    }

    fn call(
        &mut self,
        expr: &ast::Expr,
        func: &ast::Expr,
        args: &[ast::Expr],
    ) -> KernelResult<(Expr, CType)> {
        let location = expr.location;

        if let ExprKind::Attribute { value, attr } = &func.kind {
            if let Some(receiver) = value.as_name() {
                if self.lookup(receiver).is_some() {
                    return self.method_call(receiver, attr, args, location);
                }
            }
        }

        let name = match self.builtin_name(expr) {
            Some(name) => name,
            None => {
                let shown = func.dotted_path().unwrap_or_default();
                return Err(KernelError::translation(
                    location,
                    match self.lookup_def(&shown) {
                        Some(_) => format!(
                            "work function '{}' can only be passed to parallel_for, parallel_reduce or single",
                            shown
                        ),
                        None => format!("'{}' is not callable", shown),
                    },
                ));
            }
        };

        if let Some(math) = MathFunction::from_name(&name) {
            return self.math_call(math, args, location);
        }
        if let Some(dtype) = DataType::from_name(&name) {
            if args.len() != 1 {
                return Err(KernelError::translation(location, format!("{}() takes one argument", name)));
            }
            let (operand, _) = self.value(&args[0])?;
            return Ok((Expr::cast(dtype, operand), CType::Scalar(dtype)));
        }
        match name.as_str() {
            "lower_bound" | "upper_bound" => self.search_call(&name, args, location),
            "inclusive_scan" => self.scan_call(args, location),
            "parallel_for" | "parallel_reduce" | "single" => Err(KernelError::translation(
                location,
                format!("'{}' must be used as a statement", name),
            )),
            "range" => Err(KernelError::translation(
                location,
                "'range' is only supported as the iterable of a for loop",
            )),
            other if scratch_rank(other).is_some() => Err(KernelError::translation(
                location,
                "scratch views must be created in a declaration",
            )),
            other => Err(KernelError::translation(location, format!("unsupported call '{}'", other))),
        }
    }

    fn method_call(
        &mut self,
        receiver: &str,
        attr: &str,
        args: &[ast::Expr],
        location: Location,
    ) -> KernelResult<(Expr, CType)> {
        let unsupported = || {
            KernelError::translation(location, format!("unsupported call '{}.{}'", receiver, attr))
        };
        let method = Method::from_name(attr).ok_or_else(unsupported)?;
        let (_, var) = self.resolve(receiver).ok_or_else(unsupported)?;

        if var.kind == VarKind::Member && method.on_team() {
            if matches!(method, Method::TeamScratch | Method::ThreadScratch) {
                return Err(KernelError::translation(
                    location,
                    format!("{}() may only initialize a scratch view", attr),
                ));
            }
            if !args.is_empty() {
                return Err(KernelError::translation(location, format!("{}() takes no arguments", attr)));
            }
            let ty = if method == Method::TeamBarrier {
                CType::Void
            } else {
                CType::Scalar(DataType::Int32)
            };
            return Ok((Expr::method(receiver, method, vec![]), ty));
        }

        if let (Method::Extent, Some(rank)) = (method, var.ty.rank()) {
            if args.len() != 1 {
                return Err(KernelError::translation(location, "extent() takes one dimension"));
            }
            if let ExprKind::Int(dim) = args[0].kind {
                if dim < 0 || dim as usize >= rank {
                    return Err(KernelError::translation(
                        location,
                        format!("dimension {} is out of range for rank-{} view '{}'", dim, rank, receiver),
                    ));
                }
            }
            let (dim, _) = self.integer(&args[0])?;
            return Ok((
                Expr::cast(DataType::Int32, Expr::method(receiver, Method::Extent, vec![dim])),
                CType::Scalar(DataType::Int32),
            ));
        }

        Err(unsupported())
    }

    fn math_call(
        &mut self,
        math: MathFunction,
        args: &[ast::Expr],
        location: Location,
    ) -> KernelResult<(Expr, CType)> {
        if args.len() != math.arity() {
            return Err(KernelError::translation(
                location,
                format!("{}() takes {} argument(s), got {}", math.name(), math.arity(), args.len()),
            ));
        }
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.value(arg)?);
        }
        let callee = Callee::Builtin(Builtin::Math(math));

        let (args, dtype) = match math {
            MathFunction::Abs => {
                let (arg, dtype) = values.remove(0);
                (vec![arg], dtype.promote(DataType::Bool))
            }
            MathFunction::Min | MathFunction::Max => {
                let dtype = values[0].1.promote(values[1].1);
                let args = values
                    .into_iter()
                    .map(|(arg, t)| if t == dtype { arg } else { Expr::cast(dtype, arg) })
                    .collect();
                (args, dtype)
            }
            _ => {
                let all_float32 = values.iter().all(|(_, t)| *t == DataType::Float32);
                let dtype = if all_float32 { DataType::Float32 } else { DataType::Float64 };
                let args = values.into_iter().map(|(arg, t)| to_float(arg, t)).collect();
                (args, dtype)
            }
        };
        Ok((Expr::call(callee, args), CType::Scalar(dtype)))
    }

    fn search_call(
        &mut self,
        name: &str,
        args: &[ast::Expr],
        location: Location,
    ) -> KernelResult<(Expr, CType)> {
        if args.len() != 3 {
            return Err(KernelError::translation(
                location,
                format!("{}() takes a view, a size and a value", name),
            ));
        }
        let view = self.view_ref(&args[0])?;
        let (size, _) = self.integer(&args[1])?;
        let (value, _) = self.value(&args[2])?;
        self.use_helper(name, location)?;
        Ok((
            Expr::call(Callee::Function(name.to_string()), vec![view, size, value]),
            CType::Scalar(DataType::Int32),
        ))
    }

    fn scan_call(&mut self, args: &[ast::Expr], location: Location) -> KernelResult<(Expr, CType)> {
        if !(2..=3).contains(&args.len()) {
            return Err(KernelError::translation(
                location,
                "inclusive_scan() takes the team member, a view and an optional size",
            ));
        }
        let member = self.member_ref(&args[0])?;
        let view = self.view_ref(&args[1])?;
        let size = match args.get(2) {
            Some(size) => self.integer(size)?.0,
            None => Expr::int(-1),
        };
        self.use_helper("inclusive_scan", location)?;
        Ok((
            Expr::call(Callee::Function("inclusive_scan".to_string()), vec![member, view, size]),
            CType::Void,
        ))
    }

    fn use_helper(&mut self, name: &str, location: Location) -> KernelResult<()> {
        if !self.helpers.contains_key(name) {
            let helper = algorithms::helper(name).ok_or_else(|| {
                KernelError::translation(location, format!("unknown algorithm '{}'", name))
            })?;
            self.helpers.insert(name.to_string(), helper);
        }
        Ok(())
    }

    /// A rank-1 view passed by name
    fn view_ref(&mut self, expr: &ast::Expr) -> KernelResult<Expr> {
        let name = expr.as_name().ok_or_else(|| {
            KernelError::translation(expr.location, "expected the name of a view")
        })?;
        match self.resolve(name) {
            Some((_, var)) if var.ty.rank() == Some(1) => Ok(Expr::decl_ref(name)),
            Some(_) => Err(KernelError::translation(
                expr.location,
                format!("'{}' is not a rank-1 view", name),
            )),
            None => Err(KernelError::translation(expr.location, format!("unknown name '{}'", name))),
        }
    }

    /// `v[i, j]` or `v[i][j]` as a full-rank element access
    fn view_element(&mut self, expr: &ast::Expr) -> KernelResult<(Expr, DataType)> {
        let mut groups = Vec::new();
        let mut base = expr;
        while let ExprKind::Subscript { value, indices } = &base.kind {
            groups.push(indices);
            base = value;
        }
        let name = base.as_name().ok_or_else(|| {
            KernelError::translation(expr.location, "only named views can be indexed")
        })?;
        let (_, var) = self
            .resolve(name)
            .ok_or_else(|| KernelError::translation(expr.location, format!("unknown name '{}'", name)))?;
        let (rank, dtype) = match (var.ty.rank(), var.ty.element()) {
            (Some(rank), Some(dtype)) => (rank, dtype),
            _ => {
                return Err(KernelError::translation(
                    expr.location,
                    format!("'{}' is not a view", name),
                ))
            }
        };

        let indices: Vec<&ast::Expr> = groups.into_iter().rev().flatten().collect();
        if indices.len() != rank {
            return Err(KernelError::translation(
                expr.location,
                format!(
                    "view '{}' has rank {} but is indexed with {} index(es)",
                    name,
                    rank,
                    indices.len()
                ),
            ));
        }
        let mut translated = Vec::with_capacity(rank);
        for index in indices {
            translated.push(self.integer(index)?.0);
        }
        Ok((Expr::view_access(name, translated), dtype))
    }

    /// The expression with kernel-level locals substituted, when it only
    /// depends on literals, scalar arguments and team sizes
    fn static_value(&self, expr: &Expr) -> Option<Expr> {
        match expr {
            Expr::Literal(_) => Some(expr.clone()),
            Expr::DeclRef(name) => {
                if let Some(value) = self.static_values.get(name) {
                    return Some(value.clone());
                }
                match self.lookup(name) {
                    Some((0, var)) if var.kind == VarKind::Argument && var.ty.scalar().is_some() => {
                        Some(expr.clone())
                    }
                    _ => None,
                }
            }
            Expr::Binary { op, lhs, rhs }
                if matches!(
                    op,
                    BinaryOp::Add
                        | BinaryOp::Sub
                        | BinaryOp::Mul
                        | BinaryOp::Div
                        | BinaryOp::Rem
                        | BinaryOp::Shl
                        | BinaryOp::Shr
                ) =>
            {
                Some(Expr::binary(*op, self.static_value(lhs)?, self.static_value(rhs)?))
            }
            Expr::Unary {
                op: op @ (UnaryOp::Neg | UnaryOp::Plus),
                operand,
            } => Some(Expr::unary(*op, self.static_value(operand)?)),
            Expr::Cast { dtype, operand } => Some(Expr::cast(*dtype, self.static_value(operand)?)),
            Expr::Call {
                callee:
                    Callee::Method {
                        method: Method::TeamSize | Method::LeagueSize,
                        ..
                    },
                ..
            } => Some(expr.clone()),
            Expr::Call {
                callee: callee @ Callee::Builtin(Builtin::Math(MathFunction::Min | MathFunction::Max)),
                args,
            } => {
                let args = args
                    .iter()
                    .map(|a| self.static_value(a))
                    .collect::<Option<Vec<_>>>()?;
                Some(Expr::call(callee.clone(), args))
            }
            _ => None,
        }
    }
}

/// Numeric type of a scalar or reference-to-scalar
fn value_type(ty: &CType) -> Option<DataType> {
    match ty {
        CType::Scalar(dtype) => Some(*dtype),
        CType::Reference(inner) => inner.scalar(),
        _ => None,
    }
}

fn to_float(expr: Expr, dtype: DataType) -> Expr {
    if dtype.is_float() {
        expr
    } else {
        Expr::cast(DataType::Float64, expr)
    }
}

fn resolve_type(annotation: &TypeExpr, location: Location) -> KernelResult<DataType> {
    DataType::from_name(annotation.name()).ok_or_else(|| {
        KernelError::translation(location, format!("'{}' is not a scalar type", annotation))
    })
}

/// Rank of `ScratchView1D` .. `ScratchView3D`
fn scratch_rank(name: &str) -> Option<usize> {
    match name {
        "ScratchView1D" => Some(1),
        "ScratchView2D" => Some(2),
        "ScratchView3D" => Some(3),
        _ => None,
    }
}

/// `View`, `View1D[T]` .. `View8D[T]` against the bound view
fn check_view_annotation(
    param: &ast::Param,
    annotation: &TypeExpr,
    bound: ViewType,
) -> KernelResult<()> {
    let base = annotation.base_name();
    let rank = match base {
        "View" => None,
        _ => base
            .strip_prefix("View")
            .and_then(|rest| rest.strip_suffix('D'))
            .and_then(|digits| digits.parse::<usize>().ok()),
    };
    let mismatch = || {
        KernelError::translation(
            param.location,
            format!(
                "parameter '{}' is annotated {} but bound to a rank-{} {} view",
                param.name, annotation, bound.rank, bound.dtype
            ),
        )
    };
    if base != "View" && rank.is_none() {
        return Err(mismatch());
    }
    if rank.map(|r| r != bound.rank).unwrap_or(false) {
        return Err(mismatch());
    }
    if let TypeExpr::Generic { args, .. } = annotation {
        if let Some(element) = args.first() {
            if DataType::element_from_name(element.base_name()) != Some(bound.dtype) {
                return Err(mismatch());
            }
        }
    }
    Ok(())
}

/// Names declared `nonlocal` in a function body, outside nested functions
fn collect_nonlocals(body: &[ast::Stmt]) -> Vec<(String, Location)> {
    fn collect(body: &[ast::Stmt], out: &mut Vec<(String, Location)>) {
        for stmt in body {
            match &stmt.kind {
                StmtKind::Nonlocal(names) => {
                    for name in names {
                        if !out.iter().any(|(n, _)| n == name) {
                            out.push((name.clone(), stmt.location));
                        }
                    }
                }
                StmtKind::If { then, orelse, .. } => {
                    collect(then, out);
                    collect(orelse, out);
                }
                StmtKind::While { body, .. } | StmtKind::For { body, .. } => collect(body, out),
                _ => {}
            }
        }
    }
    let mut out = Vec::new();
    collect(body, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cppast::{walk_block, Visitor};
    use crate::error::ErrorKind;
    use crate::kernel::{Accumulator, Args};
    use crate::policy::ExecutionSpace;
    use crate::view::View;

    fn spec(args: &Args, acc: Option<&Accumulator>, policy: PolicyKind) -> Specialization {
        Specialization::new(args, acc, policy, ExecutionSpace::OpenMp)
    }

    fn view(dtype: DataType, extents: &[usize]) -> View {
        View::new(dtype, extents).unwrap()
    }

    #[derive(Default)]
    struct Decls(Vec<String>);

    impl Visitor for Decls {
        fn visit_stmt(&mut self, stmt: &Stmt) {
            if let Stmt::Decl(decl) = stmt {
                self.0.push(decl.name.clone());
            }
        }
    }

    #[test]
    fn test_float_element_type_is_single_precision() {
        let source = "\
def k(team_member, x: View1D[pk.float], y: View1D[double], n: int):
    s: ScratchView1D[float] = ScratchView1D(team_member.team_scratch(0), n)
    scale: float = 0.5
    s[0] = x[0] * scale
    y[0] = s[0]
";
        let kernel = Kernel::new(source).unwrap();
        let x = view(DataType::Float32, &[4]);
        let y = view(DataType::Float64, &[4]);
        let args = Args::new().view("x", &x).view("y", &y).scalar("n", 4);
        let unit = translate(&kernel, &spec(&args, None, PolicyKind::Team)).unwrap();
        assert_eq!(unit.scratch[0].dtype, DataType::Float32);

        let err = translate(&kernel, &spec(&Args::new().view("x", &y).view("y", &y).scalar("n", 4), None, PolicyKind::Team))
            .unwrap_err();
        assert!(err.to_string().contains("parameter 'x'"), "{}", err);
    }

    #[test]
    fn test_range_kernel() {
        let kernel = Kernel::new(
            "def scale(i: int, x: View1D[double], y: View1D[double], n: int):\n    half = n / 2\n    y[i] = x[i] * half\n",
        )
        .unwrap();
        let x = view(DataType::Float64, &[8]);
        let args = Args::new().view("x", &x).view("y", &x).scalar("n", 8);
        let unit = translate(&kernel, &spec(&args, None, PolicyKind::Range)).unwrap();

        assert_eq!(unit.kernel.params.len(), 4);
        assert_eq!(unit.kernel.params[0].role, ParamRole::Index);
        assert_eq!(
            unit.kernel.body.stmts[0],
            Stmt::decl(
                CType::Scalar(DataType::Float64),
                "half",
                Init::Assign(Expr::binary(
                    BinaryOp::Div,
                    Expr::cast(DataType::Float64, Expr::decl_ref("n")),
                    Expr::cast(DataType::Float64, Expr::int(2)),
                )),
            )
        );
        assert!(unit.helpers.is_empty());
    }

    #[test]
    fn test_chained_indexing_is_flattened() {
        let kernel = Kernel::new("def k(i: int, a: View2D[double]):\n    a[i][1] = a[i, 0]\n").unwrap();
        let a = view(DataType::Float64, &[4, 2]);
        let args = Args::new().view("a", &a);
        let unit = translate(&kernel, &spec(&args, None, PolicyKind::Range)).unwrap();
        assert_eq!(
            unit.kernel.body.stmts[0],
            Stmt::Expr(Expr::assign(
                Expr::view_access("a", vec![Expr::decl_ref("i"), Expr::int(1)]),
                Expr::view_access("a", vec![Expr::decl_ref("i"), Expr::int(0)]),
            ))
        );
    }

    #[test]
    fn test_nonlocal_escapes_through_pointer() {
        let source = "\
def k(team_member: TeamMember, acc: Acc[float], x: View1D[double]):
    total: float = 0.0
    def add():
        nonlocal total
        total += x[team_member.league_rank()]
    single(PerTeam(team_member), add)
    acc += total
";
        let kernel = Kernel::new(source).unwrap();
        let x = view(DataType::Float64, &[4]);
        let args = Args::new().view("x", &x);
        let acc = Accumulator::from(0.0);
        let unit = translate(&kernel, &spec(&args, Some(&acc), PolicyKind::Team)).unwrap();

        let body = &unit.kernel.body.stmts;
        assert_eq!(
            body[1],
            Stmt::decl(
                CType::Pointer(Box::new(CType::Scalar(DataType::Float64))),
                "__ref_total",
                Init::Assign(Expr::unary(UnaryOp::AddressOf, Expr::decl_ref("total"))),
            )
        );
        let lambda = match &body[2] {
            Stmt::Expr(Expr::Call { args, .. }) => match &args[1] {
                Expr::Lambda(lambda) => lambda,
                other => panic!("expected a lambda, got {:?}", other),
            },
            other => panic!("expected single(...), got {:?}", other),
        };
        assert_eq!(lambda.captures, vec!["__ref_total", "team_member", "x"]);
        match &lambda.body.stmts[0] {
            Stmt::Expr(Expr::Assign { target, .. }) => {
                assert_eq!(**target, Expr::unary(UnaryOp::Deref, Expr::decl_ref("__ref_total")));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_outer_assignment_requires_nonlocal() {
        let source = "\
def k(team_member, x: View1D[double]):
    total: float = 0.0
    def add():
        total = 1.0
    single(PerTeam(team_member), add)
";
        let kernel = Kernel::new(source).unwrap();
        let x = view(DataType::Float64, &[4]);
        let args = Args::new().view("x", &x);
        let err = translate(&kernel, &spec(&args, None, PolicyKind::Team)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Translation);
        assert_eq!(err.location().map(|l| l.line), Some(4));
        assert!(err.to_string().contains("nonlocal"));
    }

    #[test]
    fn test_unsupported_constructs() {
        let x = view(DataType::Float64, &[4]);
        let args = Args::new().view("x", &x);
        for (source, line) in [
            ("def k(i: int, x):\n    print(x[i])\n", 2),
            ("def k(i: int, x):\n    y = x\n", 2),
            ("def k(i: int, x):\n    x[i] = 1.0\n    i = 2\n", 3),
            ("def k(i: int, x):\n    x[i] = x[i, 0]\n", 2),
            ("def k(i: int, x):\n    x[i] = 1.0 % 2.0\n", 2),
        ] {
            let kernel = Kernel::new(source).unwrap();
            let err = translate(&kernel, &spec(&args, None, PolicyKind::Range)).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Translation, "{}", source);
            assert_eq!(err.location().map(|l| l.line), Some(line), "{}", source);
        }
    }

    #[test]
    fn test_team_kernel_records_scratch() {
        let source = "\
def yAx(team_member, acc: Acc[float], y, x, A, M: int, N: int):
    e: int = team_member.league_rank()
    s_x: ScratchView1D[double] = ScratchView1D(team_member.team_scratch(0), M)

    def init_scratch(i: int):
        s_x[i] = x[e][i]

    if team_member.team_rank() == 0:
        parallel_for(ThreadVectorRange(team_member, M), init_scratch)

    team_member.team_barrier()

    def team_reduce(j: int, team_acc: Acc[float]):
        def vector_reduce(i: int, vector_acc: Acc[float]):
            vector_acc += A[e][j][i] * s_x[i]

        tempM: float = parallel_reduce(ThreadVectorRange(team_member, M), vector_reduce)
        team_acc += y[e][j] * tempM

    tempN: float = parallel_reduce(TeamThreadRange(team_member, N), team_reduce)

    def single_closure():
        nonlocal acc
        acc += tempN

    single(PerTeam(team_member), single_closure)
";
        let kernel = Kernel::new(source).unwrap();
        let y = view(DataType::Float64, &[2, 3]);
        let x = view(DataType::Float64, &[2, 4]);
        let a = view(DataType::Float64, &[2, 3, 4]);
        let args = Args::new()
            .view("y", &y)
            .view("x", &x)
            .view("A", &a)
            .scalar("M", 4)
            .scalar("N", 3);
        let acc = Accumulator::from(0.0);
        let unit = translate(&kernel, &spec(&args, Some(&acc), PolicyKind::Team)).unwrap();

        assert_eq!(unit.scratch.len(), 1);
        let requirement = &unit.scratch[0];
        assert_eq!((requirement.level, requirement.scope), (0, Scope::PerTeam));
        assert_eq!(requirement.extents, vec![Expr::decl_ref("M")]);
        assert!(requirement.unconditional);
        assert_eq!(unit.kernel.accumulator(), Some(("acc", DataType::Float64)));

        let mut decls = Decls::default();
        walk_block(&mut decls, &unit.kernel.body);
        assert!(decls.0.contains(&"tempM".to_string()));
        assert!(decls.0.contains(&"__ref_acc".to_string()));
    }

    #[test]
    fn test_team_size_extent_is_static() {
        let source = "\
def scan(team_member, view: View1D[int]):
    n: int = team_member.team_size()
    scratch: ScratchView1D[int] = ScratchView1D(team_member.team_scratch(0), n)
    scratch[team_member.team_rank()] = view[team_member.team_rank()]
    inclusive_scan(team_member, scratch)
";
        let kernel = Kernel::new(source).unwrap();
        let v = view(DataType::Int32, &[8]);
        let args = Args::new().view("view", &v);
        let unit = translate(&kernel, &spec(&args, None, PolicyKind::Team)).unwrap();
        assert_eq!(
            unit.scratch[0].extents,
            vec![Expr::method("team_member", Method::TeamSize, vec![])]
        );
        assert_eq!(unit.helpers.len(), 1);
        assert_eq!(unit.helpers[0].name, "inclusive_scan");
    }

    #[test]
    fn test_search_helpers_are_shared() {
        let source = "\
def k(i: int, view: View1D[int], out: View1D[int]):
    out[i] = upper_bound(view, 10, i) - lower_bound(view, 10, i)
";
        let kernel = Kernel::new(source).unwrap();
        let v = view(DataType::Int32, &[10]);
        let args = Args::new().view("view", &v).view("out", &v);
        let unit = translate(&kernel, &spec(&args, None, PolicyKind::Range)).unwrap();
        let names: Vec<_> = unit.helpers.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["lower_bound", "upper_bound"]);
    }

    #[test]
    fn test_signature_checks() {
        let x = view(DataType::Float32, &[4]);
        let args = Args::new().view("x", &x);

        let kernel = Kernel::new("def k(i: int, x: View1D[float64]):\n    pass\n").unwrap();
        let err = translate(&kernel, &spec(&args, None, PolicyKind::Range)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Translation);

        let kernel = Kernel::new("def k(i: int, acc: Acc[float], x):\n    acc += x[i]\n").unwrap();
        let err = translate(&kernel, &spec(&args, None, PolicyKind::Range)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);

        let kernel = Kernel::new("def k(i: int, x, missing: int):\n    pass\n").unwrap();
        let err = translate(&kernel, &spec(&args, None, PolicyKind::Range)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn test_captured_values_become_literals() {
        let kernel = Kernel::new("def k(i: int, x):\n    x[i] = scale * x[i]\n")
            .unwrap()
            .capture("scale", 2.5);
        let x = view(DataType::Float64, &[4]);
        let args = Args::new().view("x", &x);
        let unit = translate(&kernel, &spec(&args, None, PolicyKind::Range)).unwrap();
        match &unit.kernel.body.stmts[0] {
            Stmt::Expr(Expr::Assign { value, .. }) => match value.as_ref() {
                Expr::Binary { lhs, .. } => assert_eq!(**lhs, Expr::float(2.5)),
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }
}
