//! Host execution back-end
//!
//! Executes a [`TranslationUnit`] directly, with the semantics of the
//! hierarchical model: range iterations and league teams run on the rayon
//! pool, the threads of one team run as scoped OS threads that rendezvous
//! through a [`TeamSync`], and vector lanes run sequentially inside their
//! thread. Team and thread scratch come from per-team byte arenas.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use rayon::prelude::*;

use crate::artifact::LaunchShape;
use crate::cppast::{
    BinaryOp, Block, Builtin, CType, Callee, Expr, Init, Lambda, MathFunction, Method, ParamRole,
    RangeKind, Scope, Stmt, TranslationUnit, UnaryOp,
};
use crate::dtype::{DataType, Scalar};
use crate::error::{KernelError, KernelResult};
use crate::kernel::{Arg, Args, CombineOp};
use crate::policy::{ResolvedTeam, SCRATCH_LEVELS};
use crate::view::{shmem_size, View, ViewStorage};

const TEAM_ABORTED: &str = "team aborted after a failure in another thread";

/// Run `unit` over `shape`
///
/// Returns the combined partials of every work item for reduction kernels,
/// `None` otherwise.
pub fn execute(
    unit: &TranslationUnit,
    shape: &LaunchShape,
    args: &Args,
    op: CombineOp,
) -> KernelResult<Option<Scalar>> {
    let bindings = bind(unit, args)?;
    let reduction = match unit.kernel.accumulator() {
        Some((_, dtype)) => Reduction { dtype, op },
        None => Reduction {
            dtype: DataType::Int32,
            op: CombineOp::Sum,
        },
    };
    let identity = reduction.identity();

    let total = match shape {
        LaunchShape::Range { begin, end } => (*begin..*end)
            .into_par_iter()
            .try_fold(
                || identity,
                |partial, i| Executor::new(unit, None).invoke(&bindings, &[i], partial, reduction),
            )
            .try_reduce(|| identity, |a, b| Ok(reduction.combine(a, b)))?,
        LaunchShape::MdRange { begin, end } => (begin[0]..end[0])
            .into_par_iter()
            .try_fold(
                || identity,
                |partial, first| -> KernelResult<Scalar> {
                    let mut partial = partial;
                    let mut index = vec![first];
                    index.extend_from_slice(&begin[1..]);
                    if begin[1..].iter().zip(&end[1..]).any(|(b, e)| b >= e) {
                        return Ok(partial);
                    }
                    loop {
                        partial = Executor::new(unit, None).invoke(&bindings, &index, partial, reduction)?;
                        if !advance(&mut index[1..], &begin[1..], &end[1..]) {
                            return Ok(partial);
                        }
                    }
                },
            )
            .try_reduce(|| identity, |a, b| Ok(reduction.combine(a, b)))?,
        LaunchShape::Team(team) => (0..team.league_size)
            .into_par_iter()
            .map(|league_rank| run_team(unit, &bindings, team, league_rank, reduction))
            .try_reduce(|| identity, |a, b| Ok(reduction.combine(a, b)))?,
    };

    Ok(unit.kernel.is_reduction().then_some(total))
}

/// Odometer step over the trailing dimensions of an md-range
fn advance(index: &mut [i64], begin: &[i64], end: &[i64]) -> bool {
    for d in (0..index.len()).rev() {
        index[d] += 1;
        if index[d] < end[d] {
            return true;
        }
        index[d] = begin[d];
    }
    false
}

#[derive(Debug, Clone, Copy)]
struct Reduction {
    dtype: DataType,
    op: CombineOp,
}

impl Reduction {
    fn identity(self) -> Scalar {
        self.op.identity(self.dtype)
    }

    fn combine(self, a: Scalar, b: Scalar) -> Scalar {
        self.op.combine(self.dtype, a, b)
    }
}

/// A kernel parameter's value, shared by every invocation
#[derive(Debug, Clone)]
enum Bound {
    Index(usize),
    Member,
    Accumulator,
    View(View),
    Num(Scalar, DataType),
}

fn bind(unit: &TranslationUnit, args: &Args) -> KernelResult<Vec<(String, Bound)>> {
    let mut bindings = Vec::with_capacity(unit.kernel.params.len());
    let mut position = 0;
    for param in &unit.kernel.params {
        let bound = match &param.role {
            ParamRole::Index => {
                position += 1;
                Bound::Index(position - 1)
            }
            ParamRole::TeamMember => Bound::Member,
            ParamRole::Accumulator(_) => Bound::Accumulator,
            ParamRole::View(_) => match args.get(&param.name) {
                Some(Arg::View(view)) => Bound::View(view.clone()),
                _ => {
                    return Err(KernelError::precondition(format!(
                        "view argument '{}' is not bound",
                        param.name
                    )))
                }
            },
            ParamRole::Scalar(dtype) => match args.get(&param.name) {
                Some(Arg::Scalar(value, _)) => Bound::Num(value.cast(*dtype), *dtype),
                _ => {
                    return Err(KernelError::precondition(format!(
                        "scalar argument '{}' is not bound",
                        param.name
                    )))
                }
            },
        };
        bindings.push((param.name.clone(), bound));
    }
    Ok(bindings)
}

// -------------------------------------------------------------------------
// Teams

/// Rendezvous point of the threads of one team
///
/// Every thread must arrive before any leaves. A thread that fails calls
/// [`TeamSync::abort`] so the others return an error instead of waiting.
pub(crate) struct TeamSync {
    size: usize,
    state: Mutex<SyncState>,
    cond: Condvar,
}

struct SyncState {
    generation: u64,
    arrived: usize,
    partials: Vec<Option<Scalar>>,
    result: Option<Scalar>,
    aborted: bool,
}

impl TeamSync {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            size,
            state: Mutex::new(SyncState {
                generation: 0,
                arrived: 0,
                partials: vec![None; size],
                result: None,
                aborted: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn abort(&self) {
        self.lock().aborted = true;
        self.cond.notify_all();
    }

    pub(crate) fn barrier(&self, rank: usize) -> KernelResult<()> {
        self.rendezvous(rank, None, DataType::Bool).map(|_| ())
    }

    /// Sum `partial` over the team; every thread receives the total
    pub(crate) fn all_reduce(&self, rank: usize, partial: Scalar, dtype: DataType) -> KernelResult<Scalar> {
        let result = self.rendezvous(rank, Some(partial), dtype)?;
        Ok(result.unwrap_or_else(|| CombineOp::Sum.identity(dtype)))
    }

    fn rendezvous(&self, rank: usize, partial: Option<Scalar>, dtype: DataType) -> KernelResult<Option<Scalar>> {
        let mut state = self.lock();
        if state.aborted {
            return Err(KernelError::execution(TEAM_ABORTED));
        }
        let generation = state.generation;
        state.partials[rank] = partial;
        state.arrived += 1;

        if state.arrived == self.size {
            // Combined in rank order so float results do not depend on timing
            let mut total: Option<Scalar> = None;
            for slot in state.partials.iter_mut() {
                if let Some(value) = slot.take() {
                    total = Some(match total {
                        Some(acc) => CombineOp::Sum.combine(dtype, acc, value),
                        None => value.cast(dtype),
                    });
                }
            }
            state.result = total;
            state.arrived = 0;
            state.generation += 1;
            self.cond.notify_all();
            return Ok(state.result);
        }

        while state.generation == generation && !state.aborted {
            state = self.cond.wait(state).unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        if state.generation == generation {
            return Err(KernelError::execution(TEAM_ABORTED));
        }
        Ok(state.result)
    }
}

/// State shared by the threads of one team
struct Team {
    league_rank: usize,
    shape: ResolvedTeam,
    sync: TeamSync,
    pools: [Arc<ViewStorage>; SCRATCH_LEVELS],
}

impl Team {
    fn new(league_rank: usize, shape: ResolvedTeam) -> Self {
        let pool = |level: usize| Arc::new(ViewStorage::new(shape.scratch[level].team_pool(shape.team_size)));
        Self {
            league_rank,
            shape,
            sync: TeamSync::new(shape.team_size),
            pools: [pool(0), pool(1)],
        }
    }
}

fn run_team(
    unit: &TranslationUnit,
    bindings: &[(String, Bound)],
    shape: &ResolvedTeam,
    league_rank: usize,
    reduction: Reduction,
) -> KernelResult<Scalar> {
    let team = Team::new(league_rank, *shape);
    let identity = reduction.identity();
    if shape.team_size == 1 {
        return Executor::new(unit, Some(Member { team: &team, rank: 0 }))
            .invoke(bindings, &[], identity, reduction);
    }

    let results: Vec<KernelResult<Scalar>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..shape.team_size)
            .map(|rank| {
                let team = &team;
                scope.spawn(move || {
                    let result = Executor::new(unit, Some(Member { team, rank }))
                        .invoke(bindings, &[], identity, reduction);
                    if result.is_err() {
                        team.sync.abort();
                    }
                    result
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(KernelError::execution("team thread panicked")))
            })
            .collect()
    });

    let mut total = identity;
    let mut aborted = None;
    for result in results {
        match result {
            Ok(partial) => total = reduction.combine(total, partial),
            Err(KernelError::Execution { message }) if message == TEAM_ABORTED => {
                aborted = Some(KernelError::execution(message));
            }
            Err(err) => return Err(err),
        }
    }
    match aborted {
        Some(err) => Err(err),
        None => Ok(total),
    }
}

#[derive(Clone, Copy)]
struct Member<'m> {
    team: &'m Team,
    rank: usize,
}

// -------------------------------------------------------------------------
// Values and environments

type Slot<'t> = Rc<RefCell<Value<'t>>>;

#[derive(Clone)]
enum Value<'t> {
    Num(Scalar, DataType),
    View(View),
    Member,
    Pointer(Slot<'t>),
    /// `team_scratch(level)` / `thread_scratch(level)` handle
    Scratch { level: usize, scope: Scope },
    Range { kind: RangeKind, begin: i64, end: i64 },
    Scope(Scope),
    Closure(Rc<Closure<'t>>),
    Void,
}

impl<'t> Value<'t> {
    fn describe(&self) -> &'static str {
        match self {
            Value::Num(..) => "number",
            Value::View(_) => "view",
            Value::Member => "team member",
            Value::Pointer(_) => "pointer",
            Value::Scratch { .. } => "scratch handle",
            Value::Range { .. } => "range",
            Value::Scope(_) => "scope",
            Value::Closure(_) => "lambda",
            Value::Void => "void",
        }
    }
}

struct Closure<'t> {
    lambda: &'t Lambda,
    captured: Vec<(String, Value<'t>)>,
}

enum Binding<'t> {
    Value(Value<'t>),
    Slot(Slot<'t>),
}

#[derive(Default)]
struct Env<'t> {
    scopes: Vec<HashMap<String, Slot<'t>>>,
}

impl<'t> Env<'t> {
    fn new() -> Self {
        Self {
            scopes: vec![HashMap::new()],
        }
    }

    fn push(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop(&mut self) {
        self.scopes.pop();
    }

    fn bind(&mut self, name: &str, value: Value<'t>) {
        self.bind_slot(name, Rc::new(RefCell::new(value)));
    }

    fn bind_slot(&mut self, name: &str, slot: Slot<'t>) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), slot);
        }
    }

    fn slot(&self, name: &str) -> KernelResult<Slot<'t>> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).cloned())
            .ok_or_else(|| KernelError::execution(format!("'{}' is not defined", name)))
    }

    fn get(&self, name: &str) -> KernelResult<Value<'t>> {
        Ok(self.slot(name)?.borrow().clone())
    }
}

enum Flow<'t> {
    Normal,
    Break,
    Continue,
    Return(Option<Value<'t>>),
}

/// Assignable location
enum Place<'t> {
    Slot(Slot<'t>),
    Element(View, Vec<usize>),
}

// -------------------------------------------------------------------------
// Execution

struct Executor<'t, 'm> {
    unit: &'t TranslationUnit,
    member: Option<Member<'m>>,
    /// Bytes handed out so far, per level and scope
    cursors: [[usize; 2]; SCRATCH_LEVELS],
}

impl<'t, 'm> Executor<'t, 'm> {
    fn new(unit: &'t TranslationUnit, member: Option<Member<'m>>) -> Self {
        Self {
            unit,
            member,
            cursors: [[0; 2]; SCRATCH_LEVELS],
        }
    }

    /// One call of the kernel body; returns the updated accumulator
    fn invoke(
        &mut self,
        bindings: &[(String, Bound)],
        indices: &[i64],
        partial: Scalar,
        reduction: Reduction,
    ) -> KernelResult<Scalar> {
        let mut env = Env::new();
        let accumulator: Slot<'t> = Rc::new(RefCell::new(Value::Num(partial, reduction.dtype)));
        for (name, bound) in bindings {
            match bound {
                Bound::Index(position) => env.bind(name, index_value(indices[*position])),
                Bound::Member => env.bind(name, Value::Member),
                Bound::Accumulator => env.bind_slot(name, accumulator.clone()),
                Bound::View(view) => env.bind(name, Value::View(view.clone())),
                Bound::Num(value, dtype) => env.bind(name, Value::Num(*value, *dtype)),
            }
        }
        self.cursors = [[0; 2]; SCRATCH_LEVELS];

        let unit = self.unit;
        self.block(&mut env, &unit.kernel.body)?;
        let result = accumulator.borrow().clone();
        match result {
            Value::Num(value, _) => Ok(value),
            _ => Err(KernelError::execution("accumulator does not hold a number")),
        }
    }

    fn member(&self) -> KernelResult<Member<'m>> {
        self.member
            .ok_or_else(|| KernelError::execution("team operations require a team policy"))
    }

    fn block(&mut self, env: &mut Env<'t>, block: &'t Block) -> KernelResult<Flow<'t>> {
        env.push();
        let mut flow = Flow::Normal;
        for stmt in &block.stmts {
            flow = self.stmt(env, stmt)?;
            if !matches!(flow, Flow::Normal) {
                break;
            }
        }
        env.pop();
        Ok(flow)
    }

    fn stmt(&mut self, env: &mut Env<'t>, stmt: &'t Stmt) -> KernelResult<Flow<'t>> {
        match stmt {
            Stmt::Decl(decl) => {
                let value = match &decl.init {
                    Init::None => match decl.ty {
                        CType::Scalar(dtype) => Value::Num(Scalar::Int(0).cast(dtype), dtype),
                        _ => Value::Void,
                    },
                    Init::Assign(init) => self.expr(env, init)?,
                    Init::Construct(args) => self.construct(env, &decl.ty, args)?,
                };
                let value = match (&decl.ty, value) {
                    (CType::Scalar(dtype), Value::Num(v, _)) => Value::Num(v.cast(*dtype), *dtype),
                    (CType::Scalar(_), other) => {
                        return Err(KernelError::execution(format!(
                            "cannot initialize '{}' from a {}",
                            decl.name,
                            other.describe()
                        )))
                    }
                    (_, value) => value,
                };
                env.bind(&decl.name, value);
                Ok(Flow::Normal)
            }
            Stmt::Expr(expr) => {
                self.expr(env, expr)?;
                Ok(Flow::Normal)
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                if self.truthy(env, cond)? {
                    self.block(env, then)
                } else {
                    self.block(env, otherwise)
                }
            }
            Stmt::While { cond, body } => {
                while self.truthy(env, cond)? {
                    match self.block(env, body)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For {
                var,
                dtype,
                begin,
                end,
                step,
                body,
            } => {
                let mut i = self.scalar(env, begin)?.0.as_i64();
                let end = self.scalar(env, end)?.0.as_i64();
                while (*step > 0 && i < end) || (*step < 0 && i > end) {
                    env.push();
                    env.bind(var, Value::Num(Scalar::Int(i).cast(*dtype), *dtype));
                    let flow = self.block(env, body);
                    env.pop();
                    match flow? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    i += step;
                }
                Ok(Flow::Normal)
            }
            Stmt::Return(value) => {
                let value = match value {
                    Some(value) => Some(self.expr(env, value)?),
                    None => None,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            Stmt::Compound(block) => self.block(env, block),
        }
    }

    fn truthy(&mut self, env: &mut Env<'t>, expr: &'t Expr) -> KernelResult<bool> {
        Ok(self.scalar(env, expr)?.0.as_bool())
    }

    fn scalar(&mut self, env: &mut Env<'t>, expr: &'t Expr) -> KernelResult<(Scalar, DataType)> {
        match self.expr(env, expr)? {
            Value::Num(value, dtype) => Ok((value, dtype)),
            other => Err(KernelError::execution(format!(
                "expected a number, found a {}",
                other.describe()
            ))),
        }
    }

    fn index(&mut self, env: &mut Env<'t>, expr: &'t Expr) -> KernelResult<usize> {
        let value = self.scalar(env, expr)?.0.as_i64();
        usize::try_from(value).map_err(|_| KernelError::execution(format!("negative index {}", value)))
    }

    fn view(&self, env: &Env<'t>, name: &str) -> KernelResult<View> {
        match env.get(name)? {
            Value::View(view) => Ok(view),
            other => Err(KernelError::execution(format!(
                "'{}' is a {}, not a view",
                name,
                other.describe()
            ))),
        }
    }

    fn expr(&mut self, env: &mut Env<'t>, expr: &'t Expr) -> KernelResult<Value<'t>> {
        match expr {
            Expr::Literal(value) => Ok(Value::Num(*value, literal_type(*value))),
            Expr::DeclRef(name) => env.get(name),
            Expr::Binary { op, lhs, rhs } => {
                if op.is_logical() {
                    let left = self.truthy(env, lhs)?;
                    let value = match op {
                        BinaryOp::LogicalAnd => left && self.truthy(env, rhs)?,
                        _ => left || self.truthy(env, rhs)?,
                    };
                    return Ok(Value::Num(Scalar::Bool(value), DataType::Bool));
                }
                let lhs = self.scalar(env, lhs)?;
                let rhs = self.scalar(env, rhs)?;
                let (value, dtype) = arithmetic(*op, lhs, rhs)?;
                Ok(Value::Num(value, dtype))
            }
            Expr::Unary { op, operand } => match op {
                UnaryOp::AddressOf => match self.place(env, operand)? {
                    Place::Slot(slot) => Ok(Value::Pointer(slot)),
                    Place::Element(..) => Err(KernelError::execution("cannot take the address of a view element")),
                },
                UnaryOp::Deref => match self.expr(env, operand)? {
                    Value::Pointer(slot) => Ok(slot.borrow().clone()),
                    other => Err(KernelError::execution(format!(
                        "cannot dereference a {}",
                        other.describe()
                    ))),
                },
                _ => {
                    let (value, dtype) = self.scalar(env, operand)?;
                    Ok(match op {
                        UnaryOp::Not => Value::Num(Scalar::Bool(!value.as_bool()), DataType::Bool),
                        UnaryOp::Neg | UnaryOp::Plus | UnaryOp::BitNot => {
                            let dtype = dtype.promote(DataType::Bool);
                            let value = match (op, dtype.is_float()) {
                                (UnaryOp::Neg, true) => Scalar::Float(-value.as_f64()),
                                (UnaryOp::Neg, false) => Scalar::Int(value.as_i64().wrapping_neg()),
                                (UnaryOp::BitNot, _) => Scalar::Int(!value.as_i64()),
                                _ => value,
                            };
                            Value::Num(value.cast(dtype), dtype)
                        }
                        _ => Value::Num(value, dtype),
                    })
                }
            },
            Expr::Assign { op, target, value } => {
                let (value, value_type) = self.scalar(env, value)?;
                let place = self.place(env, target)?;
                let value = match op {
                    Some(op) => arithmetic(*op, self.load(&place)?, (value, value_type))?.0,
                    None => value,
                };
                self.store(&place, value)
            }
            Expr::Call { callee, args } => self.call(env, callee, args),
            Expr::Cast { dtype, operand } => {
                let (value, _) = self.scalar(env, operand)?;
                Ok(Value::Num(value.cast(*dtype), *dtype))
            }
            Expr::Lambda(lambda) => {
                let mut captured = Vec::with_capacity(lambda.captures.len());
                for name in &lambda.captures {
                    captured.push((name.clone(), env.get(name)?));
                }
                Ok(Value::Closure(Rc::new(Closure {
                    lambda: lambda.as_ref(),
                    captured,
                })))
            }
        }
    }

    fn place(&mut self, env: &mut Env<'t>, target: &'t Expr) -> KernelResult<Place<'t>> {
        match target {
            Expr::DeclRef(name) => Ok(Place::Slot(env.slot(name)?)),
            Expr::Unary {
                op: UnaryOp::Deref,
                operand,
            } => match self.expr(env, operand)? {
                Value::Pointer(slot) => Ok(Place::Slot(slot)),
                other => Err(KernelError::execution(format!(
                    "cannot dereference a {}",
                    other.describe()
                ))),
            },
            Expr::Call {
                callee: Callee::View(name),
                args,
            } => {
                let view = self.view(env, name)?;
                let mut index = Vec::with_capacity(args.len());
                for arg in args {
                    index.push(self.index(env, arg)?);
                }
                Ok(Place::Element(view, index))
            }
            _ => Err(KernelError::execution("expression is not assignable")),
        }
    }

    fn load(&self, place: &Place<'t>) -> KernelResult<(Scalar, DataType)> {
        match place {
            Place::Slot(slot) => match &*slot.borrow() {
                Value::Num(value, dtype) => Ok((*value, *dtype)),
                other => Err(KernelError::execution(format!(
                    "expected a number, found a {}",
                    other.describe()
                ))),
            },
            Place::Element(view, index) => Ok((view.get(index)?, view.dtype())),
        }
    }

    fn store(&self, place: &Place<'t>, value: Scalar) -> KernelResult<Value<'t>> {
        match place {
            Place::Slot(slot) => {
                let dtype = match &*slot.borrow() {
                    Value::Num(_, dtype) => *dtype,
                    other => {
                        return Err(KernelError::execution(format!(
                            "cannot assign a number to a {}",
                            other.describe()
                        )))
                    }
                };
                let stored = Value::Num(value.cast(dtype), dtype);
                *slot.borrow_mut() = stored.clone();
                Ok(stored)
            }
            Place::Element(view, index) => {
                let dtype = view.dtype();
                view.set(index, value.cast(dtype))?;
                Ok(Value::Num(value.cast(dtype), dtype))
            }
        }
    }

    fn call(&mut self, env: &mut Env<'t>, callee: &'t Callee, args: &'t [Expr]) -> KernelResult<Value<'t>> {
        match callee {
            Callee::View(name) => {
                let view = self.view(env, name)?;
                let mut index = Vec::with_capacity(args.len());
                for arg in args {
                    index.push(self.index(env, arg)?);
                }
                Ok(Value::Num(view.get(&index)?, view.dtype()))
            }
            Callee::Method { receiver, method } => self.method(env, receiver, *method, args),
            Callee::Function(name) => self.helper(env, name, args),
            Callee::Builtin(builtin) => self.builtin(env, *builtin, args),
        }
    }

    fn method(
        &mut self,
        env: &mut Env<'t>,
        receiver: &str,
        method: Method,
        args: &'t [Expr],
    ) -> KernelResult<Value<'t>> {
        let int = |value: usize| Value::Num(Scalar::Int(value as i64), DataType::Int32);
        match method {
            Method::Extent => {
                let view = self.view(env, receiver)?;
                let dim = match args.first() {
                    Some(arg) => self.index(env, arg)?,
                    None => 0,
                };
                let extent = view.extent(dim).ok_or_else(|| {
                    KernelError::execution(format!("dimension {} is out of range for a rank-{} view", dim, view.rank()))
                })?;
                Ok(Value::Num(Scalar::Int(extent as i64), DataType::Int64))
            }
            Method::LeagueRank => Ok(int(self.member()?.team.league_rank)),
            Method::LeagueSize => Ok(int(self.member()?.team.shape.league_size)),
            Method::TeamRank => Ok(int(self.member()?.rank)),
            Method::TeamSize => Ok(int(self.member()?.team.shape.team_size)),
            Method::TeamBarrier => {
                let member = self.member()?;
                member.team.sync.barrier(member.rank)?;
                Ok(Value::Void)
            }
            Method::TeamScratch | Method::ThreadScratch => {
                let level = match args.first() {
                    Some(arg) => self.index(env, arg)?,
                    None => 0,
                };
                if level >= SCRATCH_LEVELS {
                    return Err(KernelError::execution(format!("scratch level {} does not exist", level)));
                }
                let scope = if method == Method::TeamScratch {
                    Scope::PerTeam
                } else {
                    Scope::PerThread
                };
                Ok(Value::Scratch { level, scope })
            }
        }
    }

    fn builtin(&mut self, env: &mut Env<'t>, builtin: Builtin, args: &'t [Expr]) -> KernelResult<Value<'t>> {
        match builtin {
            Builtin::Math(math) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.scalar(env, arg)?);
                }
                let (value, dtype) = evaluate_math(math, &values)?;
                Ok(Value::Num(value, dtype))
            }
            Builtin::Range(kind) => {
                let bounds = &args[1..];
                let (begin, end) = match bounds {
                    [end] => (0, self.scalar(env, end)?.0.as_i64()),
                    [begin, end] => (self.scalar(env, begin)?.0.as_i64(), self.scalar(env, end)?.0.as_i64()),
                    _ => return Err(KernelError::execution(format!("{} takes one or two bounds", kind.name()))),
                };
                Ok(Value::Range { kind, begin, end })
            }
            Builtin::Scope(scope) => Ok(Value::Scope(scope)),
            Builtin::ParallelFor => {
                let (range, closure) = self.range_and_closure(env, args)?;
                let (kind, begin, end) = range;
                for i in self.share(kind, begin, end)? {
                    self.call_closure(&closure, vec![Binding::Value(index_value(i))])?;
                }
                Ok(Value::Void)
            }
            Builtin::ParallelReduce => {
                let (range, closure) = self.range_and_closure(env, args)?;
                let (kind, begin, end) = range;
                let target = args
                    .get(2)
                    .ok_or_else(|| KernelError::execution("parallel_reduce needs a result"))?;
                let place = self.place(env, target)?;
                let (_, dtype) = self.load(&place)?;

                let partial: Slot<'t> = Rc::new(RefCell::new(Value::Num(CombineOp::Sum.identity(dtype), dtype)));
                for i in self.share(kind, begin, end)? {
                    self.call_closure(
                        &closure,
                        vec![Binding::Value(index_value(i)), Binding::Slot(partial.clone())],
                    )?;
                }
                let partial = match &*partial.borrow() {
                    Value::Num(value, _) => *value,
                    _ => CombineOp::Sum.identity(dtype),
                };
                let total = if kind.spans_team() {
                    let member = self.member()?;
                    member.team.sync.all_reduce(member.rank, partial, dtype)?
                } else {
                    partial
                };
                self.store(&place, total)?;
                Ok(Value::Void)
            }
            Builtin::Single => {
                let scope = match args.first() {
                    Some(arg) => match self.expr(env, arg)? {
                        Value::Scope(scope) => scope,
                        other => {
                            return Err(KernelError::execution(format!(
                                "single expects PerTeam or PerThread, found a {}",
                                other.describe()
                            )))
                        }
                    },
                    None => return Err(KernelError::execution("single needs a scope")),
                };
                let closure = match args.get(1) {
                    Some(arg) => self.closure(env, arg)?,
                    None => return Err(KernelError::execution("single needs a lambda")),
                };
                let member = self.member()?;
                if scope == Scope::PerThread || member.rank == 0 {
                    self.call_closure(&closure, vec![])?;
                }
                Ok(Value::Void)
            }
        }
    }

    fn closure(&mut self, env: &mut Env<'t>, expr: &'t Expr) -> KernelResult<Rc<Closure<'t>>> {
        match self.expr(env, expr)? {
            Value::Closure(closure) => Ok(closure),
            other => Err(KernelError::execution(format!(
                "expected a lambda, found a {}",
                other.describe()
            ))),
        }
    }

    #[allow(clippy::type_complexity)]
    fn range_and_closure(
        &mut self,
        env: &mut Env<'t>,
        args: &'t [Expr],
    ) -> KernelResult<((RangeKind, i64, i64), Rc<Closure<'t>>)> {
        let range = match args.first() {
            Some(arg) => match self.expr(env, arg)? {
                Value::Range { kind, begin, end } => (kind, begin, end),
                other => {
                    return Err(KernelError::execution(format!(
                        "expected a nested range, found a {}",
                        other.describe()
                    )))
                }
            },
            None => return Err(KernelError::execution("missing nested range")),
        };
        let closure = match args.get(1) {
            Some(arg) => self.closure(env, arg)?,
            None => return Err(KernelError::execution("missing lambda")),
        };
        Ok((range, closure))
    }

    /// Iterations of a nested range executed by this thread
    fn share(&self, kind: RangeKind, begin: i64, end: i64) -> KernelResult<Vec<i64>> {
        if !kind.spans_team() {
            return Ok((begin..end).collect());
        }
        let member = self.member()?;
        let size = member.team.shape.team_size as i64;
        let rank = member.rank as i64;
        Ok((begin..end).filter(|i| (i - begin) % size == rank).collect())
    }

    fn call_closure(&mut self, closure: &Closure<'t>, args: Vec<Binding<'t>>) -> KernelResult<()> {
        let mut env = Env::new();
        for (name, value) in &closure.captured {
            env.bind(name, value.clone());
        }
        for (param, arg) in closure.lambda.params.iter().zip(args) {
            match arg {
                Binding::Slot(slot) => env.bind_slot(&param.name, slot),
                Binding::Value(Value::Num(value, _)) if param.ty.scalar().is_some() => {
                    let dtype = param.ty.scalar().unwrap_or(DataType::Int32);
                    env.bind(&param.name, Value::Num(value.cast(dtype), dtype));
                }
                Binding::Value(value) => env.bind(&param.name, value),
            }
        }
        self.block(&mut env, &closure.lambda.body)?;
        Ok(())
    }

    fn helper(&mut self, env: &mut Env<'t>, name: &str, args: &'t [Expr]) -> KernelResult<Value<'t>> {
        let unit = self.unit;
        let helper = unit
            .helper(name)
            .ok_or_else(|| KernelError::execution(format!("unknown function '{}'", name)))?;
        let mut inner = Env::new();
        for (param, arg) in helper.params.iter().zip(args) {
            let value = match (self.expr(env, arg)?, &param.ty) {
                (Value::Num(value, _), CType::Scalar(dtype)) => Value::Num(value.cast(*dtype), *dtype),
                (value, _) => value,
            };
            inner.bind(&param.name, value);
        }
        match self.block(&mut inner, &helper.body)? {
            Flow::Return(Some(Value::Num(value, _))) => match helper.return_type {
                CType::Scalar(dtype) => Ok(Value::Num(value.cast(dtype), dtype)),
                _ => Ok(Value::Void),
            },
            _ => Ok(Value::Void),
        }
    }

    /// `ScratchView(member.team_scratch(level), extents...)`
    fn construct(&mut self, env: &mut Env<'t>, ty: &CType, args: &'t [Expr]) -> KernelResult<Value<'t>> {
        let dtype = match ty {
            CType::ScratchView { dtype, .. } => *dtype,
            other => {
                return Err(KernelError::execution(format!(
                    "cannot construct a {}",
                    crate::codegen::render_type(other)
                )))
            }
        };
        let (level, scope) = match args.first() {
            Some(arg) => match self.expr(env, arg)? {
                Value::Scratch { level, scope } => (level, scope),
                other => {
                    return Err(KernelError::execution(format!(
                        "expected a scratch handle, found a {}",
                        other.describe()
                    )))
                }
            },
            None => return Err(KernelError::execution("missing scratch handle")),
        };
        let mut extents = Vec::with_capacity(args.len().saturating_sub(1));
        for arg in &args[1..] {
            extents.push(self.index(env, arg)?);
        }
        let bytes = shmem_size(dtype, &extents)?;

        let member = self.member()?;
        let budget = member.team.shape.scratch[level];
        let (limit, base, slot) = match scope {
            Scope::PerTeam => (budget.per_team, 0, 0),
            Scope::PerThread => (budget.per_thread, budget.per_team + member.rank * budget.per_thread, 1),
        };
        let cursor = self.cursors[level][slot];
        if cursor + bytes > limit {
            return Err(KernelError::resource(format!(
                "{} scratch request of {} bytes at level {} exceeds the {} bytes configured ({} already in use)",
                scope.name(),
                bytes,
                level,
                limit,
                cursor
            )));
        }
        self.cursors[level][slot] = cursor + bytes;
        let view = View::scratch(dtype, &extents, member.team.pools[level].clone(), base + cursor)?;
        Ok(Value::View(view))
    }
}

fn index_value<'t>(i: i64) -> Value<'t> {
    match i32::try_from(i) {
        Ok(_) => Value::Num(Scalar::Int(i), DataType::Int32),
        Err(_) => Value::Num(Scalar::Int(i), DataType::Int64),
    }
}

fn literal_type(value: Scalar) -> DataType {
    match value {
        Scalar::Int(v) if i32::try_from(v).is_err() => DataType::Int64,
        other => other.dtype(),
    }
}

/// Binary operation with native promotion and wrapping
fn arithmetic(
    op: BinaryOp,
    (a, a_type): (Scalar, DataType),
    (b, b_type): (Scalar, DataType),
) -> KernelResult<(Scalar, DataType)> {
    let dtype = a_type.promote(b_type);
    if op.is_comparison() {
        let ordering = if dtype.is_float() {
            a.as_f64().partial_cmp(&b.as_f64())
        } else {
            Some(a.as_i64().cmp(&b.as_i64()))
        };
        let result = match ordering {
            Some(ordering) => match op {
                BinaryOp::Eq => ordering.is_eq(),
                BinaryOp::Ne => ordering.is_ne(),
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            },
            // NaN compares unequal to everything
            None => op == BinaryOp::Ne,
        };
        return Ok((Scalar::Bool(result), DataType::Bool));
    }
    if op.is_logical() {
        let result = match op {
            BinaryOp::LogicalAnd => a.as_bool() && b.as_bool(),
            _ => a.as_bool() || b.as_bool(),
        };
        return Ok((Scalar::Bool(result), DataType::Bool));
    }

    if dtype.is_float() {
        let (x, y) = (a.as_f64(), b.as_f64());
        let value = match op {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
            other => {
                return Err(KernelError::execution(format!(
                    "'{}' is not defined for {} operands",
                    other.symbol(),
                    dtype
                )))
            }
        };
        return Ok((Scalar::Float(value).cast(dtype), dtype));
    }

    let (x, y) = (a.as_i64(), b.as_i64());
    let value = match op {
        BinaryOp::Add => x.wrapping_add(y),
        BinaryOp::Sub => x.wrapping_sub(y),
        BinaryOp::Mul => x.wrapping_mul(y),
        BinaryOp::Div | BinaryOp::Rem if y == 0 => {
            return Err(KernelError::execution("integer division by zero"))
        }
        BinaryOp::Div => x.wrapping_div(y),
        BinaryOp::Rem => x.wrapping_rem(y),
        BinaryOp::Shl => x.wrapping_shl((y & 63) as u32),
        BinaryOp::Shr => x.wrapping_shr((y & 63) as u32),
        BinaryOp::BitAnd => x & y,
        BinaryOp::BitOr => x | y,
        _ => x ^ y,
    };
    Ok((Scalar::Int(value).cast(dtype), dtype))
}

fn evaluate_math(math: MathFunction, args: &[(Scalar, DataType)]) -> KernelResult<(Scalar, DataType)> {
    if args.len() != math.arity() {
        return Err(KernelError::execution(format!(
            "{}() takes {} argument(s)",
            math.name(),
            math.arity()
        )));
    }
    let (x, x_type) = args[0];
    let float_type = |types: &[DataType]| {
        if types.iter().all(|t| *t == DataType::Float32) {
            DataType::Float32
        } else {
            DataType::Float64
        }
    };
    let result = match math {
        MathFunction::Abs if !x_type.is_float() => {
            let dtype = x_type.promote(DataType::Bool);
            (Scalar::Int(x.as_i64().wrapping_abs()).cast(dtype), dtype)
        }
        MathFunction::Min | MathFunction::Max => {
            let (y, y_type) = args[1];
            let dtype = x_type.promote(y_type);
            let (x, y) = (x.cast(dtype), y.cast(dtype));
            let x_smaller = if dtype.is_float() {
                x.as_f64() < y.as_f64()
            } else {
                x.as_i64() < y.as_i64()
            };
            let pick_x = if math == MathFunction::Min { x_smaller } else { !x_smaller };
            (if pick_x { x } else { y }, dtype)
        }
        MathFunction::Pow => {
            let (y, y_type) = args[1];
            let dtype = float_type(&[x_type, y_type]);
            (Scalar::Float(x.as_f64().powf(y.as_f64())).cast(dtype), dtype)
        }
        _ => {
            let dtype = float_type(&[x_type]);
            let x = x.as_f64();
            let value = match math {
                MathFunction::Sqrt => x.sqrt(),
                MathFunction::Exp => x.exp(),
                MathFunction::Log => x.ln(),
                MathFunction::Sin => x.sin(),
                MathFunction::Cos => x.cos(),
                MathFunction::Tan => x.tan(),
                MathFunction::Floor => x.floor(),
                MathFunction::Ceil => x.ceil(),
                _ => x.abs(),
            };
            (Scalar::Float(value).cast(dtype), dtype)
        }
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Accumulator, Kernel, Specialization};
    use crate::policy::{ExecutionSpace, PolicyKind, ScratchSize, TeamPolicy};
    use crate::translator::translate;

    fn unit(source: &str, args: &Args, acc: Option<&Accumulator>, policy: PolicyKind) -> TranslationUnit {
        let kernel = Kernel::new(source).unwrap();
        let spec = Specialization::new(args, acc, policy, ExecutionSpace::OpenMp);
        translate(&kernel, &spec).unwrap()
    }

    fn team(league: usize, size: usize) -> TeamPolicy {
        TeamPolicy::new(ExecutionSpace::OpenMp, league, size, 1).unwrap()
    }

    #[test]
    fn test_range_for_and_reduce() {
        let x = View::from_slice(DataType::Int64, &[6], &[1i64, 2, 3, 4, 5, 6]).unwrap();
        let args = Args::new().view("x", &x);

        let double = unit("def k(i: int, x):\n    x[i] = x[i] * 2\n", &args, None, PolicyKind::Range);
        let shape = LaunchShape::Range { begin: 0, end: 6 };
        assert_eq!(execute(&double, &shape, &args, CombineOp::Sum).unwrap(), None);
        assert_eq!(x.to_f64_vec(), vec![2.0, 4.0, 6.0, 8.0, 10.0, 12.0]);

        let acc = Accumulator::sum(DataType::Int64, 0i64);
        let total = unit("def k(i: int, acc: Acc[int64], x):\n    acc += x[i]\n", &args, Some(&acc), PolicyKind::Range);
        let result = execute(&total, &shape, &args, CombineOp::Sum).unwrap();
        assert_eq!(result, Some(Scalar::Int(42)));

        // Each partial starts from the combine identity, so a max body updates rather than adds
        let max = acc.with_op(CombineOp::Max);
        let largest = unit(
            "def k(i: int, acc: Acc[int64], x):\n    if x[i] > acc:\n        acc = x[i]\n",
            &args,
            Some(&max),
            PolicyKind::Range,
        );
        let result = execute(&largest, &shape, &args, CombineOp::Max).unwrap();
        assert_eq!(result, Some(Scalar::Int(12)));
    }

    #[test]
    fn test_integer_semantics() {
        let out = View::new(DataType::Int32, &[4]).unwrap();
        let args = Args::new().view("out", &out);
        let source = "\
def k(i: int, out):
    out[0] = -7 // 2
    out[1] = -7 % 3
    out[2] = 2147483647 + i
    out[3] = int(7 / 2)
";
        let unit = unit(source, &args, None, PolicyKind::Range);
        execute(&unit, &LaunchShape::Range { begin: 1, end: 2 }, &args, CombineOp::Sum).unwrap();
        // Native truncation toward zero, wrapping on overflow
        assert_eq!(out.to_f64_vec(), vec![-3.0, -1.0, -2147483648.0, 3.0]);
    }

    #[test]
    fn test_team_barrier_and_nested_reduce() {
        let out = View::new(DataType::Float64, &[3]).unwrap();
        let args = Args::new().view("out", &out);
        let source = "\
def k(team_member, out):
    def body(i: int, partial: Acc[float]):
        partial += i
    total: float = parallel_reduce(TeamThreadRange(team_member, 10), body)
    team_member.team_barrier()
    if team_member.team_rank() == 0:
        out[team_member.league_rank()] = total + team_member.team_size()
";
        let unit = unit(source, &args, None, PolicyKind::Team);
        let shape = LaunchShape::Team(team(3, 4).resolve().unwrap());
        execute(&unit, &shape, &args, CombineOp::Sum).unwrap();
        assert_eq!(out.to_f64_vec(), vec![49.0, 49.0, 49.0]);
    }

    #[test]
    fn test_scratch_is_shared_within_a_team() {
        let out = View::new(DataType::Int32, &[2, 4]).unwrap();
        let args = Args::new().view("out", &out);
        let source = "\
def k(team_member, out):
    rank: int = team_member.team_rank()
    s: ScratchView1D[int] = ScratchView1D(team_member.team_scratch(0), 4)
    s[rank] = rank + 1
    inclusive_scan(team_member, s)
    out[team_member.league_rank()][rank] = s[rank]
";
        let unit = unit(source, &args, None, PolicyKind::Team);
        let policy = team(2, 4).with_scratch_size(0, ScratchSize::PerTeam(16)).unwrap();
        let shape = LaunchShape::Team(policy.resolve().unwrap());
        execute(&unit, &shape, &args, CombineOp::Sum).unwrap();
        assert_eq!(out.to_f64_vec(), vec![1.0, 3.0, 6.0, 10.0, 1.0, 3.0, 6.0, 10.0]);
    }

    #[test]
    fn test_scratch_overflow_is_a_resource_error() {
        let out = View::new(DataType::Float64, &[1]).unwrap();
        let args = Args::new().view("out", &out).scalar("n", 16);
        let source = "\
def k(team_member, out, n: int):
    s: ScratchView1D[double] = ScratchView1D(team_member.team_scratch(0), n)
    s[0] = 1.0
";
        let unit = unit(source, &args, None, PolicyKind::Team);
        let policy = team(2, 2).with_scratch_size(0, ScratchSize::PerTeam(64)).unwrap();
        let err = execute(&unit, &LaunchShape::Team(policy.resolve().unwrap()), &args, CombineOp::Sum)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Resource);
    }

    #[test]
    fn test_failure_does_not_deadlock_the_team() {
        let out = View::new(DataType::Float64, &[2]).unwrap();
        let args = Args::new().view("out", &out);
        let source = "\
def k(team_member, out):
    if team_member.team_rank() == 1:
        out[5] = 1.0
    team_member.team_barrier()
";
        let unit = unit(source, &args, None, PolicyKind::Team);
        let err = execute(&unit, &LaunchShape::Team(team(1, 3).resolve().unwrap()), &args, CombineOp::Sum)
            .unwrap_err();
        assert!(err.to_string().contains("out of bounds"), "{}", err);
    }

    #[test]
    fn test_md_range() {
        let a = View::new(DataType::Int32, &[2, 3]).unwrap();
        let args = Args::new().view("a", &a);
        let unit = unit("def k(i: int, j: int, a):\n    a[i][j] = 10 * i + j\n", &args, None, PolicyKind::MdRange(2));
        let shape = LaunchShape::MdRange {
            begin: vec![0, 0],
            end: vec![2, 3],
        };
        execute(&unit, &shape, &args, CombineOp::Sum).unwrap();
        assert_eq!(a.to_f64_vec(), vec![0.0, 1.0, 2.0, 10.0, 11.0, 12.0]);
    }

    #[test]
    fn test_md_range_reduce() {
        let a = View::from_slice(DataType::Int32, &[2, 3], &[1, 2, 3, 4, 5, 6]).unwrap();
        let args = Args::new().view("a", &a);
        let acc = Accumulator::sum(DataType::Int64, 0i64);
        let unit = unit(
            "def k(i: int, j: int, acc: Acc[int64], a):\n    acc += a[i][j]\n",
            &args,
            Some(&acc),
            PolicyKind::MdRange(2),
        );
        let full = LaunchShape::MdRange {
            begin: vec![0, 0],
            end: vec![2, 3],
        };
        assert_eq!(execute(&unit, &full, &args, CombineOp::Sum).unwrap(), Some(Scalar::Int(21)));

        let empty = LaunchShape::MdRange {
            begin: vec![0, 2],
            end: vec![2, 2],
        };
        assert_eq!(execute(&unit, &empty, &args, CombineOp::Sum).unwrap(), Some(Scalar::Int(0)));
    }
}
