//! Dispatcher
//!
//! Turns a policy, a kernel and its bound arguments into a launch: fetches
//! the artifact for the specialization, checks arguments, accumulator and
//! scratch budgets against it, sizes unsized scratch levels, and combines the
//! caller's initial value into the reduction result.

use crate::artifact::{CompiledArtifact, LaunchShape};
use crate::cache::ArtifactCache;
use crate::cppast::{BinaryOp, Builtin, Callee, Expr, MathFunction, Method, ParamRole, Scope, TranslationUnit};
use crate::dtype::Scalar;
use crate::error::{KernelError, KernelResult};
use crate::kernel::{Accumulator, Arg, Args, Kernel, Specialization};
use crate::policy::{Policy, ResolvedTeam, SCRATCH_LEVELS};
use crate::toolchain::Toolchain;
use crate::view::shmem_size;

/// Launches kernels through a cache and toolchain
pub struct Dispatcher<'a> {
    cache: &'a ArtifactCache,
    toolchain: &'a dyn Toolchain,
}

impl<'a> Dispatcher<'a> {
    pub fn new(cache: &'a ArtifactCache, toolchain: &'a dyn Toolchain) -> Self {
        Self { cache, toolchain }
    }

    /// Run `kernel` once per work item of `policy`
    pub fn parallel_for(&self, policy: impl Into<Policy>, kernel: &Kernel, args: &Args) -> KernelResult<()> {
        let policy = policy.into();
        log::debug!("parallel_for '{}' over {:?}", kernel.name(), policy.kind());
        let artifact = self.artifact(&policy, kernel, None, args)?;
        self.launch(&artifact, policy, args, None)?;
        Ok(())
    }

    /// Run the reduction kernel and return `init` combined with every partial
    pub fn parallel_reduce(
        &self,
        label: &str,
        policy: impl Into<Policy>,
        kernel: &Kernel,
        init: impl Into<Accumulator>,
        args: &Args,
    ) -> KernelResult<Scalar> {
        let policy = policy.into();
        let accumulator = init.into();
        log::debug!("parallel_reduce '{}' ('{}') over {:?}", label, kernel.name(), policy.kind());
        let artifact = self.artifact(&policy, kernel, Some(&accumulator), args)?;
        let result = self.launch(&artifact, policy, args, Some(&accumulator))?;
        result.ok_or_else(|| KernelError::execution(format!("'{}' produced no reduction value", label)))
    }

    /// Fetch or build the artifact for this call's specialization
    pub fn artifact(
        &self,
        policy: &Policy,
        kernel: &Kernel,
        accumulator: Option<&Accumulator>,
        args: &Args,
    ) -> KernelResult<std::sync::Arc<CompiledArtifact>> {
        let kind = policy.kind();
        if let Some(declared) = kernel.declared_policy() {
            if declared != kind {
                return Err(KernelError::precondition(format!(
                    "kernel '{}' is written for a {:?} policy but was dispatched with {:?}",
                    kernel.name(),
                    declared,
                    kind
                )));
            }
        }
        for (name, _) in args.iter() {
            if !kernel.def().params.iter().any(|p| &p.name == name) {
                return Err(KernelError::precondition(format!(
                    "kernel '{}' has no parameter named '{}'",
                    kernel.name(),
                    name
                )));
            }
        }
        let spec = Specialization::new(args, accumulator, kind, policy.space());
        self.cache.get_or_build(kernel, &spec, self.toolchain)
    }

    /// Validate `args` against `artifact` and run it
    pub fn launch(
        &self,
        artifact: &CompiledArtifact,
        policy: Policy,
        args: &Args,
        accumulator: Option<&Accumulator>,
    ) -> KernelResult<Option<Scalar>> {
        let unit = &artifact.unit;
        check_arguments(unit, &policy, args)?;
        match (unit.kernel.accumulator(), accumulator) {
            (Some((name, _)), None) => {
                return Err(KernelError::precondition(format!(
                    "kernel '{}' reduces into '{}' and needs an accumulator",
                    unit.kernel.name, name
                )))
            }
            (None, Some(_)) => {
                return Err(KernelError::precondition(format!(
                    "kernel '{}' is not a reduction but an accumulator was given",
                    unit.kernel.name
                )))
            }
            _ => {}
        }

        let shape = match &policy {
            Policy::Range(range) => LaunchShape::Range {
                begin: range.begin,
                end: range.end,
            },
            Policy::MdRange(md) => LaunchShape::MdRange {
                begin: md.begin.clone(),
                end: md.end.clone(),
            },
            Policy::Team(team) => {
                let mut resolved = team.resolve()?;
                size_scratch(unit, &mut resolved, args)?;
                LaunchShape::Team(resolved)
            }
        };

        let partial = artifact.launch(&shape, args)?;
        Ok(accumulator.map(|acc| match partial {
            Some(partial) => acc.op.combine(acc.dtype, acc.init, partial),
            None => acc.init,
        }))
    }
}

/// Every argument bound, with the type the artifact was built for
fn check_arguments(unit: &TranslationUnit, policy: &Policy, args: &Args) -> KernelResult<()> {
    let kernel = &unit.kernel;
    if kernel.policy != policy.kind() {
        return Err(KernelError::resource(format!(
            "artifact for '{}' was built for a {:?} policy, not {:?}",
            kernel.name,
            kernel.policy,
            policy.kind()
        )));
    }
    let space = policy.space();
    for param in kernel.arguments() {
        let arg = args.get(&param.name).ok_or_else(|| {
            KernelError::precondition(format!("argument '{}' of '{}' is not bound", param.name, kernel.name))
        })?;
        match (&param.role, arg) {
            (ParamRole::View(expected), Arg::View(view)) => {
                let actual = view.view_type();
                if actual != *expected {
                    return Err(KernelError::resource(format!(
                        "view '{}' is {} but the artifact expects {}",
                        param.name, actual, expected
                    )));
                }
                if !view.space().accessible_from(space) {
                    return Err(KernelError::precondition(format!(
                        "view '{}' lives in {:?}, which {} cannot access",
                        param.name,
                        view.space(),
                        space
                    )));
                }
            }
            (ParamRole::Scalar(expected), Arg::Scalar(_, actual)) if expected == actual => {}
            (ParamRole::Scalar(expected), Arg::Scalar(_, actual)) => {
                return Err(KernelError::type_error(format!(
                    "scalar '{}' is {} but the artifact expects {}",
                    param.name, actual, expected
                )))
            }
            (_, _) => {
                return Err(KernelError::type_error(format!(
                    "argument '{}' has the wrong kind for '{}'",
                    param.name, kernel.name
                )))
            }
        }
    }
    Ok(())
}

/// Statically computable scratch demand at one level, split by scope
#[derive(Debug, Default, Clone, Copy)]
struct Demand {
    /// Allocations that always run
    required: [usize; 2],
    /// Every computable allocation, conditional ones included
    total: [usize; 2],
}

/// Check explicit scratch budgets and size the unsized levels
fn size_scratch(unit: &TranslationUnit, team: &mut ResolvedTeam, args: &Args) -> KernelResult<()> {
    let mut demand = [Demand::default(); SCRATCH_LEVELS];
    for requirement in &unit.scratch {
        let mut extents = Vec::with_capacity(requirement.extents.len());
        for extent in &requirement.extents {
            match static_extent(extent, team, args) {
                Some(value) if value > 0 => extents.push(value as usize),
                Some(value) => {
                    return Err(KernelError::precondition(format!(
                        "scratch extent evaluates to {}, extents must be positive",
                        value
                    )))
                }
                None => break,
            }
        }
        if extents.len() < requirement.extents.len() {
            log::debug!(
                "level {} {} scratch depends on run-time values; checked at first use",
                requirement.level,
                requirement.scope.name()
            );
            continue;
        }

        let bytes = shmem_size(requirement.dtype, &extents)?;
        let scope = match requirement.scope {
            Scope::PerTeam => 0,
            Scope::PerThread => 1,
        };
        let level = &mut demand[requirement.level];
        level.total[scope] += bytes;
        if requirement.unconditional {
            level.required[scope] += bytes;
        }
    }

    for (level, (budget, demand)) in team.scratch.iter_mut().zip(demand).enumerate() {
        if budget.explicit {
            for (scope, configured, required) in [
                (Scope::PerTeam, budget.per_team, demand.required[0]),
                (Scope::PerThread, budget.per_thread, demand.required[1]),
            ] {
                if configured < required {
                    return Err(KernelError::resource(format!(
                        "kernel '{}' needs {} bytes of {} scratch at level {} but the policy sets {}",
                        unit.kernel.name,
                        required,
                        scope.name(),
                        level,
                        configured
                    )));
                }
            }
        } else if demand.total != [0, 0] {
            budget.per_team = demand.total[0];
            budget.per_thread = demand.total[1];
            log::debug!(
                "sized level {} scratch of '{}' to {} bytes per team, {} per thread",
                level,
                unit.kernel.name,
                budget.per_team,
                budget.per_thread
            );
        }
    }
    Ok(())
}

/// Evaluate a scratch extent from literals, bound scalars and team sizes
fn static_extent(expr: &Expr, team: &ResolvedTeam, args: &Args) -> Option<i64> {
    match expr {
        Expr::Literal(Scalar::Int(value)) => Some(*value),
        Expr::DeclRef(name) => match args.get(name)? {
            Arg::Scalar(value, dtype) if dtype.is_integer() => Some(value.as_i64()),
            _ => None,
        },
        Expr::Call {
            callee: Callee::Method { method, .. },
            ..
        } => match method {
            Method::TeamSize => Some(team.team_size as i64),
            Method::LeagueSize => Some(team.league_size as i64),
            _ => None,
        },
        Expr::Cast { dtype, operand } if dtype.is_integer() => static_extent(operand, team, args),
        Expr::Binary { op, lhs, rhs } => {
            let (a, b) = (static_extent(lhs, team, args)?, static_extent(rhs, team, args)?);
            match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Sub => a.checked_sub(b),
                BinaryOp::Mul => a.checked_mul(b),
                BinaryOp::Div => a.checked_div(b),
                BinaryOp::Rem => a.checked_rem(b),
                BinaryOp::Shl => a.checked_shl(u32::try_from(b).ok()?),
                BinaryOp::Shr => a.checked_shr(u32::try_from(b).ok()?),
                _ => None,
            }
        }
        Expr::Call {
            callee: Callee::Builtin(Builtin::Math(math @ (MathFunction::Min | MathFunction::Max))),
            args: operands,
        } if operands.len() == 2 => {
            let a = static_extent(&operands[0], team, args)?;
            let b = static_extent(&operands[1], team, args)?;
            Some(if *math == MathFunction::Min { a.min(b) } else { a.max(b) })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DataType;
    use crate::error::ErrorKind;
    use crate::policy::{ExecutionSpace, MdRangePolicy, RangePolicy, ScratchSize, TeamPolicy};
    use crate::toolchain::HostToolchain;
    use crate::view::{Layout, View};

    const SPACE: ExecutionSpace = ExecutionSpace::OpenMp;

    const TEAM_SUM: &str = "\
def team_sum(team_member, acc: Acc[float], x: View2D[double], M: int):
    e: int = team_member.league_rank()
    s: ScratchView1D[double] = ScratchView1D(team_member.team_scratch(0), M)

    def load(i: int):
        s[i] = x[e][i]

    if team_member.team_rank() == 0:
        parallel_for(ThreadVectorRange(team_member, M), load)
    team_member.team_barrier()

    def add(i: int, partial: Acc[float]):
        partial += s[i]

    total: float = parallel_reduce(TeamThreadRange(team_member, M), add)

    def publish():
        nonlocal acc
        acc += total

    single(PerTeam(team_member), publish)
";

    #[test]
    fn test_range_reduce_combines_init_once() {
        let cache = ArtifactCache::new();
        let dispatcher = Dispatcher::new(&cache, &HostToolchain);
        let kernel = Kernel::new("def total(i: int, acc: Acc[float], x: View1D[double]):\n    acc += x[i]\n").unwrap();
        let x = View::from_slice(DataType::Float64, &[4], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let args = Args::new().view("x", &x);

        let policy = RangePolicy::new(SPACE, 0, 4).unwrap();
        let result = dispatcher
            .parallel_reduce("total", policy.clone(), &kernel, 100.0, &args)
            .unwrap();
        assert_eq!(result, Scalar::Float(110.0));

        let err = dispatcher.parallel_for(policy, &kernel, &args).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn test_team_reduction_auto_sizes_scratch() {
        let cache = ArtifactCache::new();
        let dispatcher = Dispatcher::new(&cache, &HostToolchain);
        let kernel = Kernel::new(TEAM_SUM).unwrap();
        let (league, m) = (5, 6);
        let x = View::new(DataType::Float64, &[league, m]).unwrap();
        x.fill(1.0);
        let args = Args::new().view("x", &x).scalar("M", m as i32);

        for team_size in [1, 2, 4] {
            let policy = TeamPolicy::new(SPACE, league, team_size, 1).unwrap();
            let result = dispatcher.parallel_reduce("sum", policy, &kernel, 0.0, &args).unwrap();
            assert_eq!(result, Scalar::Float((league * m) as f64));
        }
        assert_eq!(cache.builds(), 1);
    }

    #[test]
    fn test_explicit_scratch_budget_is_checked() {
        let cache = ArtifactCache::new();
        let dispatcher = Dispatcher::new(&cache, &HostToolchain);
        let kernel = Kernel::new(TEAM_SUM).unwrap();
        let x = View::new(DataType::Float64, &[2, 16]).unwrap();
        let args = Args::new().view("x", &x).scalar("M", 16);

        let small = TeamPolicy::new(SPACE, 2, 2, 1)
            .unwrap()
            .with_scratch_size(0, ScratchSize::PerTeam(64))
            .unwrap();
        let err = dispatcher.parallel_reduce("sum", small, &kernel, 0.0, &args).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert!(err.to_string().contains("128 bytes"), "{}", err);

        let enough = TeamPolicy::new(SPACE, 2, 2, 1)
            .unwrap()
            .with_scratch_size(0, ScratchSize::PerTeam(128))
            .unwrap();
        assert!(dispatcher.parallel_reduce("sum", enough, &kernel, 0.0, &args).is_ok());
    }

    #[test]
    fn test_view_mismatch_against_artifact() {
        let cache = ArtifactCache::new();
        let dispatcher = Dispatcher::new(&cache, &HostToolchain);
        let kernel = Kernel::new("def k(i: int, x):\n    x[i] = 1.0\n").unwrap();
        let x = View::new(DataType::Float64, &[4]).unwrap();
        let policy: Policy = RangePolicy::new(SPACE, 0, 4).unwrap().into();
        let artifact = dispatcher
            .artifact(&policy, &kernel, None, &Args::new().view("x", &x))
            .unwrap();

        let left = View::new(DataType::Float64, &[4]).unwrap().with_layout(Layout::LayoutLeft);
        let err = dispatcher
            .launch(&artifact, policy.clone(), &Args::new().view("x", &left), None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);

        let err = dispatcher.launch(&artifact, policy, &Args::new(), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn test_policy_kind_must_match_signature() {
        let cache = ArtifactCache::new();
        let dispatcher = Dispatcher::new(&cache, &HostToolchain);
        let kernel = Kernel::new("def k(i: int, x):\n    x[i] = 1.0\n").unwrap();
        let x = View::new(DataType::Float64, &[4]).unwrap();
        let args = Args::new().view("x", &x);

        let team = TeamPolicy::new(SPACE, 1, 1, 1).unwrap();
        let err = dispatcher.parallel_for(team, &kernel, &args).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);

        let md = MdRangePolicy::new(SPACE, &[0, 0], &[2, 2]).unwrap();
        assert!(dispatcher.parallel_for(md, &kernel, &args).is_err());

        let err = dispatcher
            .parallel_for(RangePolicy::new(SPACE, 0, 4).unwrap(), &kernel, &args.clone().scalar("y", 1))
            .unwrap_err();
        assert!(err.to_string().contains("'y'"));
    }

    #[test]
    fn test_static_extents() {
        let team = TeamPolicy::new(SPACE, 3, 4, 1).unwrap().resolve().unwrap();
        let args = Args::new().scalar("n", 5).scalar("f", 1.5);
        let n_times_size = Expr::binary(
            BinaryOp::Mul,
            Expr::decl_ref("n"),
            Expr::method("team_member", Method::TeamSize, vec![]),
        );
        assert_eq!(static_extent(&n_times_size, &team, &args), Some(20));
        assert_eq!(static_extent(&Expr::decl_ref("f"), &team, &args), None);
        assert_eq!(static_extent(&Expr::decl_ref("local"), &team, &args), None);
    }
}
