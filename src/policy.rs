//! Execution spaces and iteration policies
//!
//! Policies describe the iteration space of one dispatch: a flat range, a
//! multi-dimensional range, or a league of teams with per-level scratch
//! requests. Team policies are resolved against the execution space at
//! dispatch time, which also freezes their scratch configuration.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};
use crate::view::MemorySpace;

/// Number of scratch levels (0: fast/small, 1: slower/larger)
pub const SCRATCH_LEVELS: usize = 2;

/// Team size picked for `Auto` on GPU spaces
const GPU_AUTO_TEAM_SIZE: usize = 128;

/// Back-end a kernel executes on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionSpace {
    Serial,
    OpenMp,
    Threads,
    Cuda,
    Hip,
}

impl ExecutionSpace {
    pub fn is_host(self) -> bool {
        matches!(
            self,
            ExecutionSpace::Serial | ExecutionSpace::OpenMp | ExecutionSpace::Threads
        )
    }

    pub fn cpp_name(self) -> &'static str {
        match self {
            ExecutionSpace::Serial => "Kokkos::Serial",
            ExecutionSpace::OpenMp => "Kokkos::OpenMP",
            ExecutionSpace::Threads => "Kokkos::Threads",
            ExecutionSpace::Cuda => "Kokkos::Cuda",
            ExecutionSpace::Hip => "Kokkos::HIP",
        }
    }

    /// Memory space views default to when created for this space
    pub fn memory_space(self) -> MemorySpace {
        match self {
            ExecutionSpace::Cuda => MemorySpace::CudaSpace,
            ExecutionSpace::Hip => MemorySpace::HipSpace,
            _ => MemorySpace::HostSpace,
        }
    }

    /// Largest team size the space accepts
    pub fn max_team_size(self) -> usize {
        match self {
            ExecutionSpace::Serial => 1,
            ExecutionSpace::OpenMp | ExecutionSpace::Threads => 512,
            ExecutionSpace::Cuda | ExecutionSpace::Hip => 1024,
        }
    }

    /// Largest vector length the space accepts
    pub fn max_vector_length(self) -> usize {
        match self {
            ExecutionSpace::Cuda => 32,
            ExecutionSpace::Hip => 64,
            _ => 64,
        }
    }

    /// Team size used when the policy asks for `Auto`
    pub fn auto_team_size(self) -> usize {
        if self.is_host() {
            1
        } else {
            GPU_AUTO_TEAM_SIZE.min(self.max_team_size())
        }
    }

    /// Directory-safe name, used in cache paths
    pub fn tag(self) -> &'static str {
        match self {
            ExecutionSpace::Serial => "serial",
            ExecutionSpace::OpenMp => "openmp",
            ExecutionSpace::Threads => "threads",
            ExecutionSpace::Cuda => "cuda",
            ExecutionSpace::Hip => "hip",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        let space = match tag.to_ascii_lowercase().as_str() {
            "serial" => ExecutionSpace::Serial,
            "openmp" => ExecutionSpace::OpenMp,
            "threads" => ExecutionSpace::Threads,
            "cuda" => ExecutionSpace::Cuda,
            "hip" => ExecutionSpace::Hip,
            _ => return None,
        };
        Some(space)
    }

    fn index(self) -> u8 {
        match self {
            ExecutionSpace::Serial => 0,
            ExecutionSpace::OpenMp => 1,
            ExecutionSpace::Threads => 2,
            ExecutionSpace::Cuda => 3,
            ExecutionSpace::Hip => 4,
        }
    }

    fn from_index(index: u8) -> Self {
        match index {
            0 => ExecutionSpace::Serial,
            2 => ExecutionSpace::Threads,
            3 => ExecutionSpace::Cuda,
            4 => ExecutionSpace::Hip,
            _ => ExecutionSpace::OpenMp,
        }
    }
}

impl std::fmt::Display for ExecutionSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

static DEFAULT_SPACE: AtomicU8 = AtomicU8::new(1);

/// Execution space used when views and policies do not name one
pub fn default_space() -> ExecutionSpace {
    ExecutionSpace::from_index(DEFAULT_SPACE.load(Ordering::Relaxed))
}

/// Change the process-wide default execution space
pub fn set_default_space(space: ExecutionSpace) {
    DEFAULT_SPACE.store(space.index(), Ordering::Relaxed);
}

/// A size that is either given or resolved at dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sizing {
    Auto,
    Fixed(usize),
}

impl From<usize> for Sizing {
    fn from(value: usize) -> Self {
        Sizing::Fixed(value)
    }
}

/// Scratch request for one level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScratchSize {
    PerTeam(usize),
    PerThread(usize),
}

/// Flat range `[begin, end)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangePolicy {
    pub space: ExecutionSpace,
    pub begin: i64,
    pub end: i64,
}

impl RangePolicy {
    pub fn new(space: ExecutionSpace, begin: i64, end: i64) -> KernelResult<Self> {
        if end < begin {
            return Err(KernelError::precondition(format!(
                "range end {} is before begin {}",
                end, begin
            )));
        }
        Ok(Self { space, begin, end })
    }

    pub fn len(&self) -> usize {
        (self.end - self.begin) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Rectangular multi-dimensional range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdRangePolicy {
    pub space: ExecutionSpace,
    pub begin: Vec<i64>,
    pub end: Vec<i64>,
}

impl MdRangePolicy {
    pub fn new(space: ExecutionSpace, begin: &[i64], end: &[i64]) -> KernelResult<Self> {
        if begin.len() != end.len() || !(2..=3).contains(&begin.len()) {
            return Err(KernelError::precondition(format!(
                "multi-dimensional ranges need 2 or 3 matching bounds, got {} and {}",
                begin.len(),
                end.len()
            )));
        }
        if begin.iter().zip(end).any(|(b, e)| e < b) {
            return Err(KernelError::precondition("range end is before begin"));
        }
        Ok(Self {
            space,
            begin: begin.to_vec(),
            end: end.to_vec(),
        })
    }

    pub fn rank(&self) -> usize {
        self.begin.len()
    }
}

/// League of teams, each of `team_size` threads with `vector_length` lanes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamPolicy {
    pub space: ExecutionSpace,
    pub league_size: Sizing,
    pub team_size: Sizing,
    pub vector_length: usize,
    scratch: [ScratchBudget; SCRATCH_LEVELS],
}

impl TeamPolicy {
    pub fn new(
        space: ExecutionSpace,
        league_size: impl Into<Sizing>,
        team_size: impl Into<Sizing>,
        vector_length: usize,
    ) -> KernelResult<Self> {
        let league_size = league_size.into();
        let team_size = team_size.into();
        if league_size == Sizing::Fixed(0) {
            return Err(KernelError::precondition("league size must be positive"));
        }
        if team_size == Sizing::Fixed(0) {
            return Err(KernelError::precondition("team size must be positive"));
        }
        if vector_length == 0 || !vector_length.is_power_of_two() {
            return Err(KernelError::precondition(format!(
                "vector length must be a positive power of two, got {}",
                vector_length
            )));
        }
        Ok(Self {
            space,
            league_size,
            team_size,
            vector_length,
            scratch: [ScratchBudget::default(); SCRATCH_LEVELS],
        })
    }

    /// Request scratch memory at `level`
    ///
    /// Per-team and per-thread requests at one level are kept side by side;
    /// a repeated request for the same scope replaces the earlier one.
    pub fn with_scratch_size(mut self, level: usize, size: ScratchSize) -> KernelResult<Self> {
        let budget = self.scratch.get_mut(level).ok_or_else(|| {
            KernelError::precondition(format!("scratch level must be 0 or 1, got {}", level))
        })?;
        match size {
            ScratchSize::PerTeam(bytes) => budget.per_team = bytes,
            ScratchSize::PerThread(bytes) => budget.per_thread = bytes,
        }
        budget.explicit = true;
        Ok(self)
    }

    /// The explicit budget at `level`, if any request was made there
    pub fn scratch_size(&self, level: usize) -> Option<ScratchBudget> {
        self.scratch.get(level).copied().filter(|budget| budget.explicit)
    }

    /// Resolve `Auto` sizes against the execution space and freeze the scratch setup
    pub fn resolve(&self) -> KernelResult<ResolvedTeam> {
        let league_size = match self.league_size {
            Sizing::Fixed(n) => n,
            Sizing::Auto => {
                return Err(KernelError::precondition(
                    "league size 'auto' cannot be resolved: no heuristic applies without a work size",
                ))
            }
        };
        let team_size = match self.team_size {
            Sizing::Fixed(n) => n,
            Sizing::Auto => self.space.auto_team_size(),
        };
        if team_size > self.space.max_team_size() {
            return Err(KernelError::resource(format!(
                "team size {} exceeds the maximum {} of {}",
                team_size,
                self.space.max_team_size(),
                self.space
            )));
        }
        if self.vector_length > self.space.max_vector_length() {
            return Err(KernelError::resource(format!(
                "vector length {} exceeds the maximum {} of {}",
                self.vector_length,
                self.space.max_vector_length(),
                self.space
            )));
        }

        Ok(ResolvedTeam {
            league_size,
            team_size,
            vector_length: self.vector_length,
            scratch: self.scratch,
        })
    }
}

/// Scratch bytes available at one level of a resolved team policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScratchBudget {
    pub per_team: usize,
    pub per_thread: usize,
    /// The caller sized this level explicitly
    pub explicit: bool,
}

impl ScratchBudget {
    /// Bytes `team_scratch(level)` may hand out to one team
    pub fn team_pool(&self, team_size: usize) -> usize {
        self.per_team + self.per_thread * team_size
    }
}

/// A team policy after `Auto` resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTeam {
    pub league_size: usize,
    pub team_size: usize,
    pub vector_length: usize,
    pub scratch: [ScratchBudget; SCRATCH_LEVELS],
}

/// Any execution policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Policy {
    Range(RangePolicy),
    MdRange(MdRangePolicy),
    Team(TeamPolicy),
}

impl Policy {
    pub fn space(&self) -> ExecutionSpace {
        match self {
            Policy::Range(p) => p.space,
            Policy::MdRange(p) => p.space,
            Policy::Team(p) => p.space,
        }
    }

    pub fn kind(&self) -> PolicyKind {
        match self {
            Policy::Range(_) => PolicyKind::Range,
            Policy::MdRange(p) => PolicyKind::MdRange(p.rank()),
            Policy::Team(_) => PolicyKind::Team,
        }
    }
}

impl From<RangePolicy> for Policy {
    fn from(policy: RangePolicy) -> Self {
        Policy::Range(policy)
    }
}

impl From<MdRangePolicy> for Policy {
    fn from(policy: MdRangePolicy) -> Self {
        Policy::MdRange(policy)
    }
}

impl From<TeamPolicy> for Policy {
    fn from(policy: TeamPolicy) -> Self {
        Policy::Team(policy)
    }
}

/// Policy shape, part of every specialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyKind {
    Range,
    MdRange(usize),
    Team,
}

impl PolicyKind {
    /// Number of leading index parameters the kernel takes
    pub fn index_params(self) -> usize {
        match self {
            PolicyKind::Range | PolicyKind::Team => 1,
            PolicyKind::MdRange(rank) => rank,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_team_policy_validation() {
        assert!(TeamPolicy::new(ExecutionSpace::OpenMp, 0, 4, 1).is_err());
        assert!(TeamPolicy::new(ExecutionSpace::OpenMp, 4, 0, 1).is_err());
        assert!(TeamPolicy::new(ExecutionSpace::OpenMp, 4, 4, 3).is_err());
        assert!(TeamPolicy::new(ExecutionSpace::OpenMp, Sizing::Auto, Sizing::Auto, 1).is_ok());
    }

    #[test]
    fn test_auto_resolution() {
        let host = TeamPolicy::new(ExecutionSpace::OpenMp, 8, Sizing::Auto, 1).unwrap();
        assert_eq!(host.resolve().unwrap().team_size, 1);

        let gpu = TeamPolicy::new(ExecutionSpace::Cuda, 8, Sizing::Auto, 32).unwrap();
        assert_eq!(gpu.resolve().unwrap().team_size, 128);

        let league = TeamPolicy::new(ExecutionSpace::OpenMp, Sizing::Auto, 4, 1).unwrap();
        let err = league.resolve().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Precondition);

        let too_big = TeamPolicy::new(ExecutionSpace::Serial, 1, 2, 1).unwrap();
        assert_eq!(too_big.resolve().unwrap_err().kind(), crate::error::ErrorKind::Resource);
    }

    #[test]
    fn test_scratch_levels_are_independent() {
        let policy = TeamPolicy::new(ExecutionSpace::OpenMp, 4, 8, 1)
            .unwrap()
            .with_scratch_size(0, ScratchSize::PerTeam(128))
            .unwrap()
            .with_scratch_size(1, ScratchSize::PerThread(16))
            .unwrap();
        let resolved = policy.resolve().unwrap();
        assert_eq!(resolved.scratch[0].team_pool(8), 128);
        assert_eq!(resolved.scratch[1].team_pool(8), 128);
        assert_eq!(resolved.scratch[1].per_team, 0);
        assert!(resolved.scratch[0].explicit && resolved.scratch[1].explicit);
        assert!(policy.clone().with_scratch_size(2, ScratchSize::PerTeam(8)).is_err());
    }

    #[test]
    fn test_team_and_thread_scratch_share_a_level() {
        let policy = TeamPolicy::new(ExecutionSpace::OpenMp, 2, 4, 1)
            .unwrap()
            .with_scratch_size(0, ScratchSize::PerTeam(32))
            .unwrap()
            .with_scratch_size(0, ScratchSize::PerThread(16))
            .unwrap();
        let budget = policy.scratch_size(0).unwrap();
        assert_eq!((budget.per_team, budget.per_thread), (32, 16));
        assert_eq!(policy.scratch_size(1), None);
        assert_eq!(policy.resolve().unwrap().scratch[0].team_pool(4), 96);

        let replaced = policy.with_scratch_size(0, ScratchSize::PerTeam(8)).unwrap();
        let budget = replaced.scratch_size(0).unwrap();
        assert_eq!((budget.per_team, budget.per_thread), (8, 16));
    }

    #[test]
    fn test_ranges() {
        assert!(RangePolicy::new(ExecutionSpace::OpenMp, 5, 2).is_err());
        assert_eq!(RangePolicy::new(ExecutionSpace::OpenMp, 2, 5).unwrap().len(), 3);
        assert!(MdRangePolicy::new(ExecutionSpace::OpenMp, &[0], &[4]).is_err());
        let md = MdRangePolicy::new(ExecutionSpace::OpenMp, &[0, 0], &[2, 3]).unwrap();
        assert_eq!(Policy::from(md).kind(), PolicyKind::MdRange(2));
    }
}
