//! Compiled artifacts and the launch interface they expose

use std::path::PathBuf;
use std::sync::Arc;

use crate::cppast::TranslationUnit;
use crate::dtype::Scalar;
use crate::error::KernelResult;
use crate::kernel::{Args, KernelId};
use crate::policy::ResolvedTeam;

/// Concrete iteration space of one launch, after sizing
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchShape {
    Range { begin: i64, end: i64 },
    MdRange { begin: Vec<i64>, end: Vec<i64> },
    Team(ResolvedTeam),
}

impl LaunchShape {
    /// Flat launch parameters passed to the native entry point
    ///
    /// Range: `[begin, end]`. MDRange: all begins then all ends. Team:
    /// `[league, team, vector, l0_team, l0_thread, l1_team, l1_thread]`.
    pub fn params(&self) -> Vec<i64> {
        match self {
            LaunchShape::Range { begin, end } => vec![*begin, *end],
            LaunchShape::MdRange { begin, end } => begin.iter().chain(end).copied().collect(),
            LaunchShape::Team(team) => {
                let mut params = vec![
                    team.league_size as i64,
                    team.team_size as i64,
                    team.vector_length as i64,
                ];
                for budget in &team.scratch {
                    params.push(budget.per_team as i64);
                    params.push(budget.per_thread as i64);
                }
                params
            }
        }
    }

    /// Number of kernel invocations: range length or team count
    pub fn work_items(&self) -> usize {
        match self {
            LaunchShape::Range { begin, end } => (end - begin).max(0) as usize,
            LaunchShape::MdRange { begin, end } => begin
                .iter()
                .zip(end)
                .map(|(b, e)| (e - b).max(0) as usize)
                .product(),
            LaunchShape::Team(team) => team.league_size,
        }
    }
}

/// Executes a built kernel
pub trait Launcher: Send + Sync {
    /// Run the kernel over `shape`; reductions return the combined partials
    /// of all work items, excluding the caller's initial value
    fn launch(&self, shape: &LaunchShape, args: &Args) -> KernelResult<Option<Scalar>>;
}

/// A built kernel specialization
pub struct CompiledArtifact {
    pub id: KernelId,
    /// Cache key fingerprint
    pub fingerprint: String,
    pub toolchain: String,
    pub unit: Arc<TranslationUnit>,
    /// Rendered native source, for toolchains that compile it
    pub source: Option<String>,
    /// Directory the artifact persists in, when on disk
    pub location: Option<PathBuf>,
    launcher: Box<dyn Launcher>,
}

impl CompiledArtifact {
    pub fn new(
        id: KernelId,
        fingerprint: String,
        toolchain: String,
        unit: Arc<TranslationUnit>,
        launcher: Box<dyn Launcher>,
    ) -> Self {
        Self {
            id,
            fingerprint,
            toolchain,
            unit,
            source: None,
            location: None,
            launcher,
        }
    }

    pub fn with_source(mut self, source: Option<String>) -> Self {
        self.source = source;
        self
    }

    pub fn with_location(mut self, location: Option<PathBuf>) -> Self {
        self.location = location;
        self
    }

    pub fn launch(&self, shape: &LaunchShape, args: &Args) -> KernelResult<Option<Scalar>> {
        log::debug!("launching {} over {} work item(s)", self.id, shape.work_items());
        self.launcher.launch(shape, args)
    }
}

impl std::fmt::Debug for CompiledArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledArtifact")
            .field("id", &self.id)
            .field("fingerprint", &self.fingerprint)
            .field("toolchain", &self.toolchain)
            .field("location", &self.location)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{ExecutionSpace, ScratchSize, TeamPolicy};

    #[test]
    fn test_launch_params() {
        let range = LaunchShape::Range { begin: 2, end: 10 };
        assert_eq!(range.params(), vec![2, 10]);
        assert_eq!(range.work_items(), 8);

        let md = LaunchShape::MdRange {
            begin: vec![0, 1],
            end: vec![4, 3],
        };
        assert_eq!(md.params(), vec![0, 1, 4, 3]);
        assert_eq!(md.work_items(), 8);

        let team = TeamPolicy::new(ExecutionSpace::OpenMp, 3, 2, 1)
            .unwrap()
            .with_scratch_size(0, ScratchSize::PerTeam(64))
            .unwrap()
            .resolve()
            .unwrap();
        let shape = LaunchShape::Team(team);
        assert_eq!(shape.params(), vec![3, 2, 1, 64, 0, 0, 0]);
        assert_eq!(shape.work_items(), 3);
    }
}
