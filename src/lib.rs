//! Spatial stochastic reaction-diffusion simulation on tetrahedral meshes.
//!
//! A reaction network (species, volume reactions, diffusion rules, surface
//! reactions, voltage-dependent surface reactions) is declared once against
//! abstract compartments and patches, then instantiated on a tetrahedral
//! volume mesh (or a single well-mixed pseudo-element per compartment) and
//! advanced in continuous time by an exact kinetic Monte Carlo scheduler.
//! A distributed variant partitions the mesh across cooperating workers that
//! exchange boundary diffusion events over message-passing channels while
//! agreeing on a single global event ordering.
//!
//! The main entry points are [`Simulation`] for single-process runs,
//! [`DistSim`] for partitioned runs, and [`run_ensemble`] for repeated
//! independent trajectories in parallel.

use thiserror::Error;

pub mod distributed;
pub mod kproc;
pub mod mesh;
pub mod model;
pub mod scheduler;
pub mod solver;
pub mod statedef;

pub use distributed::{DistCheckpoint, DistSim};
pub use mesh::{MeshDesc, TetDesc, TetNeighborDesc, TriDesc};
pub use model::{Model, VRateTable};
pub use scheduler::{Checkpoint, Phase, RunStatus, SimState, StepOutcome};
pub use solver::{run_ensemble, EnsembleOutput, Simulation};

/// Avogadro constant, 1/mol.
pub const AVOGADRO: f64 = 6.022_140_76e23;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("distributed protocol failure: {0}")]
    Protocol(String),
    #[error("checkpoint serialization failure: {0}")]
    Checkpoint(String),
    #[error("thread pool error: {0}")]
    ThreadPool(String),
}

/// Dense global species index assigned by [`Model::add_species`].
pub type SpecId = usize;
/// Dense compartment index assigned by [`Model::add_comp`].
pub type CompId = usize;
/// Dense patch index assigned by [`Model::add_patch`].
pub type PatchId = usize;
/// Dense volume-reaction index assigned by [`Model::add_reac`].
pub type ReacId = usize;
/// Dense diffusion-rule index assigned by [`Model::add_diff`].
pub type DiffId = usize;
/// Dense surface-reaction index assigned by [`Model::add_sreac`].
pub type SReacId = usize;
/// Dense voltage-dependent surface-reaction index.
pub type VDepSReacId = usize;
/// Tetrahedron index within one simulation state.
pub type TetId = usize;
/// Triangle index within one simulation state.
pub type TriId = usize;

/// Number of distinct ordered draws of `count` molecules out of `value`
/// without replacement. Mass-action propensities multiply one factor per
/// reactant species.
#[inline]
pub(crate) fn falling_factorial(value: u64, count: u32) -> f64 {
    let count = count as u64;
    match count {
        0 => 1.0,
        1 => value as f64,
        2 if value >= 2 => (value * (value - 1)) as f64,
        3 if value >= 3 => (value * (value - 1) * (value - 2)) as f64,
        _ if value < count => 0.0,
        _ => {
            let mut acc = 1.0;
            for i in 0..count {
                acc *= (value - i) as f64;
            }
            acc
        }
    }
}

/// Mixes a base seed with a stream index (trajectory or worker rank) so
/// that every stream gets an independent, reproducible generator.
pub(crate) fn derive_seed(seed: Option<u64>, stream: u64) -> u64 {
    const GOLDEN_GAMMA: u64 = 0x9E3779B97F4A7C15;
    let base = seed.unwrap_or(0xDEADBEEFCAFEBABE);
    let mut z = base ^ (stream.wrapping_mul(GOLDEN_GAMMA));
    // SplitMix64
    z = z.wrapping_add(GOLDEN_GAMMA);
    let mut result = z;
    result = (result ^ (result >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    result = (result ^ (result >> 27)).wrapping_mul(0x94D049BB133111EB);
    result ^ (result >> 31)
}

#[cfg(test)]
mod tests;
