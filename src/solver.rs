//! Single-process simulation API.
//!
//! [`Simulation`] binds a resolved model to a mesh and drives one exact
//! trajectory. [`Simulation::well_mixed`] instantiates the same network on
//! one pseudo-element per compartment, which is the well-mixed direct
//! method: identical scheduler, trivial spatial representation.
//! [`run_ensemble`] runs many independent trajectories in parallel with
//! per-trajectory derived seeds.

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use crate::mesh::{MeshDesc, MeshState, TetDesc};
use crate::model::Model;
use crate::scheduler::{Checkpoint, Phase, RunStatus, SimState, StepOutcome};
use crate::statedef::Statedef;
use crate::{CompId, DiffId, PatchId, ReacId, SReacId, SimError, SpecId, TetId, TriId};

pub struct Simulation {
    state: SimState,
}

impl Simulation {
    /// Spatially resolved simulation over a tetrahedral mesh.
    pub fn new(model: &Model, mesh: &MeshDesc, seed: Option<u64>) -> Result<Self, SimError> {
        mesh.validate(model.n_comps(), model.n_patches())?;
        let statedef = Statedef::new(model)?;
        let owned: Vec<TetId> = (0..mesh.tets.len()).collect();
        let rank_of = vec![0usize; mesh.tets.len()];
        let local_of: Vec<Option<TetId>> = (0..mesh.tets.len()).map(Some).collect();
        let mesh_state = MeshState::build(&statedef, mesh, &owned, &rank_of, &local_of)?;
        Ok(Self {
            state: SimState::build(statedef, mesh_state, seed, 0),
        })
    }

    /// Well-mixed rendition of the same network: one isolated pseudo-element
    /// per compartment carrying the full compartment volume.
    pub fn well_mixed(model: &Model, comp_vols: &[f64], seed: Option<u64>) -> Result<Self, SimError> {
        if comp_vols.len() != model.n_comps() {
            return Err(SimError::Shape(format!(
                "got {} volumes for {} compartments",
                comp_vols.len(),
                model.n_comps()
            )));
        }
        let mesh = MeshDesc {
            tets: comp_vols
                .iter()
                .enumerate()
                .map(|(c, &v)| TetDesc::isolated(c, v))
                .collect(),
            tris: Vec::new(),
        };
        Self::new(model, &mesh, seed)
    }

    pub fn time(&self) -> f64 {
        self.state.time()
    }

    pub fn nsteps(&self) -> u64 {
        self.state.nsteps()
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Sum of all process propensities at the current state.
    pub fn total_propensity(&self) -> f64 {
        self.state.total_propensity()
    }

    pub fn step(&mut self) -> StepOutcome {
        self.state.step()
    }

    pub fn run_until(&mut self, t_end: f64) -> RunStatus {
        self.state.run_until(t_end)
    }

    pub fn run_steps(&mut self, n: u64) -> RunStatus {
        self.state.run_steps(n)
    }

    pub fn get_tet_count(&self, tet: TetId, spec: SpecId) -> Option<u64> {
        self.state.get_tet_count(tet, spec)
    }

    pub fn set_tet_count(&mut self, tet: TetId, spec: SpecId, n: u64) -> Result<(), SimError> {
        self.state.set_tet_count(tet, spec, n)
    }

    pub fn get_tri_count(&self, tri: TriId, spec: SpecId) -> Option<u64> {
        self.state.get_tri_count(tri, spec)
    }

    pub fn set_tri_count(&mut self, tri: TriId, spec: SpecId, n: u64) -> Result<(), SimError> {
        self.state.set_tri_count(tri, spec, n)
    }

    pub fn comp_count(&self, comp: CompId, spec: SpecId) -> Option<u64> {
        self.state.comp_count(comp, spec)
    }

    pub fn set_comp_count(&mut self, comp: CompId, spec: SpecId, n: u64) -> Result<(), SimError> {
        self.state.set_comp_count(comp, spec, n)
    }

    pub fn patch_count(&self, patch: PatchId, spec: SpecId) -> Option<u64> {
        self.state.patch_count(patch, spec)
    }

    pub fn spec_count(&self, spec: SpecId) -> u64 {
        self.state.spec_count(spec)
    }

    pub fn pick_tet_weighted(&mut self, comp: CompId) -> Option<TetId> {
        self.state.pick_tet_weighted(comp)
    }

    pub fn reac_kcst(&self, reac: ReacId) -> Result<f64, SimError> {
        self.state.reac_kcst(reac)
    }

    pub fn diff_dcst(&self, diff: DiffId) -> Result<f64, SimError> {
        self.state.diff_dcst(diff)
    }

    pub fn sreac_kcst(&self, sreac: SReacId) -> Result<f64, SimError> {
        self.state.sreac_kcst(sreac)
    }

    pub fn set_reac_kcst(&mut self, reac: ReacId, kcst: f64) -> Result<(), SimError> {
        self.state.set_reac_kcst(reac, kcst)
    }

    pub fn set_diff_dcst(&mut self, diff: DiffId, dcst: f64) -> Result<(), SimError> {
        self.state.set_diff_dcst(diff, dcst)
    }

    pub fn set_sreac_kcst(&mut self, sreac: SReacId, kcst: f64) -> Result<(), SimError> {
        self.state.set_sreac_kcst(sreac, kcst)
    }

    pub fn set_membrane_potential(&mut self, v: f64) {
        self.state.set_membrane_potential(v)
    }

    pub fn checkpoint(&self) -> Checkpoint {
        self.state.checkpoint()
    }

    pub fn restore(&mut self, cp: &Checkpoint) -> Result<(), SimError> {
        self.state.restore(cp)
    }
}

/// Final per-species totals of every trajectory, row-major
/// `[n_traj][n_species]`.
#[derive(Clone, Debug)]
pub struct EnsembleOutput {
    pub data: Vec<u64>,
    pub n_traj: usize,
    pub n_species: usize,
}

impl EnsembleOutput {
    pub fn trajectory(&self, i: usize) -> &[u64] {
        &self.data[i * self.n_species..(i + 1) * self.n_species]
    }

    /// Mean final count of one species over the ensemble.
    pub fn mean(&self, spec: SpecId) -> f64 {
        (0..self.n_traj).map(|i| self.trajectory(i)[spec] as f64).sum::<f64>()
            / self.n_traj as f64
    }
}

/// Runs `n_traj` independent trajectories of the same model and mesh to
/// `t_end`, each seeded with its own derived stream, and records the final
/// total count of every species. `init` applies initial conditions to each
/// fresh simulation before it runs.
pub fn run_ensemble<F>(
    model: &Model,
    mesh: &MeshDesc,
    t_end: f64,
    n_traj: usize,
    seed: Option<u64>,
    n_threads: Option<usize>,
    init: F,
) -> Result<EnsembleOutput, SimError>
where
    F: Fn(&mut Simulation) -> Result<(), SimError> + Sync,
{
    if n_traj == 0 {
        return Err(SimError::InvalidArgument(
            "number of trajectories must be greater than zero".into(),
        ));
    }
    if !(t_end > 0.0) {
        return Err(SimError::InvalidArgument("t_end must be positive".into()));
    }
    let n_species = model.n_species();
    let mut data = vec![0u64; n_traj * n_species];

    let simulate = |data: &mut Vec<u64>| -> Result<(), SimError> {
        data.par_chunks_mut(n_species)
            .enumerate()
            .try_for_each(|(traj, chunk)| {
                let traj_seed = crate::derive_seed(seed, traj as u64);
                let mut sim = Simulation::new(model, mesh, Some(traj_seed))?;
                init(&mut sim)?;
                sim.run_until(t_end);
                for (s, slot) in chunk.iter_mut().enumerate() {
                    *slot = sim.spec_count(s);
                }
                Ok(())
            })
    };

    match n_threads {
        Some(n) => ThreadPoolBuilder::new()
            .num_threads(n)
            .build()
            .map_err(|e| SimError::ThreadPool(e.to_string()))?
            .install(|| simulate(&mut data))?,
        None => simulate(&mut data)?,
    };

    Ok(EnsembleOutput {
        data,
        n_traj,
        n_species,
    })
}
