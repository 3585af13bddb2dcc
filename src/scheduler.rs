//! Event selection and time advance for one partition.
//!
//! [`SimState`] owns the element pools, the KProc arena and its
//! propensities, the selection tree, the clock, and the random generator.
//! One `step` realizes the direct method: an exponential waiting time drawn
//! from the total propensity, a second uniform draw selecting the firing
//! process proportional to its propensity share, then a from-scratch
//! refresh of every dependent propensity.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::kproc::{self, BoundaryDelta, KProc, KProcGraph, KProcId, KProcKind};
use crate::mesh::{Comp, MeshState, Neighbor, Patch, Tet, Tri};
use crate::statedef::{LocalSpec, Statedef};
use crate::{derive_seed, CompId, DiffId, PatchId, ReacId, SReacId, SimError, SpecId, TetId, TriId};

/// Binary sum tree over per-process propensities. Selection walks from the
/// root toward the leftmost leaf covering the cumulative target, so search
/// is logarithmic in the number of processes and ties resolve to the lowest
/// process index. Zero-propensity leaves are never selected.
#[derive(Clone, Debug)]
pub(crate) struct PropensityTree {
    len: usize,
    leaf_count: usize,
    data: Vec<f64>,
}

impl PropensityTree {
    pub fn new(len: usize) -> Self {
        let base = len.max(1);
        let leaf_count = base.next_power_of_two();
        Self {
            len,
            leaf_count,
            data: vec![0.0; leaf_count * 2],
        }
    }

    pub fn rebuild(&mut self, values: &[f64]) {
        debug_assert_eq!(values.len(), self.len);
        self.data.fill(0.0);
        for (idx, &value) in values.iter().enumerate() {
            self.data[self.leaf_count + idx] = value;
        }
        for idx in (1..self.leaf_count).rev() {
            self.data[idx] = self.data[idx << 1] + self.data[idx << 1 | 1];
        }
    }

    pub fn total(&self) -> f64 {
        self.data[1]
    }

    pub fn update(&mut self, idx: usize, value: f64) {
        let mut pos = self.leaf_count + idx;
        self.data[pos] = value;
        while pos > 1 {
            pos >>= 1;
            self.data[pos] = self.data[pos << 1] + self.data[pos << 1 | 1];
        }
    }

    pub fn select(&self, mut target: f64) -> usize {
        debug_assert!(self.len > 0);
        debug_assert!(target >= 0.0);
        let mut node = 1usize;
        while node < self.leaf_count {
            let left = self.data[node << 1];
            if left > 0.0 && target <= left {
                node <<= 1;
            } else {
                target -= left;
                node = (node << 1) | 1;
            }
        }
        let idx = node - self.leaf_count;
        if idx >= self.len {
            self.len - 1
        } else {
            idx
        }
    }
}

/// Scheduler state machine. `Halted` is terminal for the current run target
/// and cleared by the next advance call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Selecting,
    Applying,
    Halted,
}

/// Result of a single event attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Fired(KProcId),
    /// No positive propensity in this partition; nothing can fire.
    Quiescent,
}

/// Result of an advance-to-target call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// The run went quiescent before reaching its target.
    Quiescent,
}

/// Serializable full run state: clock, event counter, per-element pools in
/// stable element order, the membrane potential, and the generator's
/// internal state. Restoring reproduces bit-identical subsequent draws.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub time: f64,
    pub nsteps: u64,
    pub tet_pools: Vec<Vec<u64>>,
    pub tri_pools: Vec<Vec<u64>>,
    pub membrane_v: f64,
    rng: ChaCha8Rng,
}

impl Checkpoint {
    pub fn to_json(&self) -> Result<String, SimError> {
        serde_json::to_string(self).map_err(|e| SimError::Checkpoint(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, SimError> {
        serde_json::from_str(json).map_err(|e| SimError::Checkpoint(e.to_string()))
    }
}

/// Populations, propensities, and scheduling state of one partition (or of
/// the whole mesh in a single-process run).
pub struct SimState {
    pub(crate) statedef: Statedef,
    pub(crate) tets: Vec<Tet>,
    pub(crate) tris: Vec<Tri>,
    pub(crate) comps: Vec<Comp>,
    pub(crate) patches: Vec<Patch>,
    /// Global tet id of each local tet; the stable checkpoint ordering.
    pub(crate) tet_globals: Vec<TetId>,
    kprocs: Vec<KProc>,
    tet_spec_deps: Vec<Vec<Vec<KProcId>>>,
    tri_spec_deps: Vec<Vec<Vec<KProcId>>>,
    propensities: Vec<f64>,
    tree: PropensityTree,
    time: f64,
    nsteps: u64,
    phase: Phase,
    membrane_v: f64,
    rng: ChaCha8Rng,
}

impl SimState {
    pub(crate) fn build(
        statedef: Statedef,
        mesh: MeshState,
        seed: Option<u64>,
        stream: u64,
    ) -> Self {
        let KProcGraph {
            kprocs,
            tet_spec_deps,
            tri_spec_deps,
        } = kproc::build_kprocs(&statedef, &mesh);
        let n = kprocs.len();
        let MeshState {
            tets,
            tris,
            comps,
            patches,
            tet_globals,
        } = mesh;
        let mut state = Self {
            statedef,
            tets,
            tris,
            comps,
            patches,
            tet_globals,
            kprocs,
            tet_spec_deps,
            tri_spec_deps,
            propensities: vec![0.0; n],
            tree: PropensityTree::new(n),
            time: 0.0,
            nsteps: 0,
            phase: Phase::Idle,
            membrane_v: 0.0,
            rng: ChaCha8Rng::seed_from_u64(derive_seed(seed, stream)),
        };
        state.recompute_all();
        state
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn nsteps(&self) -> u64 {
        self.nsteps
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn n_kprocs(&self) -> usize {
        self.kprocs.len()
    }

    pub fn total_propensity(&self) -> f64 {
        self.tree.total()
    }

    fn recompute_all(&mut self) {
        for id in 0..self.kprocs.len() {
            self.propensities[id] = self.fresh_propensity(id);
        }
        self.tree.rebuild(&self.propensities);
    }

    fn fresh_propensity(&self, id: KProcId) -> f64 {
        let p = kproc::propensity(
            &self.statedef,
            &self.tets,
            &self.tris,
            self.membrane_v,
            &self.kprocs[id].kind,
        );
        if p < 0.0 {
            tracing::warn!(kproc = id, propensity = p, "negative propensity clamped to zero");
            return 0.0;
        }
        p
    }

    fn recompute_kproc(&mut self, id: KProcId) {
        let p = self.fresh_propensity(id);
        if p != self.propensities[id] {
            self.propensities[id] = p;
            self.tree.update(id, p);
        }
    }

    /// Direct-method draw: the absolute time of the next event in this
    /// partition and the process that fires, or `None` when quiescent.
    /// Consumes two uniform draws.
    pub(crate) fn select_next(&mut self) -> Option<(f64, KProcId)> {
        self.phase = Phase::Selecting;
        let total = self.tree.total();
        if total <= 0.0 {
            self.phase = Phase::Idle;
            return None;
        }
        let u1: f64 = self.rng.gen();
        let tau = -u1.ln() / total;
        let u2: f64 = self.rng.gen();
        let chosen = self.tree.select(u2 * total);
        self.phase = Phase::Idle;
        Some((self.time + tau, chosen))
    }

    /// Fires `id` at absolute time `t`: applies the state change, advances
    /// the clock, and refreshes every dependent propensity from scratch.
    pub(crate) fn fire_at(&mut self, id: KProcId, t: f64) -> Option<BoundaryDelta> {
        debug_assert!(
            self.propensities[id] > 0.0,
            "selected a zero-propensity process"
        );
        debug_assert!(t >= self.time);
        self.phase = Phase::Applying;
        let boundary = self.apply_kproc(id);
        self.time = t;
        self.nsteps += 1;
        for i in 0..self.kprocs[id].deps.len() {
            let dep = self.kprocs[id].deps[i];
            self.recompute_kproc(dep);
        }
        self.phase = Phase::Idle;
        boundary
    }

    fn apply_kproc(&mut self, id: KProcId) -> Option<BoundaryDelta> {
        match self.kprocs[id].kind {
            KProcKind::Reac { tet, reac } => {
                let comp = self.tets[tet].comp;
                for i in 0..self.statedef.compdef(comp).reac(reac).upd_local.len() {
                    let (l, d) = self.statedef.compdef(comp).reac(reac).upd_local[i];
                    apply_delta(&mut self.tets[tet].pools[l], d);
                }
                None
            }
            KProcKind::Diff { tet, diff, dir } => {
                let comp = self.tets[tet].comp;
                let lig = self.statedef.compdef(comp).diff(diff).lig_local;
                debug_assert!(self.tets[tet].pools[lig] > 0);
                self.tets[tet].pools[lig] -= 1;
                match self.tets[tet].neighbors[dir].expect("materialized without neighbor") {
                    Neighbor::Local { tet: dest, .. } => {
                        self.tets[dest].pools[lig] += 1;
                        None
                    }
                    Neighbor::Foreign { rank, tet: dest, .. } => Some(BoundaryDelta {
                        dest_rank: rank,
                        dest_tet: dest,
                        spec: self.statedef.compdef(comp).spec_l2g(lig),
                        delta: 1,
                    }),
                }
            }
            KProcKind::SReac { tri, sreac } => {
                let patch = self.tris[tri].patch;
                let inner = self.tris[tri].inner_tet;
                let nv = self.statedef.patchdef(patch).sreac(sreac).vupd_local.len();
                for i in 0..nv {
                    let (l, d) = self.statedef.patchdef(patch).sreac(sreac).vupd_local[i];
                    apply_delta(&mut self.tets[inner].pools[l], d);
                }
                let ns = self.statedef.patchdef(patch).sreac(sreac).supd_local.len();
                for i in 0..ns {
                    let (l, d) = self.statedef.patchdef(patch).sreac(sreac).supd_local[i];
                    apply_delta(&mut self.tris[tri].pools[l], d);
                }
                None
            }
            KProcKind::VDepSReac { tri, vsreac } => {
                let patch = self.tris[tri].patch;
                let inner = self.tris[tri].inner_tet;
                let nv = self
                    .statedef
                    .patchdef(patch)
                    .vdep_sreac(vsreac)
                    .inner
                    .vupd_local
                    .len();
                for i in 0..nv {
                    let (l, d) =
                        self.statedef.patchdef(patch).vdep_sreac(vsreac).inner.vupd_local[i];
                    apply_delta(&mut self.tets[inner].pools[l], d);
                }
                let ns = self
                    .statedef
                    .patchdef(patch)
                    .vdep_sreac(vsreac)
                    .inner
                    .supd_local
                    .len();
                for i in 0..ns {
                    let (l, d) =
                        self.statedef.patchdef(patch).vdep_sreac(vsreac).inner.supd_local[i];
                    apply_delta(&mut self.tris[tri].pools[l], d);
                }
                None
            }
        }
    }

    /// Fires the single next event, if any.
    pub fn step(&mut self) -> StepOutcome {
        match self.select_next() {
            None => StepOutcome::Quiescent,
            Some((t, id)) => {
                let boundary = self.fire_at(id, t);
                debug_assert!(boundary.is_none(), "boundary firing outside a partitioned run");
                StepOutcome::Fired(id)
            }
        }
    }

    /// Advances the clock to `t_end`, firing every event before it. An
    /// event drawn past the target is discarded and the clock clamps to the
    /// target, which is exact by memorylessness of the waiting times.
    pub fn run_until(&mut self, t_end: f64) -> RunStatus {
        while self.time < t_end {
            match self.select_next() {
                None => {
                    self.time = t_end;
                    self.phase = Phase::Halted;
                    return RunStatus::Quiescent;
                }
                Some((t, id)) => {
                    if t > t_end {
                        self.time = t_end;
                        break;
                    }
                    self.fire_at(id, t);
                }
            }
        }
        self.phase = Phase::Halted;
        RunStatus::Completed
    }

    /// Fires exactly `n` events, stopping early on quiescence.
    pub fn run_steps(&mut self, n: u64) -> RunStatus {
        for _ in 0..n {
            if self.step() == StepOutcome::Quiescent {
                self.phase = Phase::Halted;
                return RunStatus::Quiescent;
            }
        }
        self.phase = Phase::Halted;
        RunStatus::Completed
    }

    /// Moves the clock forward without firing (distributed rounds where
    /// another worker owns the global minimum).
    pub(crate) fn advance_clock(&mut self, t: f64) {
        debug_assert!(t >= self.time);
        self.time = t;
    }

    /// Applies a population delta sent by another worker and refreshes the
    /// propensities reading the changed pool.
    pub(crate) fn apply_external_delta(
        &mut self,
        tet: TetId,
        spec: SpecId,
        delta: i64,
    ) -> Result<(), SimError> {
        let comp = self.tets[tet].comp;
        let l = self.statedef.compdef(comp).spec_g2l(spec).ok_or_else(|| {
            SimError::Protocol(format!("boundary delta for species {spec} not local to tet"))
        })?;
        apply_delta(&mut self.tets[tet].pools[l], delta);
        self.recompute_tet_spec(tet, l);
        Ok(())
    }

    fn recompute_tet_spec(&mut self, tet: TetId, l: LocalSpec) {
        for i in 0..self.tet_spec_deps[tet][l].len() {
            let id = self.tet_spec_deps[tet][l][i];
            self.recompute_kproc(id);
        }
    }

    fn recompute_tri_spec(&mut self, tri: TriId, l: LocalSpec) {
        for i in 0..self.tri_spec_deps[tri][l].len() {
            let id = self.tri_spec_deps[tri][l][i];
            self.recompute_kproc(id);
        }
    }

    pub fn get_tet_count(&self, tet: TetId, spec: SpecId) -> Option<u64> {
        let l = self.statedef.compdef(self.tets[tet].comp).spec_g2l(spec)?;
        Some(self.tets[tet].pools[l])
    }

    /// Absolute overwrite of one pool; dependent propensities refresh
    /// immediately.
    pub fn set_tet_count(&mut self, tet: TetId, spec: SpecId, n: u64) -> Result<(), SimError> {
        let comp = self.tets[tet].comp;
        let l = self.statedef.compdef(comp).spec_g2l(spec).ok_or_else(|| {
            SimError::InvalidArgument(format!(
                "species {spec} is not declared in the compartment of tet {tet}"
            ))
        })?;
        self.tets[tet].pools[l] = n;
        self.recompute_tet_spec(tet, l);
        Ok(())
    }

    pub fn get_tri_count(&self, tri: TriId, spec: SpecId) -> Option<u64> {
        let l = self.statedef.patchdef(self.tris[tri].patch).spec_g2l(spec)?;
        Some(self.tris[tri].pools[l])
    }

    pub fn set_tri_count(&mut self, tri: TriId, spec: SpecId, n: u64) -> Result<(), SimError> {
        let patch = self.tris[tri].patch;
        let l = self.statedef.patchdef(patch).spec_g2l(spec).ok_or_else(|| {
            SimError::InvalidArgument(format!(
                "species {spec} is not declared on the patch of tri {tri}"
            ))
        })?;
        self.tris[tri].pools[l] = n;
        self.recompute_tri_spec(tri, l);
        Ok(())
    }

    /// Pooled count over all elements of a compartment; `None` when the
    /// species is not declared there.
    pub fn comp_count(&self, comp: CompId, spec: SpecId) -> Option<u64> {
        let l = self.statedef.compdef(comp).spec_g2l(spec)?;
        Some(self.comps[comp].tets.iter().map(|&t| self.tets[t].pools[l]).sum())
    }

    /// Sets a compartment's pooled count by clearing every element and
    /// placing `n` molecules one at a time into volume-weighted random
    /// elements.
    pub fn set_comp_count(&mut self, comp: CompId, spec: SpecId, n: u64) -> Result<(), SimError> {
        let l = self.statedef.compdef(comp).spec_g2l(spec).ok_or_else(|| {
            SimError::InvalidArgument(format!(
                "species {spec} is not declared in compartment {comp}"
            ))
        })?;
        if self.comps[comp].tets.is_empty() {
            return Err(SimError::InvalidArgument(format!(
                "compartment {comp} owns no elements in this partition"
            )));
        }
        let members = self.comps[comp].tets.clone();
        for &t in &members {
            self.tets[t].pools[l] = 0;
        }
        for _ in 0..n {
            let r: f64 = self.rng.gen();
            let t = self.comps[comp].pick_tet_by_vol(r).expect("non-empty compartment");
            self.tets[t].pools[l] += 1;
        }
        for &t in &members {
            self.recompute_tet_spec(t, l);
        }
        Ok(())
    }

    pub fn patch_count(&self, patch: PatchId, spec: SpecId) -> Option<u64> {
        let l = self.statedef.patchdef(patch).spec_g2l(spec)?;
        Some(self.patches[patch].tris.iter().map(|&t| self.tris[t].pools[l]).sum())
    }

    /// Total count of one species across every element of this state.
    pub fn spec_count(&self, spec: SpecId) -> u64 {
        let mut total = 0;
        for tet in &self.tets {
            if let Some(l) = self.statedef.compdef(tet.comp).spec_g2l(spec) {
                total += tet.pools[l];
            }
        }
        for tri in &self.tris {
            if let Some(l) = self.statedef.patchdef(tri.patch).spec_g2l(spec) {
                total += tri.pools[l];
            }
        }
        total
    }

    /// Volume-weighted random element of a compartment, using the
    /// simulation's own generator.
    pub fn pick_tet_weighted(&mut self, comp: CompId) -> Option<TetId> {
        let r: f64 = self.rng.gen();
        self.comps[comp].pick_tet_by_vol(r)
    }

    pub fn reac_kcst(&self, reac: ReacId) -> Result<f64, SimError> {
        let &(comp, local) = self.statedef.reac_map.get(reac).ok_or_else(|| {
            SimError::InvalidArgument(format!("unknown reaction index {reac}"))
        })?;
        Ok(self.statedef.compdef(comp).reac(local).kcst())
    }

    pub fn diff_dcst(&self, diff: DiffId) -> Result<f64, SimError> {
        let &(comp, local) = self.statedef.diff_map.get(diff).ok_or_else(|| {
            SimError::InvalidArgument(format!("unknown diffusion rule index {diff}"))
        })?;
        Ok(self.statedef.compdef(comp).diff(local).dcst())
    }

    pub fn sreac_kcst(&self, sreac: SReacId) -> Result<f64, SimError> {
        let &(patch, local) = self.statedef.sreac_map.get(sreac).ok_or_else(|| {
            SimError::InvalidArgument(format!("unknown surface reaction index {sreac}"))
        })?;
        Ok(self.statedef.patchdef(patch).sreac(local).kcst())
    }

    pub fn set_reac_kcst(&mut self, reac: ReacId, kcst: f64) -> Result<(), SimError> {
        if !(kcst >= 0.0) {
            return Err(SimError::InvalidArgument(format!(
                "rate constant must be non-negative, got {kcst}"
            )));
        }
        let &(comp, local) = self.statedef.reac_map.get(reac).ok_or_else(|| {
            SimError::InvalidArgument(format!("unknown reaction index {reac}"))
        })?;
        self.statedef.compdefs[comp].reacs[local].set_kcst(kcst);
        for id in 0..self.kprocs.len() {
            if let KProcKind::Reac { tet, reac: r } = self.kprocs[id].kind {
                if r == local && self.tets[tet].comp == comp {
                    self.recompute_kproc(id);
                }
            }
        }
        Ok(())
    }

    /// Rescales a diffusion coefficient. Directions materialized at build
    /// time rescale in place; a rule built with `dcst == 0` has no
    /// directions to rescale.
    pub fn set_diff_dcst(&mut self, diff: DiffId, dcst: f64) -> Result<(), SimError> {
        if !(dcst >= 0.0) {
            return Err(SimError::InvalidArgument(format!(
                "diffusion coefficient must be non-negative, got {dcst}"
            )));
        }
        let &(comp, local) = self.statedef.diff_map.get(diff).ok_or_else(|| {
            SimError::InvalidArgument(format!("unknown diffusion rule index {diff}"))
        })?;
        self.statedef.compdefs[comp].diffs[local].set_dcst(dcst);
        for id in 0..self.kprocs.len() {
            if let KProcKind::Diff { tet, diff: d, .. } = self.kprocs[id].kind {
                if d == local && self.tets[tet].comp == comp {
                    self.recompute_kproc(id);
                }
            }
        }
        Ok(())
    }

    pub fn set_sreac_kcst(&mut self, sreac: SReacId, kcst: f64) -> Result<(), SimError> {
        if !(kcst >= 0.0) {
            return Err(SimError::InvalidArgument(format!(
                "rate constant must be non-negative, got {kcst}"
            )));
        }
        let &(patch, local) = self.statedef.sreac_map.get(sreac).ok_or_else(|| {
            SimError::InvalidArgument(format!("unknown surface reaction index {sreac}"))
        })?;
        self.statedef.patchdefs[patch].sreacs[local].set_kcst(kcst);
        for id in 0..self.kprocs.len() {
            if let KProcKind::SReac { tri, sreac: s } = self.kprocs[id].kind {
                if s == local && self.tris[tri].patch == patch {
                    self.recompute_kproc(id);
                }
            }
        }
        Ok(())
    }

    /// Sets the membrane potential driving voltage-dependent surface
    /// reactions. The field solver producing this value is external.
    pub fn set_membrane_potential(&mut self, v: f64) {
        self.membrane_v = v;
        for id in 0..self.kprocs.len() {
            if matches!(self.kprocs[id].kind, KProcKind::VDepSReac { .. }) {
                self.recompute_kproc(id);
            }
        }
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            time: self.time,
            nsteps: self.nsteps,
            tet_pools: self.tets.iter().map(|t| t.pools.clone()).collect(),
            tri_pools: self.tris.iter().map(|t| t.pools.clone()).collect(),
            membrane_v: self.membrane_v,
            rng: self.rng.clone(),
        }
    }

    pub fn restore(&mut self, cp: &Checkpoint) -> Result<(), SimError> {
        if cp.tet_pools.len() != self.tets.len() || cp.tri_pools.len() != self.tris.len() {
            return Err(SimError::Shape(
                "checkpoint element counts do not match this simulation".into(),
            ));
        }
        for (tet, pools) in self.tets.iter_mut().zip(&cp.tet_pools) {
            if pools.len() != tet.pools.len() {
                return Err(SimError::Shape(
                    "checkpoint pool vector length does not match element".into(),
                ));
            }
            tet.pools.copy_from_slice(pools);
        }
        for (tri, pools) in self.tris.iter_mut().zip(&cp.tri_pools) {
            if pools.len() != tri.pools.len() {
                return Err(SimError::Shape(
                    "checkpoint pool vector length does not match element".into(),
                ));
            }
            tri.pools.copy_from_slice(pools);
        }
        self.time = cp.time;
        self.nsteps = cp.nsteps;
        self.membrane_v = cp.membrane_v;
        self.rng = cp.rng.clone();
        self.phase = Phase::Idle;
        self.recompute_all();
        Ok(())
    }
}

#[inline]
fn apply_delta(pool: &mut u64, delta: i64) {
    let next = *pool as i64 + delta;
    debug_assert!(next >= 0, "population count would go negative");
    *pool = next.max(0) as u64;
}
