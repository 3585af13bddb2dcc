//! Resolved, per-run views of the reaction network.
//!
//! [`Statedef`] is built once from a [`Model`] and is read-only afterward,
//! except for rate constants which may be rescaled at runtime. Every rule
//! def carries a dependency array over the global species set: one [`Dep`]
//! per species saying whether a change in that species' count can move the
//! rule's propensity. Dependency queries are only valid after `setup()`;
//! querying earlier is a caller bug and fails fast.

use crate::model::{DiffModel, Model, ReacModel, VRateTable};
use crate::{CompId, SimError, SpecId};

/// Dependency classification of a (rule, species) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dep {
    None,
    Stoich,
}

/// Local species index within one compartment or patch.
pub type LocalSpec = usize;

fn stoich_upd(lhs: &[(SpecId, u32)], rhs: &[(SpecId, u32)]) -> Vec<(SpecId, i64)> {
    let mut upd: Vec<(SpecId, i64)> = Vec::new();
    let mut add = |s: SpecId, d: i64| {
        if let Some(entry) = upd.iter_mut().find(|(spec, _)| *spec == s) {
            entry.1 += d;
        } else {
            upd.push((s, d));
        }
    };
    for &(s, n) in lhs {
        add(s, -(n as i64));
    }
    for &(s, n) in rhs {
        add(s, n as i64);
    }
    upd.retain(|&(_, d)| d != 0);
    upd
}

fn accumulate_lhs(lhs: &[(SpecId, u32)]) -> Vec<(SpecId, u32)> {
    let mut out: Vec<(SpecId, u32)> = Vec::new();
    for &(s, n) in lhs {
        if let Some(entry) = out.iter_mut().find(|(spec, _)| *spec == s) {
            entry.1 += n;
        } else {
            out.push((s, n));
        }
    }
    out
}

/// Resolved mass-action volume reaction.
#[derive(Clone, Debug)]
pub struct Reacdef {
    kcst: f64,
    order: u32,
    /// Accumulated lhs over local species indices of the owning compartment.
    pub(crate) lhs_local: Vec<(LocalSpec, u32)>,
    /// Net population change per local species on firing.
    pub(crate) upd_local: Vec<(LocalSpec, i64)>,
    lhs: Vec<(SpecId, u32)>,
    dep: Vec<Dep>,
    setup_done: bool,
}

impl Reacdef {
    fn new(nspecs: usize, rm: &ReacModel, cdef: &Compdef) -> Self {
        let lhs = accumulate_lhs(&rm.lhs);
        let order = lhs.iter().map(|&(_, n)| n).sum();
        let lhs_local = lhs
            .iter()
            .map(|&(s, n)| (cdef.spec_g2l(s).expect("validated at model build"), n))
            .collect();
        let upd_local = stoich_upd(&rm.lhs, &rm.rhs)
            .into_iter()
            .map(|(s, d)| (cdef.spec_g2l(s).expect("validated at model build"), d))
            .collect();
        Self {
            kcst: rm.kcst,
            order,
            lhs_local,
            upd_local,
            lhs,
            dep: vec![Dep::None; nspecs],
            setup_done: false,
        }
    }

    fn setup(&mut self) {
        assert!(!self.setup_done, "Reacdef::setup() must run exactly once");
        for &(s, _) in &self.lhs {
            self.dep[s] = Dep::Stoich;
        }
        self.setup_done = true;
    }

    /// Dependency of this reaction's propensity on global species `gidx`.
    pub fn dep(&self, gidx: SpecId) -> Dep {
        assert!(self.setup_done, "dependency query before setup()");
        self.dep[gidx]
    }

    /// Whether global species `gidx` participates in this reaction at all.
    pub fn req(&self, gidx: SpecId) -> bool {
        self.dep(gidx) != Dep::None
    }

    pub fn kcst(&self) -> f64 {
        self.kcst
    }

    /// Rescales the rate constant. The dependency array is unaffected.
    pub fn set_kcst(&mut self, kcst: f64) {
        assert!(kcst >= 0.0, "rate constant must be non-negative");
        self.kcst = kcst;
    }

    /// Total lhs stoichiometry, driving the concentration-to-count scaling
    /// of the propensity constant.
    pub fn order(&self) -> u32 {
        self.order
    }
}

/// Resolved diffusion rule.
#[derive(Clone, Debug)]
pub struct Diffdef {
    dcst: f64,
    lig: SpecId,
    pub(crate) lig_local: LocalSpec,
    dep: Vec<Dep>,
    setup_done: bool,
}

impl Diffdef {
    fn new(nspecs: usize, dm: &DiffModel, cdef: &Compdef) -> Self {
        Self {
            dcst: dm.dcst,
            lig: dm.lig,
            lig_local: cdef.spec_g2l(dm.lig).expect("validated at model build"),
            dep: vec![Dep::None; nspecs],
            setup_done: false,
        }
    }

    fn setup(&mut self) {
        assert!(!self.setup_done, "Diffdef::setup() must run exactly once");
        self.dep[self.lig] = Dep::Stoich;
        self.setup_done = true;
    }

    pub fn dep(&self, gidx: SpecId) -> Dep {
        assert!(self.setup_done, "dependency query before setup()");
        self.dep[gidx]
    }

    pub fn req(&self, gidx: SpecId) -> bool {
        self.dep(gidx) != Dep::None
    }

    pub fn lig(&self) -> SpecId {
        self.lig
    }

    /// Re-binds the diffusing ligand. Only legal before `setup()`.
    pub fn set_lig(&mut self, gidx: SpecId, cdef: &Compdef) {
        assert!(!self.setup_done, "set_lig() after setup() is disallowed");
        self.lig = gidx;
        self.lig_local = cdef
            .spec_g2l(gidx)
            .expect("ligand must be declared in the compartment");
    }

    pub fn dcst(&self) -> f64 {
        self.dcst
    }

    pub fn set_dcst(&mut self, dcst: f64) {
        assert!(dcst >= 0.0, "diffusion coefficient must be non-negative");
        self.dcst = dcst;
    }
}

/// Resolved surface reaction; volume participants are local to the patch's
/// inner compartment, surface participants local to the patch.
#[derive(Clone, Debug)]
pub struct SReacdef {
    kcst: f64,
    order: u32,
    pub(crate) vlhs_local: Vec<(LocalSpec, u32)>,
    pub(crate) slhs_local: Vec<(LocalSpec, u32)>,
    pub(crate) vupd_local: Vec<(LocalSpec, i64)>,
    pub(crate) supd_local: Vec<(LocalSpec, i64)>,
    vlhs: Vec<(SpecId, u32)>,
    slhs: Vec<(SpecId, u32)>,
    dep_v: Vec<Dep>,
    dep_s: Vec<Dep>,
    setup_done: bool,
}

struct SReacSides<'a> {
    vlhs: &'a [(SpecId, u32)],
    slhs: &'a [(SpecId, u32)],
    vrhs: &'a [(SpecId, u32)],
    srhs: &'a [(SpecId, u32)],
}

impl SReacdef {
    fn new(nspecs: usize, sides: SReacSides<'_>, pdef: &Patchdef, icomp: &Compdef) -> Self {
        let vlhs = accumulate_lhs(sides.vlhs);
        let slhs = accumulate_lhs(sides.slhs);
        let order = vlhs.iter().chain(&slhs).map(|&(_, n)| n).sum();
        let to_local = |side: &[(SpecId, u32)], g2l: &dyn Fn(SpecId) -> Option<LocalSpec>| {
            side.iter()
                .map(|&(s, n)| (g2l(s).expect("validated at model build"), n))
                .collect::<Vec<_>>()
        };
        let vlhs_local = to_local(&vlhs, &|s| icomp.spec_g2l(s));
        let slhs_local = to_local(&slhs, &|s| pdef.spec_g2l(s));
        let vupd_local = stoich_upd(sides.vlhs, sides.vrhs)
            .into_iter()
            .map(|(s, d)| (icomp.spec_g2l(s).expect("validated at model build"), d))
            .collect();
        let supd_local = stoich_upd(sides.slhs, sides.srhs)
            .into_iter()
            .map(|(s, d)| (pdef.spec_g2l(s).expect("validated at model build"), d))
            .collect();
        Self {
            kcst: 0.0,
            order,
            vlhs_local,
            slhs_local,
            vupd_local,
            supd_local,
            vlhs,
            slhs,
            dep_v: vec![Dep::None; nspecs],
            dep_s: vec![Dep::None; nspecs],
            setup_done: false,
        }
    }

    fn setup(&mut self) {
        assert!(!self.setup_done, "SReacdef::setup() must run exactly once");
        for &(s, _) in &self.vlhs {
            self.dep_v[s] = Dep::Stoich;
        }
        for &(s, _) in &self.slhs {
            self.dep_s[s] = Dep::Stoich;
        }
        self.setup_done = true;
    }

    /// Dependency on a volume species of the inner compartment.
    pub fn dep_v(&self, gidx: SpecId) -> Dep {
        assert!(self.setup_done, "dependency query before setup()");
        self.dep_v[gidx]
    }

    /// Dependency on a surface species of the patch.
    pub fn dep_s(&self, gidx: SpecId) -> Dep {
        assert!(self.setup_done, "dependency query before setup()");
        self.dep_s[gidx]
    }

    pub fn kcst(&self) -> f64 {
        self.kcst
    }

    pub fn set_kcst(&mut self, kcst: f64) {
        assert!(kcst >= 0.0, "rate constant must be non-negative");
        self.kcst = kcst;
    }

    pub fn order(&self) -> u32 {
        self.order
    }
}

/// Resolved voltage-dependent surface reaction. Identical shape to
/// [`SReacdef`] but the rate constant is read from a potential-indexed
/// table at propensity time.
#[derive(Clone, Debug)]
pub struct VDepSReacdef {
    pub(crate) inner: SReacdef,
    ktab: VRateTable,
}

impl VDepSReacdef {
    pub fn kcst_at(&self, v: f64) -> f64 {
        self.ktab.eval(v)
    }

    pub fn dep_v(&self, gidx: SpecId) -> Dep {
        self.inner.dep_v(gidx)
    }

    pub fn dep_s(&self, gidx: SpecId) -> Dep {
        self.inner.dep_s(gidx)
    }

    pub fn order(&self) -> u32 {
        self.inner.order()
    }
}

/// Per-run view of one compartment: dense local species indices and the
/// rules that run in it.
#[derive(Clone, Debug)]
pub struct Compdef {
    spec_g2l: Vec<Option<LocalSpec>>,
    spec_l2g: Vec<SpecId>,
    pub(crate) reacs: Vec<Reacdef>,
    pub(crate) diffs: Vec<Diffdef>,
}

impl Compdef {
    fn new(nspecs: usize, specs: &[SpecId]) -> Self {
        let mut spec_g2l = vec![None; nspecs];
        let mut spec_l2g = Vec::with_capacity(specs.len());
        for &g in specs {
            if spec_g2l[g].is_none() {
                spec_g2l[g] = Some(spec_l2g.len());
                spec_l2g.push(g);
            }
        }
        Self {
            spec_g2l,
            spec_l2g,
            reacs: Vec::new(),
            diffs: Vec::new(),
        }
    }

    /// Dense local index of global species `gidx`, or `None` when the
    /// species is not declared here. Never a silent zero.
    pub fn spec_g2l(&self, gidx: SpecId) -> Option<LocalSpec> {
        assert!(gidx < self.spec_g2l.len(), "species index out of range");
        self.spec_g2l[gidx]
    }

    pub fn spec_l2g(&self, lidx: LocalSpec) -> SpecId {
        self.spec_l2g[lidx]
    }

    pub fn n_local_specs(&self) -> usize {
        self.spec_l2g.len()
    }

    pub fn reac(&self, lidx: usize) -> &Reacdef {
        &self.reacs[lidx]
    }

    pub fn diff(&self, lidx: usize) -> &Diffdef {
        &self.diffs[lidx]
    }
}

/// Per-run view of one patch.
#[derive(Clone, Debug)]
pub struct Patchdef {
    spec_g2l: Vec<Option<LocalSpec>>,
    spec_l2g: Vec<SpecId>,
    pub(crate) icomp: CompId,
    pub(crate) sreacs: Vec<SReacdef>,
    pub(crate) vdep_sreacs: Vec<VDepSReacdef>,
}

impl Patchdef {
    fn new(nspecs: usize, icomp: CompId, specs: &[SpecId]) -> Self {
        let mut spec_g2l = vec![None; nspecs];
        let mut spec_l2g = Vec::with_capacity(specs.len());
        for &g in specs {
            if spec_g2l[g].is_none() {
                spec_g2l[g] = Some(spec_l2g.len());
                spec_l2g.push(g);
            }
        }
        Self {
            spec_g2l,
            spec_l2g,
            icomp,
            sreacs: Vec::new(),
            vdep_sreacs: Vec::new(),
        }
    }

    pub fn spec_g2l(&self, gidx: SpecId) -> Option<LocalSpec> {
        assert!(gidx < self.spec_g2l.len(), "species index out of range");
        self.spec_g2l[gidx]
    }

    pub fn spec_l2g(&self, lidx: LocalSpec) -> SpecId {
        self.spec_l2g[lidx]
    }

    pub fn n_local_specs(&self) -> usize {
        self.spec_l2g.len()
    }

    pub fn icomp(&self) -> CompId {
        self.icomp
    }

    pub fn sreac(&self, lidx: usize) -> &SReacdef {
        &self.sreacs[lidx]
    }

    pub fn vdep_sreac(&self, lidx: usize) -> &VDepSReacdef {
        &self.vdep_sreacs[lidx]
    }
}

/// Fully resolved model: all defs, set up and ready for dependency queries,
/// plus maps from the model's global rule ids to (container, local) slots.
#[derive(Clone, Debug)]
pub struct Statedef {
    nspecs: usize,
    pub(crate) compdefs: Vec<Compdef>,
    pub(crate) patchdefs: Vec<Patchdef>,
    /// ReacId -> (compartment, local reacdef index).
    pub(crate) reac_map: Vec<(CompId, usize)>,
    /// DiffId -> (compartment, local diffdef index).
    pub(crate) diff_map: Vec<(CompId, usize)>,
    /// SReacId -> (patch, local sreacdef index).
    pub(crate) sreac_map: Vec<(usize, usize)>,
    /// VDepSReacId -> (patch, local vdepsreacdef index).
    pub(crate) vdep_map: Vec<(usize, usize)>,
}

impl Statedef {
    pub fn new(model: &Model) -> Result<Self, SimError> {
        let nspecs = model.species.len();
        if nspecs == 0 {
            return Err(SimError::InvalidArgument(
                "model declares no species".into(),
            ));
        }
        if model.comps.is_empty() {
            return Err(SimError::InvalidArgument(
                "model declares no compartments".into(),
            ));
        }

        let mut compdefs: Vec<Compdef> = model
            .comps
            .iter()
            .map(|cm| Compdef::new(nspecs, &cm.specs))
            .collect();
        let mut patchdefs: Vec<Patchdef> = model
            .patches
            .iter()
            .map(|pm| Patchdef::new(nspecs, pm.icomp, &pm.specs))
            .collect();

        let mut reac_map = Vec::with_capacity(model.reacs.len());
        for rm in &model.reacs {
            let cdef = &compdefs[rm.comp];
            let rdef = Reacdef::new(nspecs, rm, cdef);
            reac_map.push((rm.comp, compdefs[rm.comp].reacs.len()));
            compdefs[rm.comp].reacs.push(rdef);
        }

        let mut diff_map = Vec::with_capacity(model.diffs.len());
        for dm in &model.diffs {
            let cdef = &compdefs[dm.comp];
            let ddef = Diffdef::new(nspecs, dm, cdef);
            diff_map.push((dm.comp, compdefs[dm.comp].diffs.len()));
            compdefs[dm.comp].diffs.push(ddef);
        }

        let mut sreac_map = Vec::with_capacity(model.sreacs.len());
        for sm in &model.sreacs {
            let pdef = &patchdefs[sm.patch];
            let icomp = pdef.icomp;
            let mut sdef = SReacdef::new(
                nspecs,
                SReacSides {
                    vlhs: &sm.vlhs,
                    slhs: &sm.slhs,
                    vrhs: &sm.vrhs,
                    srhs: &sm.srhs,
                },
                pdef,
                &compdefs[icomp],
            );
            sdef.kcst = sm.kcst;
            sreac_map.push((sm.patch, patchdefs[sm.patch].sreacs.len()));
            patchdefs[sm.patch].sreacs.push(sdef);
        }

        let mut vdep_map = Vec::with_capacity(model.vdep_sreacs.len());
        for vm in &model.vdep_sreacs {
            let pdef = &patchdefs[vm.patch];
            let icomp = pdef.icomp;
            let inner = SReacdef::new(
                nspecs,
                SReacSides {
                    vlhs: &vm.vlhs,
                    slhs: &vm.slhs,
                    vrhs: &vm.vrhs,
                    srhs: &vm.srhs,
                },
                pdef,
                &compdefs[icomp],
            );
            let vdef = VDepSReacdef {
                inner,
                ktab: vm.ktab.clone(),
            };
            vdep_map.push((vm.patch, patchdefs[vm.patch].vdep_sreacs.len()));
            patchdefs[vm.patch].vdep_sreacs.push(vdef);
        }

        // Resolution pass complete; run every def's setup exactly once.
        for cdef in &mut compdefs {
            for r in &mut cdef.reacs {
                r.setup();
            }
            for d in &mut cdef.diffs {
                d.setup();
            }
        }
        for pdef in &mut patchdefs {
            for s in &mut pdef.sreacs {
                s.setup();
            }
            for v in &mut pdef.vdep_sreacs {
                v.inner.setup();
            }
        }

        Ok(Self {
            nspecs,
            compdefs,
            patchdefs,
            reac_map,
            diff_map,
            sreac_map,
            vdep_map,
        })
    }

    pub fn n_specs(&self) -> usize {
        self.nspecs
    }

    pub fn compdef(&self, c: CompId) -> &Compdef {
        &self.compdefs[c]
    }

    pub fn patchdef(&self, p: usize) -> &Patchdef {
        &self.patchdefs[p]
    }
}
