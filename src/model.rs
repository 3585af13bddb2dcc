//! Declarative reaction-network description.
//!
//! A [`Model`] is built once through the `add_*` methods, which hand out
//! dense integer ids. Names exist only for diagnostics at build time; the
//! resolved simulation state ([`crate::statedef`]) works purely on indices,
//! so no string lookup happens on the hot path.

use crate::{CompId, DiffId, PatchId, ReacId, SReacId, SimError, SpecId, VDepSReacId};

/// One chemical species, identified by a dense global index.
#[derive(Clone, Debug)]
pub struct SpeciesModel {
    pub name: String,
}

/// A volume compartment: the species it declares and nothing else. Rules
/// reference the compartment they live in.
#[derive(Clone, Debug)]
pub struct CompModel {
    pub name: String,
    pub specs: Vec<SpecId>,
}

/// A surface patch: its surface species and the inner compartment whose
/// volume species its surface reactions may touch.
#[derive(Clone, Debug)]
pub struct PatchModel {
    pub name: String,
    pub icomp: CompId,
    pub specs: Vec<SpecId>,
}

/// Mass-action volume reaction confined to one compartment. Stoichiometries
/// are (species, multiplicity) pairs; `kcst` is in SI concentration units.
#[derive(Clone, Debug)]
pub struct ReacModel {
    pub comp: CompId,
    pub lhs: Vec<(SpecId, u32)>,
    pub rhs: Vec<(SpecId, u32)>,
    pub kcst: f64,
}

/// Fickian diffusion of one ligand within one compartment, m^2/s.
#[derive(Clone, Debug)]
pub struct DiffModel {
    pub comp: CompId,
    pub lig: SpecId,
    pub dcst: f64,
}

/// Surface reaction on a patch: volume participants live in the patch's
/// inner compartment, surface participants on the patch itself.
#[derive(Clone, Debug)]
pub struct SReacModel {
    pub patch: PatchId,
    pub vlhs: Vec<(SpecId, u32)>,
    pub slhs: Vec<(SpecId, u32)>,
    pub vrhs: Vec<(SpecId, u32)>,
    pub srhs: Vec<(SpecId, u32)>,
    pub kcst: f64,
}

/// Surface reaction whose rate constant is a function of the membrane
/// potential, given as a lookup table.
#[derive(Clone, Debug)]
pub struct VDepSReacModel {
    pub patch: PatchId,
    pub vlhs: Vec<(SpecId, u32)>,
    pub slhs: Vec<(SpecId, u32)>,
    pub vrhs: Vec<(SpecId, u32)>,
    pub srhs: Vec<(SpecId, u32)>,
    pub ktab: VRateTable,
}

/// Uniformly spaced rate table over membrane potential with clamped linear
/// interpolation between entries.
#[derive(Clone, Debug)]
pub struct VRateTable {
    vmin: f64,
    dv: f64,
    k: Vec<f64>,
}

impl VRateTable {
    pub fn new(vmin: f64, dv: f64, k: Vec<f64>) -> Result<Self, SimError> {
        if !(dv > 0.0) {
            return Err(SimError::InvalidArgument(
                "rate table voltage step must be positive".into(),
            ));
        }
        if k.is_empty() {
            return Err(SimError::InvalidArgument(
                "rate table must contain at least one entry".into(),
            ));
        }
        if k.iter().any(|&r| !(r >= 0.0)) {
            return Err(SimError::InvalidArgument(
                "rate table entries must be non-negative".into(),
            ));
        }
        Ok(Self { vmin, dv, k })
    }

    /// Rate at membrane potential `v`, clamped to the table's end entries.
    pub fn eval(&self, v: f64) -> f64 {
        let x = (v - self.vmin) / self.dv;
        if x <= 0.0 {
            return self.k[0];
        }
        let last = self.k.len() - 1;
        if x >= last as f64 {
            return self.k[last];
        }
        let lo = x.floor() as usize;
        let frac = x - lo as f64;
        self.k[lo] * (1.0 - frac) + self.k[lo + 1] * frac
    }
}

/// Immutable reaction-network description, consumed read-only when the
/// resolved state is built.
#[derive(Clone, Debug, Default)]
pub struct Model {
    pub(crate) species: Vec<SpeciesModel>,
    pub(crate) comps: Vec<CompModel>,
    pub(crate) patches: Vec<PatchModel>,
    pub(crate) reacs: Vec<ReacModel>,
    pub(crate) diffs: Vec<DiffModel>,
    pub(crate) sreacs: Vec<SReacModel>,
    pub(crate) vdep_sreacs: Vec<VDepSReacModel>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn n_species(&self) -> usize {
        self.species.len()
    }

    pub fn n_comps(&self) -> usize {
        self.comps.len()
    }

    pub fn n_patches(&self) -> usize {
        self.patches.len()
    }

    pub fn add_species(&mut self, name: &str) -> SpecId {
        self.species.push(SpeciesModel { name: name.into() });
        self.species.len() - 1
    }

    pub fn add_comp(&mut self, name: &str, specs: &[SpecId]) -> Result<CompId, SimError> {
        for &s in specs {
            self.check_spec(s)?;
        }
        self.comps.push(CompModel {
            name: name.into(),
            specs: specs.to_vec(),
        });
        Ok(self.comps.len() - 1)
    }

    pub fn add_patch(
        &mut self,
        name: &str,
        icomp: CompId,
        specs: &[SpecId],
    ) -> Result<PatchId, SimError> {
        if icomp >= self.comps.len() {
            return Err(SimError::InvalidArgument(format!(
                "patch {name} references unknown compartment {icomp}"
            )));
        }
        for &s in specs {
            self.check_spec(s)?;
        }
        self.patches.push(PatchModel {
            name: name.into(),
            icomp,
            specs: specs.to_vec(),
        });
        Ok(self.patches.len() - 1)
    }

    pub fn add_reac(
        &mut self,
        comp: CompId,
        lhs: &[(SpecId, u32)],
        rhs: &[(SpecId, u32)],
        kcst: f64,
    ) -> Result<ReacId, SimError> {
        self.check_comp_participants(comp, lhs)?;
        self.check_comp_participants(comp, rhs)?;
        check_kcst(kcst)?;
        self.reacs.push(ReacModel {
            comp,
            lhs: lhs.to_vec(),
            rhs: rhs.to_vec(),
            kcst,
        });
        Ok(self.reacs.len() - 1)
    }

    pub fn add_diff(&mut self, comp: CompId, lig: SpecId, dcst: f64) -> Result<DiffId, SimError> {
        self.check_comp_participants(comp, &[(lig, 1)])?;
        if !(dcst >= 0.0) {
            return Err(SimError::InvalidArgument(format!(
                "diffusion coefficient must be non-negative, got {dcst}"
            )));
        }
        self.diffs.push(DiffModel { comp, lig, dcst });
        Ok(self.diffs.len() - 1)
    }

    pub fn add_sreac(
        &mut self,
        patch: PatchId,
        vlhs: &[(SpecId, u32)],
        slhs: &[(SpecId, u32)],
        vrhs: &[(SpecId, u32)],
        srhs: &[(SpecId, u32)],
        kcst: f64,
    ) -> Result<SReacId, SimError> {
        let icomp = self.check_patch_participants(patch, slhs, srhs)?;
        self.check_comp_participants(icomp, vlhs)?;
        self.check_comp_participants(icomp, vrhs)?;
        check_kcst(kcst)?;
        self.sreacs.push(SReacModel {
            patch,
            vlhs: vlhs.to_vec(),
            slhs: slhs.to_vec(),
            vrhs: vrhs.to_vec(),
            srhs: srhs.to_vec(),
            kcst,
        });
        Ok(self.sreacs.len() - 1)
    }

    pub fn add_vdep_sreac(
        &mut self,
        patch: PatchId,
        vlhs: &[(SpecId, u32)],
        slhs: &[(SpecId, u32)],
        vrhs: &[(SpecId, u32)],
        srhs: &[(SpecId, u32)],
        ktab: VRateTable,
    ) -> Result<VDepSReacId, SimError> {
        let icomp = self.check_patch_participants(patch, slhs, srhs)?;
        self.check_comp_participants(icomp, vlhs)?;
        self.check_comp_participants(icomp, vrhs)?;
        self.vdep_sreacs.push(VDepSReacModel {
            patch,
            vlhs: vlhs.to_vec(),
            slhs: slhs.to_vec(),
            vrhs: vrhs.to_vec(),
            srhs: srhs.to_vec(),
            ktab,
        });
        Ok(self.vdep_sreacs.len() - 1)
    }

    fn check_spec(&self, s: SpecId) -> Result<(), SimError> {
        if s >= self.species.len() {
            return Err(SimError::InvalidArgument(format!(
                "species index {s} exceeds number of species {}",
                self.species.len()
            )));
        }
        Ok(())
    }

    fn check_comp_participants(
        &self,
        comp: CompId,
        side: &[(SpecId, u32)],
    ) -> Result<(), SimError> {
        let cm = self.comps.get(comp).ok_or_else(|| {
            SimError::InvalidArgument(format!("unknown compartment index {comp}"))
        })?;
        for &(s, _) in side {
            self.check_spec(s)?;
            if !cm.specs.contains(&s) {
                return Err(SimError::InvalidArgument(format!(
                    "species {s} is not declared in compartment '{}'",
                    cm.name
                )));
            }
        }
        Ok(())
    }

    fn check_patch_participants(
        &self,
        patch: PatchId,
        slhs: &[(SpecId, u32)],
        srhs: &[(SpecId, u32)],
    ) -> Result<CompId, SimError> {
        let pm = self
            .patches
            .get(patch)
            .ok_or_else(|| SimError::InvalidArgument(format!("unknown patch index {patch}")))?;
        for &(s, _) in slhs.iter().chain(srhs) {
            self.check_spec(s)?;
            if !pm.specs.contains(&s) {
                return Err(SimError::InvalidArgument(format!(
                    "species {s} is not declared on patch '{}'",
                    pm.name
                )));
            }
        }
        Ok(pm.icomp)
    }
}

fn check_kcst(kcst: f64) -> Result<(), SimError> {
    if !(kcst >= 0.0) {
        return Err(SimError::InvalidArgument(format!(
            "rate constant must be non-negative, got {kcst}"
        )));
    }
    Ok(())
}
