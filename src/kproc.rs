//! Kinetic processes: the atomic schedulable events.
//!
//! Every reaction instance, diffusion direction, and surface process bound
//! to a concrete mesh element is one [`KProc`] in a dense arena indexed by
//! [`KProcId`]. Dependency edges are index lists: an edge from a fired
//! process to every process whose propensity reads a species the firing
//! changes. Propensities are pure functions of rate constants, the owning
//! element's pools, and (for diffusion) the geometric coupling to the
//! target neighbor.

use crate::mesh::{MeshState, Neighbor, Tet, Tri};
use crate::statedef::{LocalSpec, Statedef};
use crate::{falling_factorial, SpecId, TetId, TriId, AVOGADRO};

pub type KProcId = usize;

/// Process kind plus its binding to a mesh element. Rule indices are local
/// to the element's compartment or patch def.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KProcKind {
    /// Volume reaction `reac` of the compartment of tet `tet`.
    Reac { tet: TetId, reac: usize },
    /// Diffusion rule `diff` out of tet `tet` through face `dir`.
    Diff { tet: TetId, diff: usize, dir: usize },
    /// Surface reaction `sreac` of the patch of tri `tri`.
    SReac { tri: TriId, sreac: usize },
    /// Voltage-dependent surface reaction of the patch of tri `tri`.
    VDepSReac { tri: TriId, vsreac: usize },
}

#[derive(Clone, Debug)]
pub struct KProc {
    pub kind: KProcKind,
    /// Processes whose propensity must be recomputed after this one fires.
    pub deps: Vec<KProcId>,
}

/// A diffusion firing whose destination element is owned by another worker.
/// The owning worker applies the delta and refreshes its propensities.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundaryDelta {
    pub dest_rank: usize,
    /// Tet index local to the destination worker.
    pub dest_tet: TetId,
    pub spec: SpecId,
    pub delta: i64,
}

/// KProc arena plus the reverse lookup from (element, local species) to the
/// processes reading that pool, used for dependency edges and for external
/// count mutations.
pub(crate) struct KProcGraph {
    pub kprocs: Vec<KProc>,
    pub tet_spec_deps: Vec<Vec<Vec<KProcId>>>,
    pub tri_spec_deps: Vec<Vec<Vec<KProcId>>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ElemSpec {
    Tet(TetId, LocalSpec),
    Tri(TriId, LocalSpec),
}

fn reads(statedef: &Statedef, mesh: &MeshState, kind: &KProcKind) -> Vec<ElemSpec> {
    match *kind {
        KProcKind::Reac { tet, reac } => {
            let cdef = statedef.compdef(mesh.tets[tet].comp);
            cdef.reac(reac)
                .lhs_local
                .iter()
                .map(|&(l, _)| ElemSpec::Tet(tet, l))
                .collect()
        }
        KProcKind::Diff { tet, diff, .. } => {
            let cdef = statedef.compdef(mesh.tets[tet].comp);
            vec![ElemSpec::Tet(tet, cdef.diff(diff).lig_local)]
        }
        KProcKind::SReac { tri, sreac } => {
            let pdef = statedef.patchdef(mesh.tris[tri].patch);
            let sdef = pdef.sreac(sreac);
            sreac_reads(&sdef.vlhs_local, &sdef.slhs_local, tri, mesh.tris[tri].inner_tet)
        }
        KProcKind::VDepSReac { tri, vsreac } => {
            let pdef = statedef.patchdef(mesh.tris[tri].patch);
            let sdef = &pdef.vdep_sreac(vsreac).inner;
            sreac_reads(&sdef.vlhs_local, &sdef.slhs_local, tri, mesh.tris[tri].inner_tet)
        }
    }
}

fn sreac_reads(
    vlhs: &[(LocalSpec, u32)],
    slhs: &[(LocalSpec, u32)],
    tri: TriId,
    inner_tet: TetId,
) -> Vec<ElemSpec> {
    vlhs.iter()
        .map(|&(l, _)| ElemSpec::Tet(inner_tet, l))
        .chain(slhs.iter().map(|&(l, _)| ElemSpec::Tri(tri, l)))
        .collect()
}

fn writes(statedef: &Statedef, mesh: &MeshState, kind: &KProcKind) -> Vec<ElemSpec> {
    match *kind {
        KProcKind::Reac { tet, reac } => {
            let cdef = statedef.compdef(mesh.tets[tet].comp);
            cdef.reac(reac)
                .upd_local
                .iter()
                .map(|&(l, _)| ElemSpec::Tet(tet, l))
                .collect()
        }
        KProcKind::Diff { tet, diff, dir } => {
            let cdef = statedef.compdef(mesh.tets[tet].comp);
            let lig = cdef.diff(diff).lig_local;
            let mut out = vec![ElemSpec::Tet(tet, lig)];
            if let Some(Neighbor::Local { tet: dest, .. }) = mesh.tets[tet].neighbors[dir] {
                out.push(ElemSpec::Tet(dest, lig));
            }
            out
        }
        KProcKind::SReac { tri, sreac } => {
            let pdef = statedef.patchdef(mesh.tris[tri].patch);
            let sdef = pdef.sreac(sreac);
            sreac_writes(&sdef.vupd_local, &sdef.supd_local, tri, mesh.tris[tri].inner_tet)
        }
        KProcKind::VDepSReac { tri, vsreac } => {
            let pdef = statedef.patchdef(mesh.tris[tri].patch);
            let sdef = &pdef.vdep_sreac(vsreac).inner;
            sreac_writes(&sdef.vupd_local, &sdef.supd_local, tri, mesh.tris[tri].inner_tet)
        }
    }
}

fn sreac_writes(
    vupd: &[(LocalSpec, i64)],
    supd: &[(LocalSpec, i64)],
    tri: TriId,
    inner_tet: TetId,
) -> Vec<ElemSpec> {
    vupd.iter()
        .map(|&(l, _)| ElemSpec::Tet(inner_tet, l))
        .chain(supd.iter().map(|&(l, _)| ElemSpec::Tri(tri, l)))
        .collect()
}

/// Materializes one KProc per (element, rule) binding and wires the
/// dependency graph. Diffusion directions are materialized only for a
/// connected same-compartment neighbor and a positive diffusion
/// coefficient.
pub(crate) fn build_kprocs(statedef: &Statedef, mesh: &MeshState) -> KProcGraph {
    let mut kinds: Vec<KProcKind> = Vec::new();
    for (t, tet) in mesh.tets.iter().enumerate() {
        let cdef = statedef.compdef(tet.comp);
        for r in 0..cdef.reacs.len() {
            kinds.push(KProcKind::Reac { tet: t, reac: r });
        }
        for d in 0..cdef.diffs.len() {
            if cdef.diff(d).dcst() <= 0.0 {
                continue;
            }
            for dir in 0..4 {
                if tet.neighbors[dir].is_some() {
                    kinds.push(KProcKind::Diff {
                        tet: t,
                        diff: d,
                        dir,
                    });
                }
            }
        }
    }
    for (t, tri) in mesh.tris.iter().enumerate() {
        let pdef = statedef.patchdef(tri.patch);
        for s in 0..pdef.sreacs.len() {
            kinds.push(KProcKind::SReac { tri: t, sreac: s });
        }
        for v in 0..pdef.vdep_sreacs.len() {
            kinds.push(KProcKind::VDepSReac { tri: t, vsreac: v });
        }
    }

    // Reverse lookup: (element, local species) -> processes reading it.
    let mut tet_spec_deps: Vec<Vec<Vec<KProcId>>> = mesh
        .tets
        .iter()
        .map(|t| vec![Vec::new(); t.pools.len()])
        .collect();
    let mut tri_spec_deps: Vec<Vec<Vec<KProcId>>> = mesh
        .tris
        .iter()
        .map(|t| vec![Vec::new(); t.pools.len()])
        .collect();
    for (id, kind) in kinds.iter().enumerate() {
        for es in reads(statedef, mesh, kind) {
            match es {
                ElemSpec::Tet(t, l) => tet_spec_deps[t][l].push(id),
                ElemSpec::Tri(t, l) => tri_spec_deps[t][l].push(id),
            }
        }
    }

    // Stamp-marked union of dependents over everything each process writes.
    // Self always comes first so a firing refreshes its own propensity.
    let mut kprocs: Vec<KProc> = Vec::with_capacity(kinds.len());
    let mut visit_markers = vec![0usize; kinds.len()];
    let mut stamp = 1usize;
    for (id, kind) in kinds.iter().enumerate() {
        if stamp == usize::MAX {
            visit_markers.fill(0);
            stamp = 1;
        }
        let mark = stamp;
        stamp += 1;

        let mut deps = vec![id];
        visit_markers[id] = mark;
        for es in writes(statedef, mesh, kind) {
            let dependents = match es {
                ElemSpec::Tet(t, l) => &tet_spec_deps[t][l],
                ElemSpec::Tri(t, l) => &tri_spec_deps[t][l],
            };
            for &dep in dependents {
                if visit_markers[dep] != mark {
                    visit_markers[dep] = mark;
                    deps.push(dep);
                }
            }
        }
        kprocs.push(KProc { kind: *kind, deps });
    }

    KProcGraph {
        kprocs,
        tet_spec_deps,
        tri_spec_deps,
    }
}

/// Concentration-to-count scaling of a mass-action rate constant for a
/// reaction of the given order in a volume of `vol` m^3.
fn ccst(kcst: f64, vol: f64, order: u32) -> f64 {
    let vscale = 1.0e3 * vol * AVOGADRO;
    kcst * vscale.powi(1 - order as i32)
}

fn h_mu(lhs: &[(LocalSpec, u32)], pools: &[u64]) -> f64 {
    let mut h = 1.0;
    for &(l, n) in lhs {
        h *= falling_factorial(pools[l], n);
    }
    h
}

/// Propensity of one process, recomputed from scratch against the current
/// element pools. Always a function of the full current state, never an
/// incremental update.
pub(crate) fn propensity(
    statedef: &Statedef,
    tets: &[Tet],
    tris: &[Tri],
    membrane_v: f64,
    kind: &KProcKind,
) -> f64 {
    match *kind {
        KProcKind::Reac { tet, reac } => {
            let t = &tets[tet];
            let rdef = statedef.compdef(t.comp).reac(reac);
            ccst(rdef.kcst(), t.vol, rdef.order()) * h_mu(&rdef.lhs_local, &t.pools)
        }
        KProcKind::Diff { tet, diff, dir } => {
            let t = &tets[tet];
            let ddef = statedef.compdef(t.comp).diff(diff);
            let scale = t.neighbors[dir].expect("diffusion direction without neighbor").scale();
            ddef.dcst() * scale * t.pools[ddef.lig_local] as f64
        }
        KProcKind::SReac { tri, sreac } => {
            let s = &tris[tri];
            let sdef = statedef.patchdef(s.patch).sreac(sreac);
            let t = &tets[s.inner_tet];
            ccst(sdef.kcst(), t.vol, sdef.order())
                * h_mu(&sdef.vlhs_local, &t.pools)
                * h_mu(&sdef.slhs_local, &s.pools)
        }
        KProcKind::VDepSReac { tri, vsreac } => {
            let s = &tris[tri];
            let vdef = statedef.patchdef(s.patch).vdep_sreac(vsreac);
            let t = &tets[s.inner_tet];
            ccst(vdef.kcst_at(membrane_v), t.vol, vdef.order())
                * h_mu(&vdef.inner.vlhs_local, &t.pools)
                * h_mu(&vdef.inner.slhs_local, &s.pools)
        }
    }
}
