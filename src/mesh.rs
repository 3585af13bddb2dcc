//! Mesh element state: tetrahedron and triangle pools, neighbor couplings,
//! and the compartment/patch aggregates used for volume-weighted sampling.
//!
//! Geometry itself (vertex positions, mesh file formats) is out of scope;
//! the engine consumes a [`MeshDesc`] of per-element measures, neighbor
//! links with face area and barycenter distance, and container membership.

use crate::statedef::Statedef;
use crate::{CompId, PatchId, SimError, TetId, TriId};

/// Connection from one tetrahedron face to its neighbor: shared face area
/// and barycenter-to-barycenter distance, both in SI units.
#[derive(Clone, Copy, Debug)]
pub struct TetNeighborDesc {
    pub tet: TetId,
    pub area: f64,
    pub dist: f64,
}

/// One tetrahedron of the input mesh.
#[derive(Clone, Debug)]
pub struct TetDesc {
    pub comp: CompId,
    pub vol: f64,
    pub neighbors: [Option<TetNeighborDesc>; 4],
}

impl TetDesc {
    /// Isolated tetrahedron with no neighbors.
    pub fn isolated(comp: CompId, vol: f64) -> Self {
        Self {
            comp,
            vol,
            neighbors: [None; 4],
        }
    }
}

/// One surface triangle, bound to the tetrahedron on its inner side.
#[derive(Clone, Debug)]
pub struct TriDesc {
    pub patch: PatchId,
    pub area: f64,
    pub inner_tet: TetId,
}

/// Discretized spatial domain handed to the engine.
#[derive(Clone, Debug, Default)]
pub struct MeshDesc {
    pub tets: Vec<TetDesc>,
    pub tris: Vec<TriDesc>,
}

impl MeshDesc {
    pub fn validate(&self, n_comps: usize, n_patches: usize) -> Result<(), SimError> {
        if self.tets.is_empty() {
            return Err(SimError::InvalidArgument(
                "mesh contains no tetrahedra".into(),
            ));
        }
        for (i, td) in self.tets.iter().enumerate() {
            if td.comp >= n_comps {
                return Err(SimError::InvalidArgument(format!(
                    "tet {i} references unknown compartment {}",
                    td.comp
                )));
            }
            if !(td.vol > 0.0) {
                return Err(SimError::InvalidArgument(format!(
                    "tet {i} volume must be positive, got {}",
                    td.vol
                )));
            }
            for nb in td.neighbors.iter().flatten() {
                if nb.tet >= self.tets.len() {
                    return Err(SimError::Shape(format!(
                        "tet {i} neighbor index {} out of range",
                        nb.tet
                    )));
                }
                if !(nb.area > 0.0) || !(nb.dist > 0.0) {
                    return Err(SimError::InvalidArgument(format!(
                        "tet {i} neighbor coupling must have positive area and distance"
                    )));
                }
            }
        }
        for (i, td) in self.tris.iter().enumerate() {
            if td.patch >= n_patches {
                return Err(SimError::InvalidArgument(format!(
                    "tri {i} references unknown patch {}",
                    td.patch
                )));
            }
            if !(td.area > 0.0) {
                return Err(SimError::InvalidArgument(format!(
                    "tri {i} area must be positive, got {}",
                    td.area
                )));
            }
            if td.inner_tet >= self.tets.len() {
                return Err(SimError::Shape(format!(
                    "tri {i} inner tet index {} out of range",
                    td.inner_tet
                )));
            }
        }
        Ok(())
    }
}

/// Destination of one outward diffusion direction. `Foreign` marks a
/// neighbor owned by another worker in a partitioned run; `scale` is the
/// precomputed geometric coupling `area / (dist * vol)` of the source.
#[derive(Clone, Copy, Debug)]
pub enum Neighbor {
    Local { tet: TetId, scale: f64 },
    Foreign { rank: usize, tet: TetId, scale: f64 },
}

impl Neighbor {
    pub fn scale(&self) -> f64 {
        match *self {
            Neighbor::Local { scale, .. } | Neighbor::Foreign { scale, .. } => scale,
        }
    }
}

/// Tetrahedron state: integer pools over the compartment's local species,
/// geometric measure, and outward diffusion couplings.
#[derive(Clone, Debug)]
pub struct Tet {
    pub comp: CompId,
    pub vol: f64,
    pub pools: Vec<u64>,
    pub neighbors: [Option<Neighbor>; 4],
}

/// Triangle state: pools over the patch's local surface species, area, and
/// the tetrahedron on its inner side.
#[derive(Clone, Debug)]
pub struct Tri {
    pub patch: PatchId,
    pub area: f64,
    pub pools: Vec<u64>,
    pub inner_tet: TetId,
}

/// Read view over all tetrahedra of one compartment. The element list and
/// the strictly increasing cumulative-volume table are fixed after binding;
/// population changes go through the elements.
#[derive(Clone, Debug)]
pub struct Comp {
    pub tets: Vec<TetId>,
    pub vol: f64,
    cum_vols: Vec<f64>,
}

impl Comp {
    pub(crate) fn new(tets: Vec<TetId>, vols: &[f64]) -> Self {
        let mut cum_vols = Vec::with_capacity(tets.len());
        let mut acc = 0.0;
        for &t in &tets {
            acc += vols[t];
            cum_vols.push(acc);
        }
        Self {
            tets,
            vol: acc,
            cum_vols,
        }
    }

    /// Volume-weighted random tetrahedron for `rand01` in `[0, 1)`.
    pub fn pick_tet_by_vol(&self, rand01: f64) -> Option<TetId> {
        if self.tets.is_empty() {
            return None;
        }
        let target = rand01 * self.vol;
        let idx = self.cum_vols.partition_point(|&c| c <= target);
        Some(self.tets[idx.min(self.tets.len() - 1)])
    }
}

/// Read view over all triangles of one patch.
#[derive(Clone, Debug)]
pub struct Patch {
    pub tris: Vec<TriId>,
    pub area: f64,
    cum_areas: Vec<f64>,
}

impl Patch {
    pub(crate) fn new(tris: Vec<TriId>, areas: &[f64]) -> Self {
        let mut cum_areas = Vec::with_capacity(tris.len());
        let mut acc = 0.0;
        for &t in &tris {
            acc += areas[t];
            cum_areas.push(acc);
        }
        Self {
            tris,
            area: acc,
            cum_areas,
        }
    }

    /// Area-weighted random triangle for `rand01` in `[0, 1)`.
    pub fn pick_tri_by_area(&self, rand01: f64) -> Option<TriId> {
        if self.tris.is_empty() {
            return None;
        }
        let target = rand01 * self.area;
        let idx = self.cum_areas.partition_point(|&c| c <= target);
        Some(self.tris[idx.min(self.tris.len() - 1)])
    }
}

/// Materializes element state from a mesh description. `owned` restricts
/// the build to the listed tets (a worker's partition); `rank_of` maps every
/// global tet to its owner so cross-partition couplings become
/// [`Neighbor::Foreign`]. For single-process runs pass all tets and a
/// constant rank map.
pub(crate) struct MeshState {
    pub tets: Vec<Tet>,
    pub tris: Vec<Tri>,
    pub comps: Vec<Comp>,
    pub patches: Vec<Patch>,
    /// Global tet id of each local tet, stable element ordering.
    pub tet_globals: Vec<TetId>,
}

impl MeshState {
    pub fn build(
        statedef: &Statedef,
        desc: &MeshDesc,
        owned: &[TetId],
        rank_of: &[usize],
        local_of: &[Option<TetId>],
    ) -> Result<Self, SimError> {
        let mut tets = Vec::with_capacity(owned.len());
        for &g in owned {
            let td = &desc.tets[g];
            let nspecs = statedef.compdef(td.comp).n_local_specs();
            let mut neighbors = [None; 4];
            for (dir, nb) in td.neighbors.iter().enumerate() {
                let Some(nb) = nb else { continue };
                // Diffusion only couples elements of the same compartment.
                if desc.tets[nb.tet].comp != td.comp {
                    continue;
                }
                let scale = nb.area / (nb.dist * td.vol);
                let dest_rank = rank_of[nb.tet];
                let dest_local = local_of[nb.tet].ok_or_else(|| {
                    SimError::Shape(format!("tet {} missing from partition map", nb.tet))
                })?;
                neighbors[dir] = Some(if dest_rank == rank_of[g] {
                    Neighbor::Local {
                        tet: dest_local,
                        scale,
                    }
                } else {
                    Neighbor::Foreign {
                        rank: dest_rank,
                        tet: dest_local,
                        scale,
                    }
                });
            }
            tets.push(Tet {
                comp: td.comp,
                vol: td.vol,
                pools: vec![0; nspecs],
                neighbors,
            });
        }

        // Triangles follow their inner tetrahedron's owner.
        let mut tris = Vec::new();
        for td in &desc.tris {
            let Some(inner_local) = local_of[td.inner_tet] else {
                continue;
            };
            if !owned.contains(&td.inner_tet) {
                continue;
            }
            let nspecs = statedef.patchdef(td.patch).n_local_specs();
            tris.push(Tri {
                patch: td.patch,
                area: td.area,
                pools: vec![0; nspecs],
                inner_tet: inner_local,
            });
        }

        let vols: Vec<f64> = tets.iter().map(|t| t.vol).collect();
        let comps = (0..statedef.compdefs.len())
            .map(|c| {
                let members: Vec<TetId> = tets
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.comp == c)
                    .map(|(i, _)| i)
                    .collect();
                Comp::new(members, &vols)
            })
            .collect();

        let areas: Vec<f64> = tris.iter().map(|t| t.area).collect();
        let patches = (0..statedef.patchdefs.len())
            .map(|p| {
                let members: Vec<TriId> = tris
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.patch == p)
                    .map(|(i, _)| i)
                    .collect();
                Patch::new(members, &areas)
            })
            .collect();

        Ok(Self {
            tets,
            tris,
            comps,
            patches,
            tet_globals: owned.to_vec(),
        })
    }
}
