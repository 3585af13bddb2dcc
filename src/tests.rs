use super::*;
use crate::mesh::Comp;
use crate::scheduler::PropensityTree;
use crate::statedef::{Dep, Statedef};

/// A <-> B in a single compartment. Returns (model, comp, a, b, fwd reac).
fn decay_model(k_fwd: f64, k_rev: f64) -> (Model, CompId, SpecId, SpecId, ReacId) {
    let mut m = Model::new();
    let a = m.add_species("A");
    let b = m.add_species("B");
    let comp = m.add_comp("cyt", &[a, b]).unwrap();
    let fwd = m.add_reac(comp, &[(a, 1)], &[(b, 1)], k_fwd).unwrap();
    if k_rev > 0.0 {
        m.add_reac(comp, &[(b, 1)], &[(a, 1)], k_rev).unwrap();
    }
    (m, comp, a, b, fwd)
}

/// One diffusing species in one compartment.
fn diffusion_model(dcst: f64) -> (Model, CompId, SpecId) {
    let mut m = Model::new();
    let s = m.add_species("S");
    let comp = m.add_comp("cyt", &[s]).unwrap();
    m.add_diff(comp, s, dcst).unwrap();
    (m, comp, s)
}

/// Linear chain of `n` equal tets coupled through shared faces.
fn chain_mesh(n: usize, vol: f64, area: f64, dist: f64) -> MeshDesc {
    let mut tets: Vec<TetDesc> = (0..n).map(|_| TetDesc::isolated(0, vol)).collect();
    for i in 0..n - 1 {
        tets[i].neighbors[1] = Some(TetNeighborDesc {
            tet: i + 1,
            area,
            dist,
        });
        tets[i + 1].neighbors[0] = Some(TetNeighborDesc { tet: i, area, dist });
    }
    MeshDesc {
        tets,
        tris: Vec::new(),
    }
}

/// Volume species A adsorbing onto a patch as surface species S.
fn adsorption_model(kcst: f64) -> (Model, CompId, PatchId, SpecId, SpecId) {
    let mut m = Model::new();
    let a = m.add_species("A");
    let s = m.add_species("S");
    let comp = m.add_comp("cyt", &[a]).unwrap();
    let patch = m.add_patch("memb", comp, &[s]).unwrap();
    m.add_sreac(patch, &[(a, 1)], &[], &[], &[(s, 1)], kcst)
        .unwrap();
    (m, comp, patch, a, s)
}

fn single_tet_with_tri(vol: f64, area: f64) -> MeshDesc {
    MeshDesc {
        tets: vec![TetDesc::isolated(0, vol)],
        tris: vec![TriDesc {
            patch: 0,
            area,
            inner_tet: 0,
        }],
    }
}

#[test]
fn falling_factorial_basics() {
    assert_eq!(falling_factorial(5, 0), 1.0);
    assert_eq!(falling_factorial(5, 2), 20.0);
    assert_eq!(falling_factorial(3, 4), 0.0);
}

#[test]
fn derive_seed_is_deterministic() {
    let s1 = derive_seed(Some(42), 5);
    let s2 = derive_seed(Some(42), 5);
    assert_eq!(s1, s2);
    assert_ne!(derive_seed(Some(42), 5), derive_seed(Some(42), 6));
}

#[test]
fn reac_dependencies_match_participants() {
    let mut m = Model::new();
    let a = m.add_species("A");
    let b = m.add_species("B");
    let c = m.add_species("C");
    let d = m.add_species("D");
    let comp = m.add_comp("cyt", &[a, b, c, d]).unwrap();
    m.add_reac(comp, &[(a, 1), (b, 1)], &[(c, 1)], 1.0).unwrap();
    let sd = Statedef::new(&m).unwrap();
    let rdef = sd.compdef(comp).reac(0);
    assert_eq!(rdef.dep(a), Dep::Stoich);
    assert_eq!(rdef.dep(b), Dep::Stoich);
    assert_eq!(rdef.dep(c), Dep::None);
    assert_eq!(rdef.dep(d), Dep::None);
    assert!(rdef.req(a) && rdef.req(b));
    assert!(!rdef.req(c) && !rdef.req(d));
    assert_eq!(rdef.order(), 2);
}

#[test]
fn diff_dependency_is_exactly_the_ligand() {
    let (m, comp, s) = diffusion_model(1e-9);
    let sd = Statedef::new(&m).unwrap();
    let ddef = sd.compdef(comp).diff(0);
    assert_eq!(ddef.dep(s), Dep::Stoich);
    assert_eq!(ddef.lig(), s);
    assert!(ddef.req(s));
}

#[test]
fn sreac_dependencies_split_by_side() {
    let (m, _, patch, a, s) = adsorption_model(1.0);
    let sd = Statedef::new(&m).unwrap();
    let sdef = sd.patchdef(patch).sreac(0);
    assert_eq!(sdef.dep_v(a), Dep::Stoich);
    assert_eq!(sdef.dep_s(a), Dep::None);
    assert_eq!(sdef.dep_v(s), Dep::None);
    assert_eq!(sdef.dep_s(s), Dep::None);
    assert_eq!(sdef.order(), 1);
}

#[test]
fn spec_g2l_yields_none_for_undeclared_species() {
    let mut m = Model::new();
    let a = m.add_species("A");
    let b = m.add_species("B");
    let c0 = m.add_comp("cyt", &[a]).unwrap();
    let c1 = m.add_comp("nuc", &[b]).unwrap();
    let mesh = MeshDesc {
        tets: vec![TetDesc::isolated(c0, 1e-18), TetDesc::isolated(c1, 1e-18)],
        tris: Vec::new(),
    };
    let mut sim = Simulation::new(&m, &mesh, Some(1)).unwrap();
    assert_eq!(sim.get_tet_count(0, a), Some(0));
    assert_eq!(sim.get_tet_count(1, a), None);
    let err = sim.set_tet_count(1, a, 5).unwrap_err();
    assert!(matches!(err, SimError::InvalidArgument(_)));
}

#[test]
fn propensity_tree_selects_expected_indices() {
    let props = vec![1.0, 3.0, 6.0];
    let mut tree = PropensityTree::new(props.len());
    tree.rebuild(&props);
    let total = tree.total();
    assert_eq!(tree.select(0.0), 0);
    assert_eq!(tree.select(0.05 * total), 0);
    assert_eq!(tree.select(0.2 * total), 1);
    assert_eq!(tree.select(0.6 * total), 2);
    assert_eq!(tree.select(0.95 * total), 2);
}

#[test]
fn propensity_tree_never_selects_zero_entries() {
    let props = vec![0.0, 2.0, 0.0, 5.0];
    let mut tree = PropensityTree::new(props.len());
    tree.rebuild(&props);
    let total = tree.total();
    assert_eq!(tree.select(0.01 * total), 1);
    assert_eq!(tree.select(0.4 * total), 3);
    assert_eq!(tree.select(0.9 * total), 3);
}

#[test]
fn propensity_tree_updates_after_modifications() {
    let props = vec![2.0, 3.0];
    let mut tree = PropensityTree::new(props.len());
    tree.rebuild(&props);
    assert_eq!(tree.total(), 5.0);
    tree.update(1, 1.0);
    assert!((tree.total() - 3.0).abs() < 1e-12);
    assert_eq!(tree.select(0.5), 0);
    assert_eq!(tree.select(2.1), 1);
}

#[test]
fn first_order_decay_runs_to_completion() {
    let (m, comp, a, b, _) = decay_model(1.0, 0.0);
    let mut sim = Simulation::well_mixed(&m, &[1e-18], Some(7)).unwrap();
    sim.set_comp_count(comp, a, 100).unwrap();
    let status = sim.run_until(60.0);
    assert_eq!(status, RunStatus::Quiescent);
    assert_eq!(sim.comp_count(comp, a), Some(0));
    assert_eq!(sim.comp_count(comp, b), Some(100));
    assert_eq!(sim.time(), 60.0);
    assert_eq!(sim.nsteps(), 100);
}

#[test]
fn decay_follows_exponential_mean() {
    let (m, comp, a, _, _) = decay_model(1.0, 0.0);
    let mesh = MeshDesc {
        tets: vec![TetDesc::isolated(comp, 1e-18)],
        tris: Vec::new(),
    };
    let out = run_ensemble(&m, &mesh, 0.7, 300, Some(11), Some(2), |sim| {
        sim.set_comp_count(comp, a, 100)
    })
    .unwrap();
    // E[A(0.7)] = 100 * exp(-0.7) = 49.66, SE over 300 trajectories ~ 0.3.
    let mean = out.mean(a);
    assert!((mean - 49.66).abs() < 2.0, "mean A = {mean}");
}

#[test]
fn closed_network_conserves_total_count() {
    let (m, comp, a, b, _) = decay_model(2.0, 1.5);
    let mut sim = Simulation::well_mixed(&m, &[1e-18], Some(3)).unwrap();
    sim.set_comp_count(comp, a, 100).unwrap();
    for _ in 0..20 {
        sim.run_steps(25);
        assert_eq!(sim.spec_count(a) + sim.spec_count(b), 100);
    }
}

#[test]
fn pools_stay_consistent_under_randomized_firing() {
    let mut m = Model::new();
    let a = m.add_species("A");
    let b = m.add_species("B");
    let c = m.add_species("C");
    let comp = m.add_comp("cyt", &[a, b, c]).unwrap();
    m.add_reac(comp, &[(a, 1), (b, 1)], &[(c, 1)], 1e7).unwrap();
    m.add_reac(comp, &[(c, 1)], &[(a, 1), (b, 1)], 50.0).unwrap();
    m.add_reac(comp, &[(a, 2)], &[(b, 1)], 1e6).unwrap();
    m.add_diff(comp, a, 1e-9).unwrap();
    m.add_diff(comp, c, 1e-10).unwrap();
    let mesh = chain_mesh(3, 1e-18, 1e-12, 1e-6);
    for seed in 0..5u64 {
        let mut sim = Simulation::new(&m, &mesh, Some(seed)).unwrap();
        sim.set_comp_count(comp, a, 60).unwrap();
        sim.set_comp_count(comp, b, 40).unwrap();
        sim.run_steps(2000);
        // A + B + 2C is invariant under the binding pair and only drops
        // through the dimerization channel.
        let total = sim.spec_count(a) + sim.spec_count(b) + 2 * sim.spec_count(c);
        assert!(total <= 100);
        for tet in 0..3 {
            for spec in [a, b, c] {
                assert!(sim.get_tet_count(tet, spec).is_some());
            }
        }
    }
}

#[test]
fn two_tet_diffusion_equilibrates_by_volume() {
    let (m, _, s) = diffusion_model(1e-9);
    // Volumes 1:3, so the expected split of 100 molecules is 25:75.
    let mut mesh = chain_mesh(2, 1e-18, 1e-12, 1e-6);
    mesh.tets[1].vol = 3e-18;
    let mut sum_tet0 = 0.0;
    let runs = 40;
    for seed in 0..runs {
        let mut sim = Simulation::new(&m, &mesh, Some(seed)).unwrap();
        sim.set_tet_count(0, s, 100).unwrap();
        sim.run_until(0.05);
        assert_eq!(sim.spec_count(s), 100);
        sum_tet0 += sim.get_tet_count(0, s).unwrap() as f64;
    }
    let mean_tet0 = sum_tet0 / runs as f64;
    assert!(
        (mean_tet0 - 25.0).abs() < 5.0,
        "mean tet0 count = {mean_tet0}"
    );
}

#[test]
fn checkpoint_restore_reproduces_bit_identical_run() {
    let (mut m, comp, a, b, _) = decay_model(2.0, 1.0);
    m.add_diff(comp, a, 1e-9).unwrap();
    let mesh = chain_mesh(3, 1e-18, 1e-12, 1e-6);
    let mut sim = Simulation::new(&m, &mesh, Some(99)).unwrap();
    sim.set_comp_count(comp, a, 80).unwrap();
    sim.run_until(0.01);
    let cp = sim.checkpoint();

    sim.run_steps(200);
    let reference = sim.checkpoint().to_json().unwrap();

    let mut resumed = Simulation::new(&m, &mesh, Some(1234)).unwrap();
    resumed.restore(&cp).unwrap();
    assert_eq!(resumed.time(), cp.time);
    resumed.run_steps(200);
    assert_eq!(resumed.checkpoint().to_json().unwrap(), reference);
    assert_eq!(resumed.spec_count(a), sim.spec_count(a));
    assert_eq!(resumed.spec_count(b), sim.spec_count(b));
}

#[test]
fn checkpoint_carries_the_membrane_potential() {
    let mut m = Model::new();
    let a = m.add_species("A");
    let s = m.add_species("S");
    let comp = m.add_comp("cyt", &[a]).unwrap();
    let patch = m.add_patch("memb", comp, &[s]).unwrap();
    let tab = VRateTable::new(0.0, 160.0, vec![0.0, 10.0]).unwrap();
    m.add_vdep_sreac(patch, &[], &[(s, 1)], &[(a, 1)], &[], tab)
        .unwrap();
    let mesh = single_tet_with_tri(1e-18, 1e-12);

    let mut sim = Simulation::new(&m, &mesh, Some(31)).unwrap();
    sim.set_tri_count(0, s, 200).unwrap();
    sim.set_membrane_potential(80.0);
    sim.run_steps(5);
    let cp = sim.checkpoint();
    assert_eq!(cp.membrane_v, 80.0);
    sim.run_steps(10);
    let reference = sim.checkpoint().to_json().unwrap();

    // A fresh simulation sits at the default potential of 0 mV, where the
    // table gives rate 0; the restore must bring the potential back too.
    let mut resumed = Simulation::new(&m, &mesh, Some(777)).unwrap();
    resumed.restore(&cp).unwrap();
    assert!(resumed.total_propensity() > 0.0);
    resumed.run_steps(10);
    assert_eq!(resumed.checkpoint().to_json().unwrap(), reference);
}

#[test]
fn checkpoint_survives_json_round_trip() {
    let (m, comp, a, _, _) = decay_model(1.0, 0.0);
    let mut sim = Simulation::well_mixed(&m, &[1e-18], Some(5)).unwrap();
    sim.set_comp_count(comp, a, 30).unwrap();
    sim.run_steps(10);
    let cp = sim.checkpoint();
    let json = cp.to_json().unwrap();
    let back = Checkpoint::from_json(&json).unwrap();
    assert_eq!(back.to_json().unwrap(), json);
    assert_eq!(back.time, cp.time);
    assert_eq!(back.nsteps, cp.nsteps);
}

#[test]
fn restore_rejects_mismatched_shapes() {
    let (m, comp, a, _, _) = decay_model(1.0, 0.0);
    let mut sim = Simulation::well_mixed(&m, &[1e-18], Some(5)).unwrap();
    sim.set_comp_count(comp, a, 30).unwrap();
    let cp = sim.checkpoint();

    let (m2, _, s) = diffusion_model(1e-9);
    let mesh = chain_mesh(2, 1e-18, 1e-12, 1e-6);
    let mut other = Simulation::new(&m2, &mesh, Some(5)).unwrap();
    other.set_tet_count(0, s, 1).unwrap();
    let err = other.restore(&cp).unwrap_err();
    assert!(matches!(err, SimError::Shape(_)));
}

#[test]
fn quiescent_state_reports_no_further_events() {
    let (m, comp, a, _, _) = decay_model(1.0, 0.0);
    let mut sim = Simulation::well_mixed(&m, &[1e-18], Some(2)).unwrap();
    // No molecules anywhere: nothing can fire.
    assert_eq!(sim.step(), StepOutcome::Quiescent);
    assert_eq!(sim.run_until(5.0), RunStatus::Quiescent);
    assert_eq!(sim.time(), 5.0);
    assert_eq!(sim.phase(), Phase::Halted);
    assert_eq!(sim.nsteps(), 0);
    // Molecules revive the scheduler.
    sim.set_comp_count(comp, a, 10).unwrap();
    assert!(matches!(sim.step(), StepOutcome::Fired(_)));
}

#[test]
fn same_seed_gives_identical_trajectories() {
    let (mut m, comp, a, _, _) = decay_model(1.0, 0.5);
    m.add_diff(comp, a, 1e-9).unwrap();
    let mesh = chain_mesh(4, 1e-18, 1e-12, 1e-6);
    let run = |seed| {
        let mut sim = Simulation::new(&m, &mesh, Some(seed)).unwrap();
        sim.set_comp_count(comp, a, 50).unwrap();
        sim.run_until(0.5);
        (0..4)
            .map(|t| sim.get_tet_count(t, a).unwrap())
            .collect::<Vec<_>>()
    };
    assert_eq!(run(123), run(123));
}

#[test]
fn rate_rescaling_updates_propensities() {
    let (m, comp, a, _, fwd) = decay_model(0.0, 0.0);
    let mut sim = Simulation::well_mixed(&m, &[1e-18], Some(8)).unwrap();
    sim.set_comp_count(comp, a, 100).unwrap();
    assert_eq!(sim.step(), StepOutcome::Quiescent);
    assert_eq!(sim.reac_kcst(fwd).unwrap(), 0.0);
    sim.set_reac_kcst(fwd, 5.0).unwrap();
    assert_eq!(sim.reac_kcst(fwd).unwrap(), 5.0);
    assert!((sim.total_propensity() - 500.0).abs() < 1e-9);
    assert!(matches!(sim.step(), StepOutcome::Fired(_)));
    assert!(matches!(
        sim.set_reac_kcst(fwd, -1.0),
        Err(SimError::InvalidArgument(_))
    ));
}

#[test]
fn diffusion_and_surface_rates_rescale() {
    let (m, _, s) = diffusion_model(1e-9);
    let mesh = chain_mesh(2, 1e-18, 1e-12, 1e-6);
    let mut sim = Simulation::new(&m, &mesh, Some(12)).unwrap();
    sim.set_tet_count(0, s, 10).unwrap();
    // d = dcst * area / (dist * vol) = 1e3 per molecule.
    assert!((sim.total_propensity() - 1e4).abs() < 1e-6);
    sim.set_diff_dcst(0, 5e-10).unwrap();
    assert_eq!(sim.diff_dcst(0).unwrap(), 5e-10);
    assert!((sim.total_propensity() - 5e3).abs() < 1e-6);
    assert!(sim.set_diff_dcst(0, -1.0).is_err());
    assert!(sim.diff_dcst(7).is_err());

    let (m2, _, _, a, _) = adsorption_model(10.0);
    let mesh2 = single_tet_with_tri(1e-18, 1e-12);
    let mut surf = Simulation::new(&m2, &mesh2, Some(12)).unwrap();
    surf.set_tet_count(0, a, 20).unwrap();
    assert!((surf.total_propensity() - 200.0).abs() < 1e-9);
    surf.set_sreac_kcst(0, 2.5).unwrap();
    assert_eq!(surf.sreac_kcst(0).unwrap(), 2.5);
    assert!((surf.total_propensity() - 50.0).abs() < 1e-9);
}

#[test]
fn second_order_propensity_scales_with_volume() {
    let mut m = Model::new();
    let a = m.add_species("A");
    let b = m.add_species("B");
    let c = m.add_species("C");
    let comp = m.add_comp("cyt", &[a, b, c]).unwrap();
    m.add_reac(comp, &[(a, 1), (b, 1)], &[(c, 1)], 2e6).unwrap();
    let vol = 1e-21;
    let mut sim = Simulation::well_mixed(&m, &[vol], Some(0)).unwrap();
    sim.set_comp_count(comp, a, 10).unwrap();
    sim.set_comp_count(comp, b, 10).unwrap();
    let expected = 2e6 / (1.0e3 * vol * AVOGADRO) * 100.0;
    assert!((sim.total_propensity() - expected).abs() / expected < 1e-12);

    // The single-element spatial rendition of the same system agrees.
    let mesh = MeshDesc {
        tets: vec![TetDesc::isolated(comp, vol)],
        tris: Vec::new(),
    };
    let mut spatial = Simulation::new(&m, &mesh, Some(0)).unwrap();
    spatial.set_tet_count(0, a, 10).unwrap();
    spatial.set_tet_count(0, b, 10).unwrap();
    assert!((spatial.total_propensity() - expected).abs() / expected < 1e-12);
}

#[test]
fn second_order_surface_reaction_scales_with_inner_volume() {
    let mut m = Model::new();
    let a = m.add_species("A");
    let s = m.add_species("S");
    let b = m.add_species("B");
    let comp = m.add_comp("cyt", &[a, b]).unwrap();
    let patch = m.add_patch("memb", comp, &[s]).unwrap();
    m.add_sreac(patch, &[(a, 1)], &[(s, 1)], &[(b, 1)], &[(s, 1)], 4e6)
        .unwrap();
    let vol = 1e-19;
    let mesh = single_tet_with_tri(vol, 1e-12);
    let mut sim = Simulation::new(&m, &mesh, Some(9)).unwrap();
    sim.set_tet_count(0, a, 30).unwrap();
    sim.set_tri_count(0, s, 12).unwrap();
    // Order 2 over both sides, so the constant divides by the inner
    // element's volume: a = kcst / (1e3 * vol * N_A) * nA * nS.
    let expected = 4e6 / (1.0e3 * vol * AVOGADRO) * 30.0 * 12.0;
    assert!((sim.total_propensity() - expected).abs() / expected < 1e-12);
}

#[test]
fn surface_reaction_moves_counts_between_volume_and_patch() {
    let (m, comp, patch, a, s) = adsorption_model(10.0);
    let mesh = single_tet_with_tri(1e-18, 1e-12);
    let mut sim = Simulation::new(&m, &mesh, Some(4)).unwrap();
    sim.set_tet_count(0, a, 100).unwrap();
    for _ in 0..10 {
        sim.run_steps(10);
        assert_eq!(sim.spec_count(a) + sim.spec_count(s), 100);
    }
    sim.run_until(10.0);
    assert_eq!(sim.comp_count(comp, a), Some(0));
    assert_eq!(sim.patch_count(patch, s), Some(100));
}

#[test]
fn vrate_table_interpolates_and_clamps() {
    // Table spans -80 mV to 0 mV in one 80 mV step.
    let tab = VRateTable::new(-80.0, 80.0, vec![0.0, 10.0]).unwrap();
    assert_eq!(tab.eval(-120.0), 0.0);
    assert_eq!(tab.eval(-80.0), 0.0);
    assert!((tab.eval(-40.0) - 5.0).abs() < 1e-12);
    assert_eq!(tab.eval(0.0), 10.0);
    assert_eq!(tab.eval(120.0), 10.0);
    assert!(matches!(
        VRateTable::new(0.0, 0.0, vec![1.0, 2.0]),
        Err(SimError::InvalidArgument(_))
    ));
    assert!(matches!(
        VRateTable::new(0.0, 1.0, Vec::new()),
        Err(SimError::InvalidArgument(_))
    ));
    assert!(matches!(
        VRateTable::new(0.0, 1.0, vec![1.0, -2.0]),
        Err(SimError::InvalidArgument(_))
    ));
}

#[test]
fn membrane_potential_gates_voltage_dependent_processes() {
    let mut m = Model::new();
    let a = m.add_species("A");
    let s = m.add_species("S");
    let comp = m.add_comp("cyt", &[a]).unwrap();
    let patch = m.add_patch("memb", comp, &[s]).unwrap();
    let tab = VRateTable::new(-80.0, 80.0, vec![0.0, 10.0]).unwrap();
    m.add_vdep_sreac(patch, &[], &[(s, 1)], &[(a, 1)], &[], tab)
        .unwrap();
    let mesh = single_tet_with_tri(1e-18, 1e-12);
    let mut sim = Simulation::new(&m, &mesh, Some(6)).unwrap();
    sim.set_tri_count(0, s, 50).unwrap();

    sim.set_membrane_potential(-80.0);
    assert_eq!(sim.total_propensity(), 0.0);
    assert_eq!(sim.step(), StepOutcome::Quiescent);

    sim.set_membrane_potential(80.0);
    assert!((sim.total_propensity() - 500.0).abs() < 1e-9);
    assert!(matches!(sim.step(), StepOutcome::Fired(_)));
    sim.run_until(10.0);
    assert_eq!(sim.get_tet_count(0, a), Some(50));
    assert_eq!(sim.get_tri_count(0, s), Some(0));
}

#[test]
fn comp_count_distributes_volume_weighted() {
    let (m, comp, s) = diffusion_model(1e-9);
    let mesh = chain_mesh(3, 1e-18, 1e-12, 1e-6);
    let mut sim = Simulation::new(&m, &mesh, Some(21)).unwrap();
    sim.set_comp_count(comp, s, 1000).unwrap();
    assert_eq!(sim.comp_count(comp, s), Some(1000));
    for t in 0..3 {
        let n = sim.get_tet_count(t, s).unwrap();
        assert!(n > 0, "tet {t} received no molecules");
    }
    let picked = sim.pick_tet_weighted(comp).unwrap();
    assert!(picked < 3);
}

#[test]
fn pick_tet_by_vol_respects_cumulative_table() {
    let comp = Comp::new(vec![0, 1, 2], &[1.0, 2.0, 3.0]);
    assert_eq!(comp.vol, 6.0);
    assert_eq!(comp.pick_tet_by_vol(0.0), Some(0));
    assert_eq!(comp.pick_tet_by_vol(0.1), Some(0));
    assert_eq!(comp.pick_tet_by_vol(0.3), Some(1));
    assert_eq!(comp.pick_tet_by_vol(0.6), Some(2));
    assert_eq!(comp.pick_tet_by_vol(0.999), Some(2));
    let empty = Comp::new(Vec::new(), &[]);
    assert_eq!(empty.pick_tet_by_vol(0.5), None);
}

#[test]
fn run_ensemble_validates_inputs() {
    let (m, _, _, _, _) = decay_model(1.0, 0.0);
    let mesh = MeshDesc {
        tets: vec![TetDesc::isolated(0, 1e-18)],
        tris: Vec::new(),
    };
    let err = run_ensemble(&m, &mesh, 1.0, 0, None, None, |_| Ok(())).unwrap_err();
    assert!(matches!(err, SimError::InvalidArgument(_)));
    let err = run_ensemble(&m, &mesh, 0.0, 4, None, None, |_| Ok(())).unwrap_err();
    assert!(matches!(err, SimError::InvalidArgument(_)));
}

#[test]
fn ensemble_output_exposes_per_trajectory_rows() {
    let (m, comp, a, b, _) = decay_model(1.0, 0.0);
    let mesh = MeshDesc {
        tets: vec![TetDesc::isolated(comp, 1e-18)],
        tris: Vec::new(),
    };
    let out = run_ensemble(&m, &mesh, 100.0, 8, Some(3), None, |sim| {
        sim.set_comp_count(comp, a, 20)
    })
    .unwrap();
    assert_eq!(out.n_traj, 8);
    for i in 0..8 {
        let row = out.trajectory(i);
        assert_eq!(row[a] + row[b], 20);
        assert_eq!(row[a], 0);
    }
    assert_eq!(out.mean(b), 20.0);
}

#[test]
fn mesh_validation_rejects_broken_descriptions() {
    let (m, _, _) = diffusion_model(1e-9);
    let empty = MeshDesc {
        tets: Vec::new(),
        tris: Vec::new(),
    };
    assert!(Simulation::new(&m, &empty, None).is_err());
    let mut bad_neighbor = chain_mesh(2, 1e-18, 1e-12, 1e-6);
    bad_neighbor.tets[0].neighbors[1] = Some(TetNeighborDesc {
        tet: 9,
        area: 1e-12,
        dist: 1e-6,
    });
    assert!(matches!(
        Simulation::new(&m, &bad_neighbor, None),
        Err(SimError::Shape(_))
    ));
    let mut bad_vol = chain_mesh(2, 1e-18, 1e-12, 1e-6);
    bad_vol.tets[1].vol = 0.0;
    assert!(Simulation::new(&m, &bad_vol, None).is_err());
}

#[test]
fn distributed_run_conserves_totals_and_is_deterministic() {
    let (m, _, s) = diffusion_model(1e-9);
    let mesh = chain_mesh(4, 1e-18, 1e-12, 1e-6);
    let partition = vec![0, 0, 1, 1];
    let run = |seed| {
        let mut sim = DistSim::new(&m, &mesh, &partition, Some(seed)).unwrap();
        sim.set_tet_count(0, s, 200).unwrap();
        let status = sim.run_until(0.02).unwrap();
        assert_eq!(status, RunStatus::Completed);
        assert_eq!(sim.time(), 0.02);
        assert_eq!(sim.spec_count(s), 200);
        (0..4)
            .map(|t| sim.get_tet_count(t, s).unwrap())
            .collect::<Vec<_>>()
    };
    assert_eq!(run(42), run(42));
}

#[test]
fn distributed_checkpoint_resumes_identically() {
    let (mut m, comp, a, _, _) = decay_model(2.0, 1.0);
    m.add_diff(comp, a, 1e-9).unwrap();
    let mesh = chain_mesh(4, 1e-18, 1e-12, 1e-6);
    let partition = vec![0, 0, 1, 1];
    let mut sim = DistSim::new(&m, &mesh, &partition, Some(55)).unwrap();
    sim.set_tet_count(0, a, 100).unwrap();
    sim.run_until(0.002).unwrap();
    let cp = sim.checkpoint();
    assert_eq!(cp.time, 0.002);
    assert_eq!(cp.workers.len(), 2);

    sim.run_until(0.004).unwrap();
    let reference = sim.checkpoint().to_json().unwrap();

    let mut resumed = DistSim::new(&m, &mesh, &partition, Some(9999)).unwrap();
    resumed.restore(&cp).unwrap();
    assert_eq!(resumed.time(), 0.002);
    resumed.run_until(0.004).unwrap();
    assert_eq!(resumed.checkpoint().to_json().unwrap(), reference);

    // A differently partitioned run cannot accept the checkpoint.
    let mut other = DistSim::new(&m, &mesh, &[0, 1, 2, 3], Some(1)).unwrap();
    assert!(matches!(other.restore(&cp), Err(SimError::Shape(_))));
}

#[test]
fn distributed_quiescence_is_reported() {
    let (m, _, s) = diffusion_model(1e-9);
    let mesh = chain_mesh(2, 1e-18, 1e-12, 1e-6);
    let mut sim = DistSim::new(&m, &mesh, &[0, 1], Some(1)).unwrap();
    // No molecules: every worker proposes infinity.
    assert_eq!(sim.run_until(1.0).unwrap(), RunStatus::Quiescent);
    assert_eq!(sim.time(), 1.0);
    assert_eq!(sim.spec_count(s), 0);
}

#[test]
fn distributed_rejects_bad_partitions() {
    let (m, _, _) = diffusion_model(1e-9);
    let mesh = chain_mesh(2, 1e-18, 1e-12, 1e-6);
    // Partition length must match the tet count.
    assert!(DistSim::new(&m, &mesh, &[0], Some(1)).is_err());
    // Ranks must be dense starting at zero.
    assert!(DistSim::new(&m, &mesh, &[0, 2], Some(1)).is_err());
}

#[test]
fn partitioned_runs_match_single_worker_statistics() {
    let (m, _, s) = diffusion_model(1e-9);
    let mesh = chain_mesh(4, 1e-18, 1e-12, 1e-6);
    let mean_tet0 = |partition: &[usize]| {
        let runs = 20u64;
        let mut sum = 0.0;
        for seed in 0..runs {
            let mut sim = DistSim::new(&m, &mesh, partition, Some(seed)).unwrap();
            sim.set_tet_count(0, s, 200).unwrap();
            sim.run_until(0.02).unwrap();
            assert_eq!(sim.spec_count(s), 200);
            sum += sim.get_tet_count(0, s).unwrap() as f64;
        }
        sum / runs as f64
    };
    let single = mean_tet0(&[0, 0, 0, 0]);
    let four = mean_tet0(&[0, 1, 2, 3]);
    // Equal volumes: both configurations relax toward 50 per element.
    assert!((single - 50.0).abs() < 12.0, "single-worker mean {single}");
    assert!((four - 50.0).abs() < 12.0, "four-worker mean {four}");
}

#[test]
fn distributed_reactions_and_diffusion_combine() {
    let (mut m, comp, a, b, _) = decay_model(50.0, 0.0);
    m.add_diff(comp, a, 1e-9).unwrap();
    m.add_diff(comp, b, 1e-9).unwrap();
    let mesh = chain_mesh(4, 1e-18, 1e-12, 1e-6);
    let mut sim = DistSim::new(&m, &mesh, &[0, 0, 1, 1], Some(17)).unwrap();
    sim.set_tet_count(0, a, 120).unwrap();
    sim.run_until(0.2).unwrap();
    assert_eq!(sim.spec_count(a) + sim.spec_count(b), 120);
    // k = 50/s over 0.2 s is ten decay time constants.
    assert!(sim.spec_count(a) < 5, "A left: {}", sim.spec_count(a));
}
