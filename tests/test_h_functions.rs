//! H-evaluator overrides: fa2a1r, sshdimer and script hooks
//!
//! The initial propensity of a bank instance is observable directly
//! (`a_old` after the init stream settles), which pins the closed-form
//! evaluators against hand-computed values without any stepping.

use reaction_simulator_core::{
    HOverride, Model, Population, RuntimeDistribution, Simulation, SimulationConfig,
};
use std::rc::Rc;

fn config(seed: u64) -> SimulationConfig {
    SimulationConfig {
        seed: Some(seed),
        ..SimulationConfig::default()
    }
}

/// Builds a three-reactant reaction in Env with the given override and
/// populations, returning the settled propensity of its instance.
fn propensity_with(h: HOverride, pops: [f64; 3], c: f64) -> f64 {
    let mut m = Model::new();
    let env = m.env();
    let x1 = m.add_chemical("X1", true);
    let x2 = m.add_chemical("X2", true);
    let x3 = m.add_chemical("X3", true);
    let p = m.add_chemical("P", true);
    m.reaction()
        .reactant(x1, 0)
        .unwrap()
        .reactant(x2, 0)
        .unwrap()
        .reactant(x3, 0)
        .unwrap()
        .override_h(h)
        .unwrap()
        .product(p, 1)
        .unwrap()
        .finish(c)
        .unwrap();
    m.init_select_env();
    m.init_set_population(env, x1, RuntimeDistribution::delta(pops[0]), false);
    m.init_set_population(env, x2, RuntimeDistribution::delta(pops[1]), false);
    m.init_set_population(env, x3, RuntimeDistribution::delta(pops[2]), false);
    m.seal();

    let sim = Simulation::new(Rc::new(m), config(1)).unwrap();
    let iid = sim.compartment(sim.env()).unwrap().bank[0];
    sim.instance(iid).unwrap().a_old
}

#[test]
fn test_fa2a1r_closed_form() {
    let k = [0.5, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
    let (x1, x2, x3) = (2.0, 3.0, 1.0);
    let a = propensity_with(HOverride::Fa2a1r { k }, [x1, x2, x3], 1.0);

    let (k0, k1, k2, k3, k12, k23, k13, k123) =
        (k[0], k[1], k[2], k[3], k[4], k[5], k[6], k[7]);
    let expected = (k0 + k1 * x1 + k2 * x2 + k12 * x1 * x2)
        / (1.0
            + k1 * x1
            + k2 * x2
            + k12 * x1 * x2
            + k3 * x3
            + k13 * x1 * x3
            + k23 * x2 * x3
            + k123 * x1 * x2 * x3);
    assert!((a - expected).abs() < 1e-12, "fa2a1r gave {}, expected {}", a, expected);
}

#[test]
fn test_fa2a1r_no_repressor_reduces_to_activation() {
    // With x3 = 0 the repressor terms vanish
    let k = [0.0, 1.0, 1.0, 100.0, 1.0, 100.0, 100.0, 100.0];
    let (x1, x2) = (4.0, 5.0);
    let a = propensity_with(HOverride::Fa2a1r { k }, [x1, x2, 0.0], 2.0);
    let frac = (x1 + x2 + x1 * x2) / (1.0 + x1 + x2 + x1 * x2);
    assert!((a - 2.0 * frac).abs() < 1e-12);
}

#[test]
fn test_sshdimer_closed_form() {
    let k = 10.0;
    let (x1, x2) = (6.0, 4.0);
    let a = propensity_with(HOverride::SshDimer { k }, [x1, x2, 0.0], 1.0);

    let s = 1.0 + (x1 + x2) / k;
    let expected = k * (1.0 + (x1 + x2) / k - (s * s - 4.0 * x1 * x2 / (k * k)).sqrt());
    assert!((a - expected).abs() < 1e-12, "sshdimer gave {}, expected {}", a, expected);
}

#[test]
fn test_sshdimer_zero_populations_zero_propensity() {
    let a = propensity_with(HOverride::SshDimer { k: 5.0 }, [0.0, 0.0, 0.0], 3.0);
    assert!(a.abs() < 1e-12);
}

#[test]
fn test_script_h_drives_propensity() {
    let mut m = Model::new();
    let env = m.env();
    let x = m.add_chemical("X", true);
    let p = m.add_chemical("P", true);
    let script = m.add_script(Box::new(|pops: &[Population]| {
        // Quadratic in the first reactant population
        Some((pops[0] * pops[0]) as f64)
    }));
    m.reaction()
        .reactant(x, 0)
        .unwrap()
        .override_h(HOverride::Script { index: script })
        .unwrap()
        .product(p, 1)
        .unwrap()
        .finish(0.5)
        .unwrap();
    m.init_select_env();
    m.init_set_population(env, x, RuntimeDistribution::delta(6.0), false);
    m.seal();

    let sim = Simulation::new(Rc::new(m), config(1)).unwrap();
    let iid = sim.compartment(sim.env()).unwrap().bank[0];
    assert_eq!(sim.instance(iid).unwrap().a_old, 0.5 * 36.0);
}

#[test]
fn test_script_failure_falls_back_to_unit_h() {
    let mut m = Model::new();
    let x = m.add_chemical("X", true);
    let p = m.add_chemical("P", true);
    let script = m.add_script(Box::new(|_: &[Population]| None));
    m.reaction()
        .reactant(x, 0)
        .unwrap()
        .override_h(HOverride::Script { index: script })
        .unwrap()
        .product(p, 1)
        .unwrap()
        .finish(2.0)
        .unwrap();
    m.seal();

    let mut sim = Simulation::new(Rc::new(m), config(1)).unwrap();
    let iid = sim.compartment(sim.env()).unwrap().bank[0];
    // Failed script call ⇒ H = 1 ⇒ a = c; the reaction keeps firing
    assert_eq!(sim.instance(iid).unwrap().a_old, 2.0);
    sim.run_until(10.0);
    assert!(sim.step_count() > 0, "fallback H must keep the simulation alive");
}

#[test]
fn test_script_h_zero_blocks_firing() {
    let mut m = Model::new();
    let x = m.add_chemical("X", true);
    let p = m.add_chemical("P", true);
    let script = m.add_script(Box::new(|_: &[Population]| Some(0.0)));
    m.reaction()
        .reactant(x, 0)
        .unwrap()
        .override_h(HOverride::Script { index: script })
        .unwrap()
        .product(p, 1)
        .unwrap()
        .finish(2.0)
        .unwrap();
    m.seal();

    let mut sim = Simulation::new(Rc::new(m), config(1)).unwrap();
    sim.run_until(50.0);
    assert_eq!(sim.step_count(), 0);
}

#[test]
fn test_unknown_script_index_rejected_at_build_time() {
    let mut m = Model::new();
    let x = m.add_chemical("X", true);
    let r = m
        .reaction()
        .reactant(x, 1)
        .unwrap()
        .override_h(HOverride::Script { index: 7 });
    assert!(r.is_err());
}
