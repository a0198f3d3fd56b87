//! Population splits on compartment division
//!
//! Cell-division workload: a mother compartment splits its A population
//! binomially into a freshly created daughter. Checks exact conservation
//! per firing and the Binomial(N, ½) statistics of the daughter share
//! over many seeds.

use reaction_simulator_core::{
    Model, RuntimeDistribution, Simulation, SimulationConfig, SplitFunction, SplitKind, TypeId,
};
use std::rc::Rc;

// ============================================================================
// Helpers
// ============================================================================

struct DivisionModel {
    model: Rc<Model>,
    cell: TypeId,
    daughter: TypeId,
}

/// Mother cell with A = 100 and `split(0.5):A --1.0--> [daughter]:A + @Daughter`.
fn division_model() -> DivisionModel {
    let mut m = Model::new();
    let cell = m.add_compartment_type("Cell", m.env(), true).unwrap();
    let daughter = m.add_compartment_type("Daughter", cell, true).unwrap();
    let a = m.add_chemical("A", true);

    m.reaction()
        .in_type(cell)
        .split_reactant(
            a,
            SplitFunction::new(SplitKind::Binomial {
                p: 0.5,
                unbiased: false,
            }),
        )
        .unwrap()
        .produce_compartment(daughter)
        .unwrap()
        .split_product(a, None)
        .unwrap()
        .finish(1.0)
        .unwrap();

    m.init_select_env();
    m.init_instantiate(cell, 1);
    m.init_select_env();
    m.init_select_type(cell);
    m.init_set_population(cell, a, RuntimeDistribution::delta(100.0), false);
    m.seal();
    DivisionModel {
        model: Rc::new(m),
        cell,
        daughter,
    }
}

fn config(seed: u64) -> SimulationConfig {
    SimulationConfig {
        seed: Some(seed),
        trace: false,
        ..SimulationConfig::default()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_one_division_creates_daughter_and_conserves() {
    let dm = division_model();
    let mut sim = Simulation::new(Rc::clone(&dm.model), config(5)).unwrap();
    let mother = sim.find_compartments(dm.cell)[0];
    assert_eq!(sim.population(mother, 0), 100);

    sim.run_step().expect("the division reaction must fire");

    let daughters = sim.find_compartments(dm.daughter);
    assert_eq!(daughters.len(), 1);
    let d = daughters[0];
    assert_eq!(
        sim.compartment(d).unwrap().parent,
        Some(mother),
        "daughter lives inside the mother"
    );
    assert_eq!(
        sim.population(mother, 0) + sim.population(d, 0),
        100,
        "division must conserve molecules"
    );
}

#[test]
fn test_division_share_is_binomial_over_many_seeds() {
    let dm = division_model();
    let runs = 10_000u64;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for seed in 0..runs {
        let mut sim = Simulation::new(Rc::clone(&dm.model), config(seed)).unwrap();
        let mother = sim.find_compartments(dm.cell)[0];
        sim.run_step().expect("the division reaction must fire");

        let d = sim.find_compartments(dm.daughter)[0];
        let taken = sim.population(d, 0);
        assert_eq!(
            sim.population(mother, 0) + taken,
            100,
            "conservation broken at seed {}",
            seed
        );
        let t = taken as f64;
        sum += t;
        sum_sq += t * t;
    }
    let mean = sum / runs as f64;
    let var = sum_sq / runs as f64 - mean * mean;
    // Binomial(100, 0.5): mean 50, variance 25. The ensemble mean has
    // sd 0.05; allow five of those.
    assert!((mean - 50.0).abs() < 0.25, "daughter mean {}", mean);
    assert!((20.0..30.0).contains(&var), "daughter variance {}", var);
}

#[test]
fn test_repeated_divisions_conserve_total() {
    let dm = division_model();
    let mut sim = Simulation::new(Rc::clone(&dm.model), config(77)).unwrap();
    sim.run_until(4.0);
    assert!(sim.step_count() >= 2, "rate-1 division should fire a few times");

    let mut total = 0;
    for cid in sim.find_compartments(dm.cell) {
        total += sim.population(cid, 0);
    }
    for cid in sim.find_compartments(dm.daughter) {
        total += sim.population(cid, 0);
    }
    assert_eq!(total, 100, "molecules leaked across {} divisions", sim.step_count());
    assert_eq!(
        sim.find_compartments(dm.daughter).len() as u64,
        sim.step_count(),
        "each firing creates exactly one daughter"
    );
}

#[test]
fn test_virtual_split_measures_without_consuming() {
    // A virtual split reports into the buffer but leaves the mother's
    // population whole; the daughter then receives a copy.
    let mut m = Model::new();
    let cell = m.add_compartment_type("Cell", m.env(), true).unwrap();
    let daughter = m.add_compartment_type("Daughter", cell, true).unwrap();
    let a = m.add_chemical("A", true);
    m.reaction()
        .in_type(cell)
        .split_reactant(a, SplitFunction::new_virtual(SplitKind::Take { f: 0.25 }))
        .unwrap()
        .produce_compartment(daughter)
        .unwrap()
        .split_product(a, None)
        .unwrap()
        .finish(1.0)
        .unwrap();
    m.init_select_env();
    m.init_instantiate(cell, 1);
    m.init_select_env();
    m.init_select_type(cell);
    m.init_set_population(cell, a, RuntimeDistribution::delta(80.0), false);
    m.seal();

    let mut sim = Simulation::new(Rc::new(m), config(3)).unwrap();
    let mother = sim.find_compartments(cell)[0];
    sim.run_step().expect("reaction must fire");

    let d = sim.find_compartments(daughter)[0];
    assert_eq!(sim.population(mother, 0), 80, "virtual split must not consume");
    assert_eq!(sim.population(d, 0), 20, "Take(0.25) of 80");
}
