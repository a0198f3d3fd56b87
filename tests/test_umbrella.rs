//! Umbrella (hierarchical) reaction scheduling
//!
//! A reaction whose reactants live above its products compiles into an
//! umbrella template plus a sub-template: the umbrella's propensity
//! rescales the timeline of the queue holding the sub-instances. These
//! tests pin the rescaling factor, the zero-propensity parking rule and
//! mid-run propensity changes.

use reaction_simulator_core::{
    Model, RateFunction, RuntimeDistribution, Simulation, SimulationConfig, TypeId,
};
use std::rc::Rc;

// ============================================================================
// Helpers
// ============================================================================

struct UmbrellaModel {
    model: Rc<Model>,
    cell: TypeId,
    p_species: u32,
}

/// Env species X gates production of P inside a Cell:
/// `X(rate):∅ --1.0--> P@Cell`, compiled as an Env umbrella over a Cell
/// sub-reaction with unit propensity.
fn umbrella_model(x0: f64) -> UmbrellaModel {
    let mut m = Model::new();
    let env = m.env();
    let cell = m.add_compartment_type("Cell", env, true).unwrap();
    let x = m.add_chemical("X", true);
    let p = m.add_chemical("P", true);

    m.reaction()
        .reactant(x, 0)
        .unwrap()
        .rate(RateFunction::Linear)
        .unwrap()
        .in_type(cell)
        .product(p, 1)
        .unwrap()
        .finish(1.0)
        .unwrap();

    m.init_select_env();
    m.init_instantiate(cell, 1);
    m.init_select_env();
    m.init_set_population(env, x, RuntimeDistribution::delta(x0), false);
    let p_species = m.species_index(cell, p);
    m.seal();
    UmbrellaModel {
        model: Rc::new(m),
        cell,
        p_species,
    }
}

fn config(seed: u64) -> SimulationConfig {
    SimulationConfig {
        seed: Some(seed),
        trace: false,
        ..SimulationConfig::default()
    }
}

fn final_p(model: &UmbrellaModel, seed: u64, t: f64) -> i64 {
    let mut sim = Simulation::new(Rc::clone(&model.model), config(seed)).unwrap();
    let cell = sim.find_compartments(model.cell)[0];
    sim.run_until(t);
    sim.population(cell, model.p_species)
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_child_rate_tracks_parent_propensity() {
    // With parent propensity a = X, the sub-reaction (unit local rate)
    // fires at a parent-time rate of X. T = 30 gives Poisson(30X)
    // counts; compare X = 1 against X = 2 over an ensemble.
    let slow = umbrella_model(1.0);
    let fast = umbrella_model(2.0);
    let runs = 200;

    let mut slow_total = 0.0;
    let mut fast_total = 0.0;
    for seed in 0..runs {
        slow_total += final_p(&slow, seed, 30.0) as f64;
        fast_total += final_p(&fast, seed, 30.0) as f64;
    }
    let slow_mean = slow_total / runs as f64;
    let fast_mean = fast_total / runs as f64;

    // sd of the means: sqrt(30/200) ≈ 0.39 and sqrt(60/200) ≈ 0.55
    assert!((slow_mean - 30.0).abs() < 1.2, "X=1 mean {}", slow_mean);
    assert!((fast_mean - 60.0).abs() < 1.7, "X=2 mean {}", fast_mean);
    let ratio = fast_mean / slow_mean;
    assert!(
        (1.85..2.15).contains(&ratio),
        "doubling the parent propensity must double the child rate, got {}",
        ratio
    );
}

#[test]
fn test_mean_interfiring_time_matches_propensity() {
    let model = umbrella_model(2.0);
    let runs = 200;
    let mut firings = 0u64;
    for seed in 0..runs {
        firings += final_p(&model, seed, 30.0) as u64;
    }
    // Mean inter-firing time in parent time should be 1/(c·X) = 0.5
    let mean_gap = (30.0 * runs as f64) / firings as f64;
    assert!(
        (mean_gap - 0.5).abs() < 0.05,
        "mean inter-firing time {} too far from 0.5",
        mean_gap
    );
}

#[test]
fn test_zero_propensity_umbrella_parks_sub_events() {
    let model = umbrella_model(0.0);
    let mut sim = Simulation::new(Rc::clone(&model.model), config(1)).unwrap();
    let cell = sim.find_compartments(model.cell)[0];

    sim.run_until(50.0);
    assert_eq!(sim.step_count(), 0, "nothing may fire under a zero umbrella");
    assert_eq!(sim.population(cell, model.p_species), 0);

    // Revival: the sub-event was mutated but never fired; a positive
    // propensity lets it surface again
    let env = sim.env();
    sim.set_population(env, 0, 1);
    sim.run_until(100.0);
    assert!(
        sim.step_count() > 0,
        "umbrella must revive when its propensity becomes positive"
    );
    assert!(sim.population(cell, model.p_species) > 0);
}

#[test]
fn test_propensity_change_mid_run_rescales_timeline() {
    let model = umbrella_model(1.0);
    let mut sim = Simulation::new(Rc::clone(&model.model), config(21)).unwrap();
    let cell = sim.find_compartments(model.cell)[0];
    let env = sim.env();

    sim.run_until(10.0);
    let first_half = sim.population(cell, model.p_species);

    sim.set_population(env, 0, 5);
    sim.run_until(20.0);
    let second_half = sim.population(cell, model.p_species) - first_half;

    // ~Poisson(10) against ~Poisson(50); overlap is negligible
    assert!(
        second_half > first_half,
        "5x propensity should dominate: {} vs {}",
        first_half,
        second_half
    );
}

#[test]
fn test_two_cells_share_one_umbrella() {
    // Both cells' sub-reactions live in the same Env umbrella queue and
    // each fires at the umbrella's rate
    let mut m = Model::new();
    let env = m.env();
    let cell = m.add_compartment_type("Cell", env, true).unwrap();
    let x = m.add_chemical("X", true);
    let p = m.add_chemical("P", true);
    m.reaction()
        .reactant(x, 0)
        .unwrap()
        .rate(RateFunction::Linear)
        .unwrap()
        .in_type(cell)
        .product(p, 1)
        .unwrap()
        .finish(1.0)
        .unwrap();
    m.init_select_env();
    m.init_instantiate(cell, 2);
    m.init_select_env();
    m.init_set_population(env, x, RuntimeDistribution::delta(1.0), false);
    let p_species = m.species_index(cell, p);
    m.seal();

    let runs = 200;
    let model = Rc::new(m);
    let mut totals = [0.0f64; 2];
    for seed in 0..runs {
        let mut sim = Simulation::new(Rc::clone(&model), config(seed)).unwrap();
        let cells = sim.find_compartments(cell);
        assert_eq!(cells.len(), 2);
        sim.run_until(30.0);
        totals[0] += sim.population(cells[0], p_species) as f64;
        totals[1] += sim.population(cells[1], p_species) as f64;
    }
    for (i, total) in totals.iter().enumerate() {
        let mean = total / runs as f64;
        assert!(
            (mean - 30.0).abs() < 1.3,
            "cell {} mean {} too far from 30",
            i,
            mean
        );
    }
}
