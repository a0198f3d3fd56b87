//! Compartment lifecycle: destruction, orphaning, moves, interface
//! reactions
//!
//! Destroying a compartment mid-step must unhook every reaction
//! instance it owned, silently drop its pending wait-list releases and
//! leave the surviving event graph consistent.

use reaction_simulator_core::{
    Model, RateFunction, ReactionTemplate, RuntimeDistribution, Simulation, SimulationConfig,
    TraceEvent,
};
use std::rc::Rc;

fn config(seed: u64) -> SimulationConfig {
    SimulationConfig {
        seed: Some(seed),
        trace: true,
        ..SimulationConfig::default()
    }
}

// ============================================================================
// Fire-once destruction
// ============================================================================

#[test]
fn test_fire_once_reaction_destroys_its_compartment() {
    let mut m = Model::new();
    let cell = m.add_compartment_type("Cell", m.env(), true).unwrap();
    let a = m.add_chemical("A", true);
    m.reaction()
        .in_type(cell)
        .reactant(a, 1)
        .unwrap()
        .destroy_compartment()
        .unwrap()
        .finish(1.0)
        .unwrap();
    m.init_select_env();
    m.init_instantiate(cell, 1);
    m.init_select_env();
    m.init_select_type(cell);
    m.init_set_population(cell, a, RuntimeDistribution::delta(3.0), false);
    m.seal();

    let mut sim = Simulation::new(Rc::new(m), config(4)).unwrap();
    assert_eq!(sim.compartment_count(), 2);
    assert_eq!(sim.instance_count(), 1);

    sim.run_until(100.0);

    assert_eq!(sim.find_compartments(cell).len(), 0, "cell must be gone");
    assert_eq!(sim.compartment_count(), 1, "only Env survives");
    assert_eq!(sim.instance_count(), 0, "the fire-once instance died with its compartment");
    assert_eq!(sim.step_count(), 1, "a destroyed reaction cannot fire again");
    assert_eq!(
        sim.trace()
            .count_matching(|e| matches!(e, TraceEvent::CompartmentDestroyed { .. })),
        1
    );
}

#[test]
fn test_destruction_drops_pending_releases_without_firing() {
    let mut m = Model::new();
    let cell = m.add_compartment_type("Cell", m.env(), true).unwrap();
    let a = m.add_chemical("A", true);
    let b = m.add_chemical("B", true);
    m.reaction()
        .in_type(cell)
        .reactant(a, 1)
        .unwrap()
        .destroy_compartment()
        .unwrap()
        .finish(1.0)
        .unwrap();
    m.init_select_env();
    m.init_instantiate(cell, 1);
    m.init_select_env();
    m.init_select_type(cell);
    m.init_set_population(cell, a, RuntimeDistribution::delta(1.0), false);
    // A release far in the future, guaranteed to be outlived by the
    // destruction
    m.init_add_to_wait_list(
        cell,
        b,
        RuntimeDistribution::delta(1.0),
        RuntimeDistribution::delta(1000.0),
        false,
    );
    m.seal();

    let mut sim = Simulation::new(Rc::new(m), config(8)).unwrap();
    sim.run_until(2000.0);

    assert_eq!(sim.find_compartments(cell).len(), 0);
    // Exactly one firing: the destroy. The release never happened.
    assert_eq!(sim.step_count(), 1);
    assert_eq!(
        sim.trace()
            .count_matching(|e| matches!(e, TraceEvent::DelayedRelease { .. })),
        1,
        "the release was scheduled"
    );
}

// ============================================================================
// Destruction under an umbrella
// ============================================================================

#[test]
fn test_destroying_sub_compartment_leaves_umbrella_consistent() {
    let mut m = Model::new();
    let env = m.env();
    let cell = m.add_compartment_type("Cell", env, true).unwrap();
    let x = m.add_chemical("X", true);
    let p = m.add_chemical("P", true);
    let a = m.add_chemical("A", true);
    // Umbrella-spanning production into the cell
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
    // Independent destroy reaction inside the cell
    m.reaction()
        .in_type(cell)
        .reactant(a, 1)
        .unwrap()
        .destroy_compartment()
        .unwrap()
        .finish(10.0)
        .unwrap();
    m.init_select_env();
    m.init_instantiate(cell, 1);
    m.init_select_env();
    m.init_set_population(env, x, RuntimeDistribution::delta(1.0), false);
    m.init_select_env();
    m.init_select_type(cell);
    m.init_set_population(cell, a, RuntimeDistribution::delta(1.0), false);
    m.seal();

    let mut sim = Simulation::new(Rc::new(m), config(12)).unwrap();
    // Env umbrella + cell sub-instance + cell destroy instance
    assert_eq!(sim.instance_count(), 3);

    sim.run_until(50.0);
    assert_eq!(sim.find_compartments(cell).len(), 0, "destroy wins eventually");
    assert_eq!(
        sim.instance_count(),
        1,
        "only the Env umbrella survives the cell"
    );

    // The umbrella's dependency on X must still be live and harmless:
    // changing X walks the dependency slice (skipping any tombstones)
    // and reschedules the umbrella onto an empty sub-queue
    let env_c = sim.env();
    sim.set_population(env_c, 0, 50);
    sim.run_until(100.0);
    let steps_after = sim.step_count();
    sim.run_until(150.0);
    assert_eq!(sim.step_count(), steps_after, "an empty umbrella never fires");
}

// ============================================================================
// Orphan / move
// ============================================================================

#[test]
fn test_orphan_keeps_populations_and_stops_reactions() {
    let mut m = Model::new();
    let cell = m.add_compartment_type("Cell", m.env(), true).unwrap();
    let a = m.add_chemical("A", true);
    m.reaction()
        .in_type(cell)
        .product(a, 1)
        .unwrap()
        .finish(5.0)
        .unwrap();
    m.init_select_env();
    m.init_instantiate(cell, 1);
    m.seal();

    let mut sim = Simulation::new(Rc::new(m), config(6)).unwrap();
    let cell_c = sim.find_compartments(cell)[0];
    sim.run_until(4.0);
    let grown = sim.population(cell_c, 0);
    assert!(grown > 0, "rate-5 production should have fired by t = 4");

    sim.orphan_compartment(cell_c);
    sim.update();
    assert_eq!(sim.instance_count(), 0, "orphaning destroys the bank");
    assert_eq!(sim.population(cell_c, 0), grown, "populations survive orphaning");

    sim.run_until(8.0);
    assert_eq!(sim.population(cell_c, 0), grown, "orphans have no reactions");

    // Moving back re-instantiates the bank and production resumes
    let env_c = sim.env();
    sim.move_compartment_into(cell_c, env_c).unwrap();
    assert_eq!(sim.instance_count(), 1);
    sim.run_until(12.0);
    assert!(sim.population(cell_c, 0) > grown);
}

#[test]
fn test_move_rejects_wrong_parent_type() {
    let mut m = Model::new();
    let cell = m.add_compartment_type("Cell", m.env(), true).unwrap();
    let nucleus = m.add_compartment_type("Nucleus", cell, true).unwrap();
    m.init_select_env();
    m.init_instantiate(cell, 2);
    m.seal();

    let mut sim = Simulation::new(Rc::new(m), config(2)).unwrap();
    let cells = sim.find_compartments(cell);
    let n = sim.instantiate(nucleus, cells[0]).unwrap();
    // A nucleus can hop between cells but not into Env
    let env_c = sim.env();
    assert!(sim.move_compartment_into(n, env_c).is_err());
    sim.move_compartment_into(n, cells[1]).unwrap();
    assert_eq!(sim.compartment(n).unwrap().parent, Some(cells[1]));
}

// ============================================================================
// Interface reactions (explicit compartment tuples)
// ============================================================================

#[test]
fn test_interface_reaction_spans_two_compartments() {
    let mut m = Model::new();
    let cell = m.add_compartment_type("Cell", m.env(), true).unwrap();
    let a = m.add_chemical("A", true);
    let b = m.add_chemical("B", true);
    let a_idx = m.species_index(cell, a);
    let b_idx = m.species_index(cell, b);

    // A in the first compartment becomes B in the second
    let mut tmpl = ReactionTemplate::new(false, false);
    tmpl.set_c(3.0);
    tmpl.add_reactant(0, a_idx, 1, RateFunction::Linear);
    tmpl.add_product(1, b_idx, 1, RuntimeDistribution::delta(0.0));
    let tmpl_idx = m.add_free_template(tmpl);

    m.init_select_env();
    m.init_instantiate(cell, 2);
    m.init_select_env();
    m.init_select_type(cell);
    m.init_set_population(cell, a, RuntimeDistribution::delta(40.0), false);
    m.seal();

    let mut sim = Simulation::new(Rc::new(m), config(15)).unwrap();
    let cells = sim.find_compartments(cell);
    let (donor, acceptor) = (cells[0], cells[1]);
    sim.bind_reaction(tmpl_idx, &[donor, acceptor]).unwrap();

    sim.run_until(20.0);

    let moved = 40 - sim.population(donor, a_idx);
    assert!(moved > 0, "the interface reaction never fired");
    assert_eq!(
        sim.population(acceptor, b_idx),
        moved,
        "every consumed A must appear as B across the interface"
    );
    assert_eq!(sim.population(acceptor, a_idx), 40, "acceptor's own A untouched");
}

#[test]
fn test_bind_reaction_arity_mismatch_rejected() {
    let mut m = Model::new();
    let cell = m.add_compartment_type("Cell", m.env(), true).unwrap();
    let a = m.add_chemical("A", true);
    let a_idx = m.species_index(cell, a);
    let mut tmpl = ReactionTemplate::new(false, false);
    tmpl.add_reactant(0, a_idx, 1, RateFunction::Linear);
    tmpl.add_product(1, a_idx, 1, RuntimeDistribution::delta(0.0));
    let tmpl_idx = m.add_free_template(tmpl);
    m.init_select_env();
    m.init_instantiate(cell, 1);
    m.seal();

    let mut sim = Simulation::new(Rc::new(m), config(1)).unwrap();
    let cells = sim.find_compartments(cell);
    assert!(sim.bind_reaction(tmpl_idx, &[cells[0]]).is_err());
    assert!(sim.bind_reaction(99, &[cells[0], cells[0]]).is_err());
}

// ============================================================================
// Explicit destruction API
// ============================================================================

#[test]
fn test_destroy_compartment_annihilates_descendants() {
    let mut m = Model::new();
    let cell = m.add_compartment_type("Cell", m.env(), true).unwrap();
    let nucleus = m.add_compartment_type("Nucleus", cell, true).unwrap();
    m.init_select_env();
    m.init_instantiate(cell, 1);
    m.init_select_env();
    m.init_select_type(cell);
    m.init_instantiate(nucleus, 3);
    m.seal();

    let mut sim = Simulation::new(Rc::new(m), config(1)).unwrap();
    assert_eq!(sim.compartment_count(), 5);
    let cell_c = sim.find_compartments(cell)[0];

    sim.destroy_compartment(cell_c);
    assert_eq!(sim.compartment_count(), 1);
    assert!(sim.find_compartments(nucleus).is_empty());
    assert_eq!(
        sim.trace()
            .count_matching(|e| matches!(e, TraceEvent::CompartmentDestroyed { .. })),
        4
    );

    // Destroying again is a no-op, and the id never aliases a newcomer
    sim.destroy_compartment(cell_c);
    assert_eq!(sim.compartment_count(), 1);
}
