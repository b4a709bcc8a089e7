//! End-to-end mechanics scenarios with seeded dice.

use voidtable::voidtable::dice::DiceRoller;
use voidtable::voidtable::mechanics::{
    ActionType, Attribute, ClockSpec, MechanicsEngine, OutcomeTier,
};

/// Find a seed whose first d20 is the given value, so scenario tests can pin
/// exact rolls without reaching into the RNG.
fn seed_with_first_d20(target: i32) -> u64 {
    for seed in 0..10_000u64 {
        if DiceRoller::seeded(seed).d20() == target {
            return seed;
        }
    }
    panic!("no seed found with first d20 == {}", target);
}

#[test]
fn test_unskilled_failure_scenario() {
    // Attr 3, no skill, DC 20, d20 = 7 → total 5, margin -15, Failure.
    let seed = seed_with_first_d20(7);
    let mut engine = MechanicsEngine::new(DiceRoller::seeded(seed));
    let resolution = engine.resolve_action(
        "force the bulkhead",
        Attribute::Strength,
        None,
        3,
        0,
        20,
        None,
        None,
    );
    assert_eq!(resolution.roll, 7);
    assert_eq!(resolution.total, 5);
    assert_eq!(resolution.margin, -15);
    assert_eq!(resolution.outcome_tier, OutcomeTier::Failure);
    assert!(!resolution.success);
}

#[test]
fn test_ritual_without_offering_scenario() {
    // Willpower 4 × Astral Arts 3 + d20(15) = 27, +2 primary tool = 29 vs
    // DC 22 → margin +7 (Moderate). No offering: tier downgrades to Marginal
    // and +1 Void is recorded for the action id (but never double-charged).
    let seed = seed_with_first_d20(15);
    let mut engine = MechanicsEngine::new(DiceRoller::seeded(seed));
    let outcome = engine.resolve_ritual(
        "attune the shrine",
        4,
        3,
        22,
        true,  // primary tool
        false, // offering
        false, // altar
        Some("player_01"),
        None,
    );

    assert_eq!(outcome.resolution.roll, 15);
    assert_eq!(outcome.resolution.total, 29);
    assert_eq!(outcome.resolution.margin, 7);
    assert!(outcome.resolution.success);
    // Moderate downgraded one step.
    assert_eq!(outcome.resolution.outcome_tier, OutcomeTier::Marginal);
    assert_eq!(outcome.void_change, 1);
    assert!(outcome
        .consequences
        .iter()
        .any(|c| c.contains("No offering")));

    // The void is applied once under the action id; a duplicate application
    // attempt with the same id leaves the score unchanged.
    let action_id = "player_01_attune_29";
    let state = engine.void_state("player_01");
    assert_eq!(state.add_void(outcome.void_change, "ritual", Some(action_id), false), 1);
    assert_eq!(state.add_void(1, "parser retry", Some(action_id), false), 1);
}

#[test]
fn test_clock_cascade_prevention_scenario() {
    // Two resolutions each queue +3 on a 4-tick clock. After the synthesis
    // flush the clock fills exactly once at 6/4 (+2 overflow) and is expired
    // exactly once.
    let mut engine = MechanicsEngine::new(DiceRoller::seeded(1));
    engine.create_scene_clock(ClockSpec {
        name: "Alarm".to_string(),
        maximum: 4,
        ..Default::default()
    });

    engine.queue_clock_update("Alarm", 3, "first breach");
    engine.queue_clock_update("Alarm", 3, "second breach");

    // Queued updates are invisible until the flush.
    assert_eq!(engine.scene_clocks["Alarm"].current, 0);

    let deltas = engine.apply_queued_clock_updates();
    assert_eq!(deltas["Alarm"].after, 6);
    assert!(deltas["Alarm"].filled);
    assert_eq!(engine.scene_clocks["Alarm"].overflow(), 2);

    let filled = engine.take_filled_clocks();
    assert_eq!(filled.len(), 1, "the fill fires once, not per update");

    let expired = engine.check_and_expire_clocks();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].removal_reason, "filled");
    assert!(engine.scene_clocks.is_empty());
}

#[test]
fn test_dc_boundaries_clamp() {
    let mut engine = MechanicsEngine::new(DiceRoller::seeded(1));
    // Extreme + max void pressure cannot exceed 40.
    engine.scene_void_level = 9;
    let dc = engine.calculate_dc("impossible feat", ActionType::Ritual, true, true, true, false);
    assert!(dc <= 40);
    // Inter-party social under calm conditions hits the floor of 10.
    engine.scene_void_level = 0;
    let dc = engine.calculate_dc("tell Mira the plan", ActionType::Social, false, false, false, true);
    assert_eq!(dc, 10);
}

#[test]
fn test_minimum_total_is_valid() {
    // Unskilled, attribute 1, natural 1: total -3 is a legal failing total.
    let seed = seed_with_first_d20(1);
    let mut engine = MechanicsEngine::new(DiceRoller::seeded(seed));
    let resolution = engine.resolve_action(
        "flail in the dark",
        Attribute::Strength,
        None,
        1,
        0,
        20,
        None,
        None,
    );
    assert_eq!(resolution.total, -3);
    assert!(!resolution.success);
}

#[test]
fn test_scene_cap_requires_high_risk() {
    let mut engine = MechanicsEngine::new(DiceRoller::seeded(1));
    let state = engine.void_state("p1");
    // Fill the scene cap across rounds.
    state.add_void(1, "a", Some("a1"), false);
    state.add_void(1, "b", Some("a2"), false);
    state.reset_round_void();
    state.add_void(1, "c", Some("a3"), false);
    assert_eq!(state.score, 3);
    // Blocked without the flag, allowed with it.
    state.reset_round_void();
    assert_eq!(state.add_void(1, "d", Some("a4"), false), 3);
    assert_eq!(state.add_void(1, "rite", Some("a5"), true), 4);
}

#[test]
fn test_edge_fill_triggers_once() {
    let mut engine = MechanicsEngine::new(DiceRoller::seeded(1));
    engine.create_scene_clock(ClockSpec {
        name: "Countdown".to_string(),
        maximum: 4,
        ..Default::default()
    });
    engine.queue_clock_update("Countdown", 3, "setup");
    engine.apply_queued_clock_updates();
    assert!(engine.take_filled_clocks().is_empty());

    // current = maximum - 1; a single tick fills it.
    engine.queue_clock_update("Countdown", 1, "final tick");
    engine.apply_queued_clock_updates();
    let filled = engine.take_filled_clocks();
    assert_eq!(filled.len(), 1);
    assert_eq!(filled[0].clock_name, "Countdown");
}
