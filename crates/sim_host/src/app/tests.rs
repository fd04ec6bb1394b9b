use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use persistence::{DirtyLevel, DirtyTracker, DirtyTrackerConfig, Persistable, SaveManagerConfig};
use serde_json::json;
use tempfile::TempDir;

use super::bootstrap::{build_host_with, HostOptions};
use super::loop_runner::run_session;
use super::simulation::Simulation;
use super::world::{starting_technology, StateSystem, Technology, PROVINCES, TECHNOLOGY};

fn config_in(dir: &TempDir) -> SaveManagerConfig {
    SaveManagerConfig {
        operation_timeout: Duration::from_secs(10),
        ..SaveManagerConfig::default().with_save_dir(dir.path())
    }
}

fn options(ticks: u64) -> HostOptions {
    HostOptions {
        ticks,
        save_slot: "test_campaign".to_string(),
        autosave_interval: 3,
    }
}

#[test]
fn host_options_read_overrides_and_ignore_bad_values() {
    let vars = HashMap::from([
        ("SIM_TICKS", "40"),
        ("SIM_SAVE_SLOT", "  ironman "),
        ("SIM_AUTOSAVE_INTERVAL", "zero"),
    ]);
    let options = HostOptions::from_lookup(|key| vars.get(key).map(|value| value.to_string()));
    assert_eq!(options.ticks, 40);
    assert_eq!(options.save_slot, "ironman");
    assert_eq!(options.autosave_interval, HostOptions::default().autosave_interval);

    let zero = HashMap::from([("SIM_TICKS", "0")]);
    let options = HostOptions::from_lookup(|key| zero.get(key).map(|value| value.to_string()));
    assert_eq!(options.ticks, HostOptions::default().ticks);
}

#[test]
fn invalid_payload_is_rejected_with_its_path_and_state_is_kept() {
    let system = StateSystem::new(TECHNOLOGY, starting_technology());
    let error = system
        .decode(&json!({"researched": [], "current": null, "progress": 4.0}), 10200)
        .expect_err("progress out of range");
    assert!(error.contains("progress"), "{error}");
    assert_eq!(system.snapshot(), starting_technology());

    let error = system
        .check_payload(&json!({"researched": [7], "current": null, "progress": 0.5}), 10200)
        .expect_err("wrong element type");
    assert!(error.contains("researched[0]"), "{error}");
}

#[test]
fn decode_replaces_state_and_default_resets_it() {
    let system = StateSystem::new(TECHNOLOGY, starting_technology());
    system
        .decode(
            &json!({"researched": ["writing"], "current": "iron_working", "progress": 0.5}),
            10200,
        )
        .expect("decode");
    assert_eq!(
        system.snapshot(),
        Technology {
            researched: vec!["writing".to_string()],
            current: Some("iron_working".to_string()),
            progress: 0.5,
        }
    );
    system.load_default();
    assert_eq!(system.snapshot(), Technology::default());
}

#[test]
fn finishing_research_marks_technology_critical() {
    let tracker = DirtyTracker::new(DirtyTrackerConfig::default());
    let mut simulation = Simulation::new();
    for system in simulation.systems() {
        tracker.register_system(system.name(), 64);
    }
    for _ in 0..6 {
        simulation.step(&tracker);
    }
    assert!(simulation
        .technology
        .snapshot()
        .researched
        .contains(&"writing".to_string()));
    assert_eq!(
        tracker.state(TECHNOLOGY).map(|state| state.level),
        Some(DirtyLevel::Critical)
    );
    assert!(tracker.is_dirty(PROVINCES));
}

#[test]
fn session_saves_and_verifies_round_trip() {
    let dir = TempDir::new().expect("tempdir");
    let mut host = build_host_with(config_in(&dir), options(7)).expect("host");
    let summary = run_session(&mut host).expect("session");

    assert_eq!(summary.ticks, 7);
    assert!(!summary.resumed);
    assert!(summary.full_saves >= 1);
    assert!(dir.path().join("test_campaign.save").is_file());
    assert!(!host.tracker.has_dirty_systems());
}

#[test]
fn second_session_resumes_from_the_saved_slot() {
    let dir = TempDir::new().expect("tempdir");
    let mut first = build_host_with(config_in(&dir), options(4)).expect("first host");
    run_session(&mut first).expect("first session");
    let treasury_after_first = first.simulation.economy.snapshot().treasury;

    let mut second = build_host_with(config_in(&dir), options(2)).expect("second host");
    let summary = run_session(&mut second).expect("second session");
    assert!(summary.resumed);
    assert!(second.simulation.economy.snapshot().treasury > treasury_after_first);
}

#[test]
fn legacy_province_save_gains_taxation_on_load() {
    let dir = TempDir::new().expect("tempdir");
    let legacy = json!({
        "header": {"version": "1.0.0", "timestamp": 1_600_000_000, "product": "Sim Persistence Demo"},
        "systems": {
            "provinces": [{"id": 9, "name": "Oldmoor", "population": 300}]
        }
    });
    fs::write(dir.path().join("legacy.save"), legacy.to_string()).expect("write legacy");

    let host = build_host_with(config_in(&dir), options(1)).expect("host");
    let loaded = host.manager.load_game("legacy").expect("load legacy");
    assert!(loaded.migration_performed);

    let provinces = host.simulation.provinces.snapshot().provinces;
    assert_eq!(provinces.len(), 1);
    assert_eq!(provinces[0].name, "Oldmoor");
    let taxation = provinces[0].taxation.expect("taxation added by migration");
    assert!((taxation.base_rate - 0.1).abs() < f64::EPSILON);
    assert!(loaded
        .warnings
        .iter()
        .any(|warning| warning.contains("characters")));
}
