use std::process::ExitCode;

use persistence::{IncrementalSaver, SaveError, SaveResult, SaveStrategy};
use tracing::{error, info, warn};

use super::bootstrap::HostWiring;
use super::simulation::Simulation;
use super::world::{Economy, ProvinceMap, Roster, Technology};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SessionSummary {
    pub(crate) ticks: u64,
    pub(crate) resumed: bool,
    pub(crate) full_saves: u64,
    pub(crate) incremental_saves: u64,
    pub(crate) recovered_files: usize,
}

#[derive(Debug, Clone, PartialEq)]
struct WorldSnapshot {
    characters: Roster,
    economy: Economy,
    technology: Technology,
    provinces: ProvinceMap,
}

pub(crate) fn run(mut host: HostWiring) -> ExitCode {
    match run_session(&mut host) {
        Ok(summary) => {
            info!(
                ticks = summary.ticks,
                resumed = summary.resumed,
                full_saves = summary.full_saves,
                incremental_saves = summary.incremental_saves,
                recovered = summary.recovered_files,
                "host_finished"
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "host_failed");
            if let Some(fix) = err.suggested_fix() {
                error!(suggested_fix = fix, "host_failed_hint");
            }
            ExitCode::FAILURE
        }
    }
}

/// Recovers, resumes the slot if present, runs the configured ticks with
/// tracker-driven saves, then verifies a final save round-trips.
pub(crate) fn run_session(host: &mut HostWiring) -> SaveResult<SessionSummary> {
    let HostWiring {
        manager,
        tracker,
        simulation,
        options,
    } = host;
    let mut summary = SessionSummary::default();

    let recovery = manager.recover_from_crash()?;
    summary.recovered_files = recovery.recovered.len();
    for (path, reason) in &recovery.failed {
        warn!(file = %path.display(), reason = %reason, "unrecoverable_save");
    }

    if manager.save_file_exists(&options.save_slot) {
        let loaded = manager.load_game(&options.save_slot)?;
        for warning in &loaded.warnings {
            warn!(warning = %warning, "load_warning");
        }
        info!(
            slot = %options.save_slot,
            migrated = loaded.migration_performed,
            "session_resumed"
        );
        tracker.mark_all_clean();
        summary.resumed = true;
    }

    let saver = IncrementalSaver::new(tracker);
    for _ in 0..options.ticks {
        simulation.step(tracker);
        let tick = simulation.tick_count();

        let schedule = saver.evaluate_auto_save_schedule();
        let forced = tick % options.autosave_interval == 0;
        if !schedule.should_save_now && !forced {
            continue;
        }
        info!(tick, reason = %schedule.reason, forced, "autosave_triggered");
        let (strategy, saved) = saver.perform_smart_save(
            |_| manager.save_game(&options.save_slot).map(|_| ()),
            |systems| manager.save_incremental(&options.save_slot, systems).map(|_| ()),
        )?;
        match strategy {
            SaveStrategy::Full => summary.full_saves += 1,
            SaveStrategy::Incremental | SaveStrategy::Priority => summary.incremental_saves += 1,
            SaveStrategy::NoSaveNeeded => {}
        }
        info!(tick, strategy = strategy.description(), systems = saved.len(), "autosave_completed");
    }
    summary.ticks = options.ticks;

    let expected = snapshot(simulation);
    let saved = manager.save_game(&options.save_slot)?;
    tracker.mark_all_clean();
    summary.full_saves += 1;
    let loaded = manager.load_game(&options.save_slot)?;
    if snapshot(simulation) != expected || loaded.checksum != saved.checksum {
        return Err(SaveError::ValidationFailed {
            summary: "reloaded world differs from the saved world".to_string(),
            suggested_fix: None,
        });
    }

    let metrics = saver.metrics();
    info!(
        incremental = metrics.incremental_saves,
        full = metrics.full_saves,
        speedup = metrics.speedup_ratio(),
        "incremental_metrics"
    );
    info!(stats = %manager.save_stats().to_json(), "save_stats");
    info!(tracker = %tracker.stats().render_human_readable(), "tracker_stats");
    manager.shutdown();
    Ok(summary)
}

fn snapshot(simulation: &Simulation) -> WorldSnapshot {
    WorldSnapshot {
        characters: simulation.characters.snapshot(),
        economy: simulation.economy.snapshot(),
        technology: simulation.technology.snapshot(),
        provinces: simulation.provinces.snapshot(),
    }
}
