use std::env;

use persistence::{DirtyTracker, DirtyTrackerConfig, SaveManager, SaveManagerConfig, SaveResult};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use super::simulation::Simulation;

const TICKS_ENV_VAR: &str = "SIM_TICKS";
const SAVE_SLOT_ENV_VAR: &str = "SIM_SAVE_SLOT";
const AUTOSAVE_INTERVAL_ENV_VAR: &str = "SIM_AUTOSAVE_INTERVAL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HostOptions {
    pub(crate) ticks: u64,
    pub(crate) save_slot: String,
    /// Forces a save every N ticks even when the tracker sees no trigger.
    pub(crate) autosave_interval: u64,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            ticks: 12,
            save_slot: "campaign".to_string(),
            autosave_interval: 5,
        }
    }
}

impl HostOptions {
    pub(crate) fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut options = Self::default();
        if let Some(ticks) = parse_positive(&lookup, TICKS_ENV_VAR) {
            options.ticks = ticks;
        }
        if let Some(interval) = parse_positive(&lookup, AUTOSAVE_INTERVAL_ENV_VAR) {
            options.autosave_interval = interval;
        }
        if let Some(slot) = lookup(SAVE_SLOT_ENV_VAR) {
            let slot = slot.trim();
            if slot.is_empty() {
                warn!(var = SAVE_SLOT_ENV_VAR, "empty_save_slot_ignored");
            } else {
                options.save_slot = slot.to_string();
            }
        }
        options
    }
}

fn parse_positive(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Option<u64> {
    let raw = lookup(var)?;
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            warn!(var, value = %raw, "invalid_env_override_ignored");
            None
        }
    }
}

pub(crate) struct HostWiring {
    pub(crate) manager: SaveManager,
    pub(crate) tracker: DirtyTracker,
    pub(crate) simulation: Simulation,
    pub(crate) options: HostOptions,
}

pub(crate) fn build_host() -> SaveResult<HostWiring> {
    init_tracing();
    info!("=== Sim Persistence Host ===");
    build_host_with(SaveManagerConfig::default().with_env_overrides(), HostOptions::from_env())
}

pub(crate) fn build_host_with(config: SaveManagerConfig, options: HostOptions) -> SaveResult<HostWiring> {
    let manager = SaveManager::new(config)?;
    let tracker = DirtyTracker::new(DirtyTrackerConfig::default());
    let simulation = Simulation::new();
    simulation.attach(&manager, &tracker);
    info!(
        save_dir = %manager.save_dir().display(),
        slot = %options.save_slot,
        ticks = options.ticks,
        systems = manager.registered_system_names().len(),
        "host_wired"
    );
    Ok(HostWiring {
        manager,
        tracker,
        simulation,
        options,
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .init();
}
