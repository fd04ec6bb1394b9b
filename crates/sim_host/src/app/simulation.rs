use std::sync::Arc;

use persistence::{ChangeEvent, ChangeKind, DirtyLevel, DirtyTracker, Persistable, SaveManager};
use tracing::debug;

use super::world::{
    starting_economy, starting_provinces, starting_roster, starting_technology, Economy,
    ProvinceMap, Roster, StateSystem, Technology, CHARACTERS, ECONOMY, PROVINCES, TECHNOLOGY,
};

const RESEARCH_PER_TICK: f32 = 0.2;
const AGING_INTERVAL_TICKS: u64 = 3;
const GROWTH_INTERVAL_TICKS: u64 = 4;
const POPULATION_GROWTH: u64 = 150;
const GROWTH_SIZE_DELTA_BYTES: isize = 12;

/// Demo world: four subsystems and the tick rules that mutate them.
pub(crate) struct Simulation {
    pub(crate) characters: Arc<StateSystem<Roster>>,
    pub(crate) economy: Arc<StateSystem<Economy>>,
    pub(crate) technology: Arc<StateSystem<Technology>>,
    pub(crate) provinces: Arc<StateSystem<ProvinceMap>>,
    tick: u64,
}

impl Simulation {
    pub(crate) fn new() -> Self {
        Self {
            characters: Arc::new(StateSystem::new(CHARACTERS, starting_roster())),
            economy: Arc::new(StateSystem::new(ECONOMY, starting_economy())),
            technology: Arc::new(StateSystem::new(TECHNOLOGY, starting_technology())),
            provinces: Arc::new(StateSystem::new(PROVINCES, starting_provinces())),
            tick: 0,
        }
    }

    pub(crate) fn tick_count(&self) -> u64 {
        self.tick
    }

    pub(crate) fn systems(&self) -> Vec<Arc<dyn Persistable>> {
        vec![
            Arc::clone(&self.characters) as Arc<dyn Persistable>,
            Arc::clone(&self.economy) as Arc<dyn Persistable>,
            Arc::clone(&self.technology) as Arc<dyn Persistable>,
            Arc::clone(&self.provinces) as Arc<dyn Persistable>,
        ]
    }

    /// Registers every subsystem with the manager and the tracker, sized by
    /// its current encoding.
    pub(crate) fn attach(&self, manager: &SaveManager, tracker: &DirtyTracker) {
        for system in self.systems() {
            let estimated = system
                .encode(0)
                .ok()
                .and_then(|value| serde_json::to_vec(&value).ok())
                .map_or(0, |bytes| bytes.len());
            tracker.register_system(system.name(), estimated);
            manager.register_system(system);
        }
    }

    /// Advances one tick and reports each mutation to `tracker`.
    pub(crate) fn step(&mut self, tracker: &DirtyTracker) {
        self.tick += 1;
        let tick = self.tick;

        let treasury = self.economy.update(|economy| {
            let trade: i64 = economy.trade_routes.iter().map(|route| route.value).sum();
            economy.treasury += economy.income + trade / 10;
            economy.treasury
        });
        tracker.record_change(
            ChangeEvent::new(ECONOMY, ChangeKind::Modified)
                .with_description(format!("treasury now {treasury}")),
        );

        let research = self.technology.update(|technology| {
            let current = technology.current.clone()?;
            technology.progress = (technology.progress + RESEARCH_PER_TICK).min(1.0);
            if technology.progress < 1.0 {
                return Some(None);
            }
            technology.researched.push(current.clone());
            technology.current = None;
            technology.progress = 0.0;
            Some(Some(current))
        });
        match research {
            Some(Some(tech)) => {
                tracker.record_change(
                    ChangeEvent::new(TECHNOLOGY, ChangeKind::Created)
                        .with_description(format!("researched {tech}")),
                );
                tracker.mark_dirty(TECHNOLOGY, DirtyLevel::Critical);
            }
            Some(None) => {
                tracker.mark_dirty(TECHNOLOGY, DirtyLevel::Dirty);
            }
            None => {}
        }

        if tick % AGING_INTERVAL_TICKS == 0 {
            let aged = self.characters.update(|roster| {
                for character in &mut roster.characters {
                    character.age += 1;
                }
                roster.characters.len()
            });
            tracker.record_change(
                ChangeEvent::new(CHARACTERS, ChangeKind::BulkUpdate)
                    .with_description(format!("{aged} characters aged")),
            );
        }

        if tick % GROWTH_INTERVAL_TICKS == 0 {
            let grown = self.provinces.update(|map| {
                for province in &mut map.provinces {
                    province.population += POPULATION_GROWTH;
                }
                map.provinces.len()
            });
            tracker.record_change(
                ChangeEvent::new(PROVINCES, ChangeKind::BulkUpdate)
                    .with_size_delta(GROWTH_SIZE_DELTA_BYTES)
                    .with_description(format!("{grown} provinces grew")),
            );
        }
        debug!(tick, dirty = tracker.dirty_count(), "simulation_tick");
    }
}
