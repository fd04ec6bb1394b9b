use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{SaveError, SaveResult};
use crate::sync;
use crate::version::SaveVersion;

pub type MigrationTransform = Arc<dyn Fn(&mut Value) -> Result<(), String> + Send + Sync>;

/// One registered edge of the migration graph.
#[derive(Clone)]
pub struct MigrationStep {
    pub from: SaveVersion,
    pub to: SaveVersion,
    pub description: String,
    transform: MigrationTransform,
}

impl std::fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStep")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl MigrationStep {
    pub fn summary(&self) -> String {
        format!("{} -> {}: {}", self.from, self.to, self.description)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MigrationOutcome {
    pub applied: Vec<String>,
    pub final_version: Option<SaveVersion>,
}

impl MigrationOutcome {
    pub fn was_migrated(&self) -> bool {
        !self.applied.is_empty()
    }
}

/// Directed graph of save-format transforms. Lookups take a read lock, so
/// concurrent loads can search while registration is serialized.
#[derive(Default)]
pub struct MigrationRegistry {
    edges: RwLock<HashMap<SaveVersion, Vec<MigrationStep>>>,
}

impl std::fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationRegistry")
            .field("edge_count", &self.edge_count())
            .finish()
    }
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in 1.0.0 -> 1.1.0 -> 1.2.0 chain.
    pub fn with_default_migrations() -> Self {
        let registry = Self::new();
        registry.register(
            SaveVersion::new(1, 0, 0),
            SaveVersion::new(1, 1, 0),
            "Add province taxation block",
            add_province_taxation,
        );
        registry.register(
            SaveVersion::new(1, 1, 0),
            SaveVersion::new(1, 2, 0),
            "Add diplomatic relations tracking",
            add_diplomacy_system,
        );
        registry
    }

    pub fn register<F>(
        &self,
        from: SaveVersion,
        to: SaveVersion,
        description: impl Into<String>,
        transform: F,
    ) where
        F: Fn(&mut Value) -> Result<(), String> + Send + Sync + 'static,
    {
        let step = MigrationStep {
            from: from.clone(),
            to,
            description: description.into(),
            transform: Arc::new(transform),
        };
        debug!(edge = %step.summary(), "migration_registered");
        sync::write(&self.edges, "migration_register")
            .entry(from)
            .or_default()
            .push(step);
    }

    pub fn edge_count(&self) -> usize {
        sync::read(&self.edges, "migration_edge_count")
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn registered_edges(&self) -> Vec<String> {
        let edges = sync::read(&self.edges, "migration_list");
        let mut summaries = edges
            .values()
            .flatten()
            .map(MigrationStep::summary)
            .collect::<Vec<_>>();
        summaries.sort();
        summaries
    }

    /// Shortest chain of steps from `from` to `to` by breadth-first search.
    pub fn find_path(&self, from: &SaveVersion, to: &SaveVersion) -> SaveResult<Vec<MigrationStep>> {
        if from == to {
            return Ok(Vec::new());
        }

        let edges = sync::read(&self.edges, "migration_find_path");
        let mut parents: HashMap<SaveVersion, MigrationStep> = HashMap::new();
        let mut visited: HashSet<SaveVersion> = HashSet::from([from.clone()]);
        let mut queue: VecDeque<SaveVersion> = VecDeque::from([from.clone()]);

        while let Some(current) = queue.pop_front() {
            if &current == to {
                break;
            }
            let Some(outgoing) = edges.get(&current) else {
                continue;
            };
            for step in outgoing {
                if visited.insert(step.to.clone()) {
                    parents.insert(step.to.clone(), step.clone());
                    queue.push_back(step.to.clone());
                }
            }
        }

        if !parents.contains_key(to) {
            return Err(SaveError::MigrationFailed {
                from: from.clone(),
                to: to.clone(),
                step: 0,
                message: "no migration path registered".to_string(),
            });
        }

        let mut path = Vec::new();
        let mut cursor = to.clone();
        while &cursor != from {
            let Some(step) = parents.get(&cursor) else {
                break;
            };
            cursor = step.from.clone();
            path.push(step.clone());
        }
        path.reverse();
        Ok(path)
    }

    pub fn is_supported(&self, from: &SaveVersion, to: &SaveVersion) -> bool {
        self.find_path(from, to).is_ok()
    }

    pub fn preview(&self, from: &SaveVersion, to: &SaveVersion) -> SaveResult<Vec<String>> {
        Ok(self
            .find_path(from, to)?
            .iter()
            .map(MigrationStep::summary)
            .collect())
    }

    /// Applies the path from `from` to `to` in order, bumping
    /// `header.version` after each successful step. A failing step aborts
    /// the rest of the chain.
    pub fn apply(
        &self,
        document: &mut Value,
        from: &SaveVersion,
        to: &SaveVersion,
    ) -> SaveResult<MigrationOutcome> {
        let path = self.find_path(from, to)?;
        let mut outcome = MigrationOutcome::default();

        for (index, step) in path.iter().enumerate() {
            (step.transform)(document).map_err(|message| SaveError::MigrationFailed {
                from: step.from.clone(),
                to: step.to.clone(),
                step: index + 1,
                message,
            })?;
            set_document_version(document, &step.to);
            info!(step = index + 1, edge = %step.summary(), "migration_step_applied");
            outcome.applied.push(step.summary());
            outcome.final_version = Some(step.to.clone());
        }
        Ok(outcome)
    }
}

fn set_document_version(document: &mut Value, version: &SaveVersion) {
    if let Some(header) = document.get_mut("header").and_then(Value::as_object_mut) {
        header.insert("version".to_string(), Value::String(version.to_string()));
    }
}

fn add_province_taxation(document: &mut Value) -> Result<(), String> {
    let Some(provinces) = document
        .get_mut("systems")
        .and_then(|systems| systems.get_mut("provinces"))
        .and_then(Value::as_array_mut)
    else {
        return Ok(());
    };
    for province in provinces {
        let Some(province) = province.as_object_mut() else {
            return Err("province entry is not an object".to_string());
        };
        province
            .entry("taxation")
            .or_insert_with(|| json!({"base_rate": 0.1, "efficiency": 1.0}));
    }
    Ok(())
}

fn add_diplomacy_system(document: &mut Value) -> Result<(), String> {
    let Some(systems) = document.get_mut("systems").and_then(Value::as_object_mut) else {
        return Ok(());
    };
    systems
        .entry("diplomacy")
        .or_insert_with(|| json!({"relations": [], "active_treaties": []}));
    Ok(())
}
