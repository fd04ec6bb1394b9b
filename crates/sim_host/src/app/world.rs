use std::fmt::Display;
use std::sync::Mutex;

use persistence::Persistable;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub(crate) const CHARACTERS: &str = "characters";
pub(crate) const ECONOMY: &str = "economy";
pub(crate) const TECHNOLOGY: &str = "technology";
pub(crate) const PROVINCES: &str = "provinces";

type DecodeResult<T> = Result<T, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Character {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) age: u32,
    pub(crate) health: u32,
    #[serde(default)]
    pub(crate) traits: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Roster {
    pub(crate) characters: Vec<Character>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct TradeRoute {
    pub(crate) from: String,
    pub(crate) to: String,
    pub(crate) value: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Economy {
    pub(crate) treasury: i64,
    pub(crate) income: i64,
    #[serde(default)]
    pub(crate) trade_routes: Vec<TradeRoute>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Technology {
    pub(crate) researched: Vec<String>,
    pub(crate) current: Option<String>,
    pub(crate) progress: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub(crate) struct Taxation {
    pub(crate) base_rate: f64,
    pub(crate) efficiency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Province {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) population: u64,
    #[serde(default)]
    pub(crate) taxation: Option<Taxation>,
}

/// Serialized as a bare array; older saves migrate it in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct ProvinceMap {
    pub(crate) provinces: Vec<Province>,
}

/// Invariants a payload must satisfy before it replaces live state.
pub(crate) trait Checked {
    fn check(&self) -> DecodeResult<()>;
}

impl Checked for Roster {
    fn check(&self) -> DecodeResult<()> {
        let mut seen = std::collections::HashSet::with_capacity(self.characters.len());
        for (index, character) in self.characters.iter().enumerate() {
            if !seen.insert(character.id) {
                return Err(validation_err(
                    &format!("characters[{index}].id"),
                    format!("duplicate id {}", character.id),
                ));
            }
            if character.name.trim().is_empty() {
                return Err(validation_err(&format!("characters[{index}].name"), "empty name"));
            }
        }
        Ok(())
    }
}

impl Checked for Economy {
    fn check(&self) -> DecodeResult<()> {
        for (index, route) in self.trade_routes.iter().enumerate() {
            if route.value < 0 {
                return Err(expected_actual(
                    &format!("trade_routes[{index}].value"),
                    "non-negative value",
                    route.value,
                ));
            }
        }
        Ok(())
    }
}

impl Checked for Technology {
    fn check(&self) -> DecodeResult<()> {
        if !self.progress.is_finite() || !(0.0..=1.0).contains(&self.progress) {
            return Err(expected_actual("progress", "value in 0..=1", self.progress));
        }
        Ok(())
    }
}

impl Checked for ProvinceMap {
    fn check(&self) -> DecodeResult<()> {
        for (index, province) in self.provinces.iter().enumerate() {
            if let Some(taxation) = province.taxation {
                if !(0.0..=1.0).contains(&taxation.base_rate) {
                    return Err(expected_actual(
                        &format!("[{index}].taxation.base_rate"),
                        "rate in 0..=1",
                        taxation.base_rate,
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A named block of world state behind a mutex, persisted as JSON.
#[derive(Debug)]
pub(crate) struct StateSystem<T> {
    name: &'static str,
    state: Mutex<T>,
}

impl<T> StateSystem<T>
where
    T: Clone + Default,
{
    pub(crate) fn new(name: &'static str, initial: T) -> Self {
        Self {
            name,
            state: Mutex::new(initial),
        }
    }

    pub(crate) fn snapshot(&self) -> T {
        self.lock().clone()
    }

    /// Applies `change` and returns its result.
    pub(crate) fn update<R>(&self, change: impl FnOnce(&mut T) -> R) -> R {
        change(&mut self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, T> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<T> StateSystem<T>
where
    T: DeserializeOwned + Checked,
{
    fn parse(&self, data: &Value) -> DecodeResult<T> {
        let parsed = match serde_path_to_error::deserialize::<_, T>(data) {
            Ok(parsed) => parsed,
            Err(error) => {
                let path = error.path().to_string();
                let source = error.into_inner();
                return if path.is_empty() || path == "." {
                    Err(format!("parse {}: {source}", self.name))
                } else {
                    Err(format!("parse {} at {path}: {source}", self.name))
                };
            }
        };
        parsed.check()?;
        Ok(parsed)
    }
}

impl<T> Persistable for StateSystem<T>
where
    T: Clone + Default + Serialize + DeserializeOwned + Checked + Send,
{
    fn name(&self) -> &str {
        self.name
    }

    fn encode(&self, _format_version: u32) -> Result<Value, String> {
        serde_json::to_value(&*self.lock()).map_err(|error| format!("encode {}: {error}", self.name))
    }

    fn check_payload(&self, data: &Value, _format_version: u32) -> Result<(), String> {
        self.parse(data).map(|_| ())
    }

    fn decode(&self, data: &Value, _format_version: u32) -> Result<(), String> {
        let parsed = self.parse(data)?;
        *self.lock() = parsed;
        Ok(())
    }

    fn load_default(&self) {
        *self.lock() = T::default();
    }
}

fn validation_err(path: &str, message: impl Into<String>) -> String {
    format!("validation failed at {path}: {}", message.into())
}

fn expected_actual(path: &str, expected: impl Display, actual: impl Display) -> String {
    validation_err(path, format!("expected {expected}, got {actual}"))
}

pub(crate) fn starting_roster() -> Roster {
    Roster {
        characters: vec![
            Character {
                id: 1,
                name: "Aurelia".to_string(),
                age: 34,
                health: 100,
                traits: vec!["diplomat".to_string()],
            },
            Character {
                id: 2,
                name: "Bram".to_string(),
                age: 51,
                health: 80,
                traits: vec!["steward".to_string(), "stubborn".to_string()],
            },
        ],
    }
}

pub(crate) fn starting_economy() -> Economy {
    Economy {
        treasury: 1_000,
        income: 25,
        trade_routes: vec![TradeRoute {
            from: "Northmarch".to_string(),
            to: "Saltmere".to_string(),
            value: 40,
        }],
    }
}

pub(crate) fn starting_technology() -> Technology {
    Technology {
        researched: vec!["bronze_working".to_string()],
        current: Some("writing".to_string()),
        progress: 0.0,
    }
}

pub(crate) fn starting_provinces() -> ProvinceMap {
    ProvinceMap {
        provinces: vec![
            Province {
                id: 1,
                name: "Northmarch".to_string(),
                population: 12_000,
                taxation: Some(Taxation {
                    base_rate: 0.1,
                    efficiency: 1.0,
                }),
            },
            Province {
                id: 2,
                name: "Saltmere".to_string(),
                population: 8_500,
                taxation: None,
            },
        ],
    }
}
