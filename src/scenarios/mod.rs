pub mod loader;

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::{info, warn};

/// Name of a scenario (the stem of its JSON file)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ScenarioId(pub String);

impl ScenarioId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A loaded monitoring scenario
#[derive(Debug, Clone)]
pub struct Scenario {
    pub id: ScenarioId,
    /// Instructions given to the analyzer
    pub prompt: String,
    /// JSON schema of the structured result
    pub response_schema: serde_json::Value,
    pub groups: Vec<String>,
    pub confidence_field: String,
    pub reasoning_field: String,
}

impl Scenario {
    pub fn schema_fields(&self) -> SchemaFields {
        let properties = self
            .response_schema
            .get("properties")
            .and_then(|p| p.as_object());
        let required = self
            .response_schema
            .get("required")
            .and_then(|r| r.as_array());

        SchemaFields {
            fields: properties
                .map(|p| p.keys().cloned().collect())
                .unwrap_or_default(),
            required: required
                .map(|r| {
                    r.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
            confidence_field: self.confidence_field.clone(),
            reasoning_field: self.reasoning_field.clone(),
        }
    }
}

/// The parts of a scenario schema the scan engine cares about.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SchemaFields {
    /// Declared properties. Empty when the schema lists none.
    pub fields: Vec<String>,
    pub required: Vec<String>,
    pub confidence_field: String,
    pub reasoning_field: String,
}

/// Registry of all loaded scenarios, indexed by id and by group
#[derive(Debug, Clone, Default)]
pub struct ScenarioRegistry {
    scenarios: HashMap<ScenarioId, Scenario>,
    group_to_scenario: HashMap<String, ScenarioId>,
}

impl ScenarioRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scenario. A group already bound elsewhere is rebound to this one.
    pub fn register(&mut self, scenario: Scenario) {
        info!(
            "Registered scenario: {} ({} group(s))",
            scenario.id,
            scenario.groups.len()
        );
        for group in &scenario.groups {
            if let Some(previous) = self
                .group_to_scenario
                .insert(group.clone(), scenario.id.clone())
            {
                if previous != scenario.id {
                    warn!(
                        "Group '{}' listed by both '{}' and '{}'; using '{}'",
                        group, previous, scenario.id, scenario.id
                    );
                }
            }
        }
        self.scenarios.insert(scenario.id.clone(), scenario);
    }

    pub fn get(&self, id: &ScenarioId) -> Option<&Scenario> {
        self.scenarios.get(id)
    }

    pub fn scenario_for(&self, group: &str) -> Option<&ScenarioId> {
        self.group_to_scenario.get(group)
    }

    pub fn schema_of(&self, id: &ScenarioId) -> Option<SchemaFields> {
        self.scenarios.get(id).map(Scenario::schema_fields)
    }

    /// Every configured group, sorted.
    pub fn groups(&self) -> Vec<String> {
        self.group_to_scenario
            .keys()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Group → scenario bindings, for routing.
    pub fn bindings(&self) -> &HashMap<String, ScenarioId> {
        &self.group_to_scenario
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}
