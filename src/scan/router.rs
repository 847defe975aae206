use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::{RawMessage, ScanError};
use crate::scenarios::{ScenarioId, ScenarioRegistry};

/// Messages of one batch split by scenario. Each list keeps the batch's relative order.
#[derive(Debug, Default)]
pub struct Partition {
    pub by_scenario: BTreeMap<ScenarioId, Vec<RawMessage>>,
    /// Messages whose group has no scenario binding.
    pub unrouted: Vec<RawMessage>,
}

/// Maps groups to scenarios using the registry's bindings.
#[derive(Debug, Clone)]
pub struct GroupRouter {
    registry: Arc<ScenarioRegistry>,
}

impl GroupRouter {
    /// Fails with `NoScenarios` when nothing is configured.
    pub fn new(registry: Arc<ScenarioRegistry>) -> Result<Self, ScanError> {
        if registry.is_empty() {
            return Err(ScanError::NoScenarios);
        }
        Ok(Self { registry })
    }

    pub fn scenario_for(&self, group: &str) -> Result<&ScenarioId, ScanError> {
        self.registry
            .scenario_for(group)
            .ok_or_else(|| ScanError::UnknownGroup(group.to_string()))
    }

    pub fn bindings(&self) -> &HashMap<String, ScenarioId> {
        self.registry.bindings()
    }

    pub fn partition(
        messages: Vec<RawMessage>,
        group_to_scenario: &HashMap<String, ScenarioId>,
    ) -> Partition {
        let mut partition = Partition::default();
        for message in messages {
            match group_to_scenario.get(&message.group) {
                Some(id) => partition
                    .by_scenario
                    .entry(id.clone())
                    .or_default()
                    .push(message),
                None => partition.unrouted.push(message),
            }
        }
        partition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::UiPosition;
    use crate::scenarios::tests::scenario;

    fn message(group: &str, text: &str, order: u64) -> RawMessage {
        RawMessage {
            group: group.to_string(),
            sender: "Dana".to_string(),
            phone: None,
            text: text.to_string(),
            sent_at: None,
            position: UiPosition(order as i64),
            extraction_order: order,
        }
    }

    fn router() -> GroupRouter {
        let mut registry = ScenarioRegistry::new();
        registry.register(scenario("S1", &["G1", "G2"]));
        registry.register(scenario("S2", &["G3"]));
        GroupRouter::new(Arc::new(registry)).unwrap()
    }

    #[test]
    fn test_scenario_for_known_and_unknown_group() {
        let router = router();
        assert_eq!(router.scenario_for("G1").unwrap().as_str(), "S1");
        assert_eq!(
            router.scenario_for("G9").unwrap_err(),
            ScanError::UnknownGroup("G9".to_string())
        );
    }

    #[test]
    fn test_empty_registry_is_no_scenarios() {
        let err = GroupRouter::new(Arc::new(ScenarioRegistry::new())).unwrap_err();
        assert_eq!(err, ScanError::NoScenarios);
    }

    #[test]
    fn test_partition_preserves_relative_order() {
        let router = router();
        let batch = vec![
            message("G1", "a", 0),
            message("G3", "b", 1),
            message("G2", "c", 2),
            message("G9", "d", 3),
            message("G1", "e", 4),
        ];
        let partition = GroupRouter::partition(batch, router.bindings());

        let s1: Vec<&str> = partition.by_scenario[&ScenarioId::new("S1")]
            .iter()
            .map(|m| m.text.as_str())
            .collect();
        let s2: Vec<&str> = partition.by_scenario[&ScenarioId::new("S2")]
            .iter()
            .map(|m| m.text.as_str())
            .collect();
        assert_eq!(s1, vec!["a", "c", "e"]);
        assert_eq!(s2, vec!["b"]);
        assert_eq!(partition.unrouted.len(), 1);
        assert_eq!(partition.unrouted[0].text, "d");
    }
}
