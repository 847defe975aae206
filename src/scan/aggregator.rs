use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{RawMessage, SentAt};
use crate::analyzer::{confidence_rank, AnalysisError, StructuredResult};
use crate::scenarios::{ScenarioId, ScenarioRegistry, SchemaFields};

/// What the analysis stage produced for one message.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerResult {
    pub scenario: ScenarioId,
    pub outcome: Result<StructuredResult, AnalysisError>,
}

/// A message with its provenance and the scenario's structured output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyzedMessage {
    pub group: String,
    pub scenario: ScenarioId,
    pub sender: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub text: String,
    pub sent_at: Option<SentAt>,
    /// Per-group pass number, starting at 1.
    pub pass: u64,
    /// Position within the pass, starting at 0.
    pub sequence: u64,
    pub analysis: StructuredResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Set when analysis failed recoverably; `analysis` is then empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnalyzedMessage {
    pub fn confidence_rank(&self) -> Option<f64> {
        self.confidence.as_ref().and_then(confidence_rank)
    }
}

/// Drain-time view over results. Never applied during ingestion.
#[derive(Debug, Clone, Default)]
pub struct DrainFilter {
    /// Drop results ranked below this (unranked results are dropped too).
    pub min_confidence: Option<f64>,
    /// Stable sort by confidence rank, highest first.
    pub high_first: bool,
}

impl DrainFilter {
    pub fn apply(&self, mut results: Vec<AnalyzedMessage>) -> Vec<AnalyzedMessage> {
        if let Some(min) = self.min_confidence {
            results.retain(|r| r.confidence_rank().is_some_and(|rank| rank >= min));
        }
        if self.high_first {
            results.sort_by(|a, b| match (a.confidence_rank(), b.confidence_rank()) {
                (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            });
        }
        results
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfidenceTally {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub other: usize,
}

impl ConfidenceTally {
    pub fn of(results: &[AnalyzedMessage]) -> Self {
        let mut tally = Self::default();
        tally.add(results);
        tally
    }

    pub fn add(&mut self, results: &[AnalyzedMessage]) {
        for result in results {
            match result.confidence_rank() {
                Some(r) if r == 3.0 => self.high += 1,
                Some(r) if r == 2.0 => self.medium += 1,
                Some(r) if r == 1.0 => self.low += 1,
                _ => self.other += 1,
            }
        }
    }
}

#[derive(Debug, Default)]
struct PassCursor {
    pass: u64,
    next_sequence: u64,
}

/// Collects analysis outputs in ingestion order and stamps pass-local sequence numbers.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    schemas: HashMap<ScenarioId, SchemaFields>,
    passes: HashMap<String, PassCursor>,
    pending: Vec<AnalyzedMessage>,
}

impl ResultAggregator {
    pub fn new(registry: &ScenarioRegistry) -> Self {
        let schemas = registry
            .bindings()
            .values()
            .filter_map(|id| registry.schema_of(id).map(|fields| (id.clone(), fields)))
            .collect();
        Self {
            schemas,
            ..Self::default()
        }
    }

    /// Start pass number `pass` for `group`; sequence numbers restart at 0.
    pub fn begin_pass(&mut self, group: &str, pass: u64) {
        self.passes.insert(
            group.to_string(),
            PassCursor {
                pass,
                next_sequence: 0,
            },
        );
    }

    /// Record one (message, result) pair. Fatal outcomes produce no output;
    /// returns whether a result was queued.
    pub fn ingest(&mut self, group: &str, message: RawMessage, result: AnalyzerResult) -> bool {
        let cursor = self.passes.entry(group.to_string()).or_default();
        if cursor.pass == 0 {
            cursor.pass = 1;
        }

        let (analysis, error) = match result.outcome {
            Ok(structured) => (structured, None),
            Err(e) if e.fatal => {
                debug!(
                    "Not emitting message {} from '{}': {}",
                    message.position, group, e
                );
                return false;
            }
            Err(e) => (StructuredResult::default(), Some(e.message)),
        };

        let sequence = cursor.next_sequence;
        cursor.next_sequence += 1;
        let pass = cursor.pass;

        let fields = self.schemas.get(&result.scenario);
        let confidence = fields.and_then(|f| analysis.confidence(f).cloned());
        let reasoning = fields.and_then(|f| analysis.reasoning(f).map(str::to_string));

        self.pending.push(AnalyzedMessage {
            group: group.to_string(),
            scenario: result.scenario,
            sender: message.sender,
            phone: message.phone,
            text: message.text,
            sent_at: message.sent_at,
            pass,
            sequence,
            analysis,
            confidence,
            reasoning,
            error,
        });
        true
    }

    /// Take everything ingested so far, in ingestion order.
    pub fn drain(&mut self) -> Vec<AnalyzedMessage> {
        std::mem::take(&mut self.pending)
    }

    pub fn drain_with(&mut self, filter: &DrainFilter) -> Vec<AnalyzedMessage> {
        filter.apply(self.drain())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::UiPosition;
    use crate::scenarios::tests::scenario;
    use serde_json::json;

    fn registry() -> ScenarioRegistry {
        let mut registry = ScenarioRegistry::new();
        registry.register(scenario("S1", &["G1", "G2"]));
        registry
    }

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

    fn ok(confidence: &str) -> AnalyzerResult {
        let value = json!({ "is_match": true, "confidence": confidence, "reasoning": "because" });
        let Value::Object(map) = value else { unreachable!() };
        AnalyzerResult {
            scenario: ScenarioId::new("S1"),
            outcome: Ok(StructuredResult(map)),
        }
    }

    fn failed(fatal: bool) -> AnalyzerResult {
        AnalyzerResult {
            scenario: ScenarioId::new("S1"),
            outcome: Err(AnalysisError {
                fatal,
                message: "model output is not JSON".to_string(),
            }),
        }
    }

    #[test]
    fn test_drain_preserves_ingestion_order_and_sequences() {
        let mut aggregator = ResultAggregator::new(&registry());
        aggregator.begin_pass("G1", 1);
        aggregator.ingest("G1", message("G1", "a", 0), ok("LOW"));
        aggregator.ingest("G1", message("G1", "b", 1), ok("HIGH"));

        let drained = aggregator.drain();
        let texts: Vec<&str> = drained.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b"]);
        assert_eq!(drained[0].sequence, 0);
        assert_eq!(drained[1].sequence, 1);
        assert_eq!(drained[1].confidence, Some(json!("HIGH")));
        assert_eq!(drained[1].reasoning.as_deref(), Some("because"));
        assert!(aggregator.drain().is_empty());
    }

    #[test]
    fn test_sequence_restarts_each_pass_per_group() {
        let mut aggregator = ResultAggregator::new(&registry());
        aggregator.begin_pass("G1", 1);
        aggregator.ingest("G1", message("G1", "a", 0), ok("LOW"));
        aggregator.begin_pass("G2", 1);
        aggregator.ingest("G2", message("G2", "x", 0), ok("LOW"));
        aggregator.begin_pass("G1", 2);
        aggregator.ingest("G1", message("G1", "b", 0), ok("LOW"));

        let drained = aggregator.drain();
        assert_eq!((drained[0].pass, drained[0].sequence), (1, 0));
        assert_eq!((drained[1].pass, drained[1].sequence), (1, 0));
        assert_eq!((drained[2].pass, drained[2].sequence), (2, 0));
    }

    #[test]
    fn test_recoverable_error_is_emitted_with_placeholder() {
        let mut aggregator = ResultAggregator::new(&registry());
        aggregator.begin_pass("G1", 1);
        assert!(aggregator.ingest("G1", message("G1", "a", 0), failed(false)));
        let drained = aggregator.drain();
        assert_eq!(drained.len(), 1);
        assert!(drained[0].analysis.0.is_empty());
        assert_eq!(drained[0].error.as_deref(), Some("model output is not JSON"));
    }

    #[test]
    fn test_fatal_error_is_not_emitted() {
        let mut aggregator = ResultAggregator::new(&registry());
        aggregator.begin_pass("G1", 1);
        assert!(!aggregator.ingest("G1", message("G1", "a", 0), failed(true)));
        aggregator.ingest("G1", message("G1", "b", 1), ok("HIGH"));
        let drained = aggregator.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].sequence, 0);
        assert_eq!(drained[0].text, "b");
    }

    #[test]
    fn test_filter_and_sort_at_drain_time() {
        let mut aggregator = ResultAggregator::new(&registry());
        aggregator.begin_pass("G1", 1);
        aggregator.ingest("G1", message("G1", "low", 0), ok("LOW"));
        aggregator.ingest("G1", message("G1", "high", 1), ok("HIGH"));
        aggregator.ingest("G1", message("G1", "err", 2), failed(false));
        aggregator.ingest("G1", message("G1", "medium", 3), ok("MEDIUM"));

        let sorted = DrainFilter {
            min_confidence: None,
            high_first: true,
        }
        .apply(aggregator.drain());
        let texts: Vec<&str> = sorted.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["high", "medium", "low", "err"]);

        let filtered = DrainFilter {
            min_confidence: Some(2.0),
            high_first: false,
        }
        .apply(sorted);
        let texts: Vec<&str> = filtered.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["high", "medium"]);
    }

    #[test]
    fn test_confidence_tally() {
        let mut aggregator = ResultAggregator::new(&registry());
        aggregator.ingest("G1", message("G1", "a", 0), ok("HIGH"));
        aggregator.ingest("G1", message("G1", "b", 1), ok("HIGH"));
        aggregator.ingest("G1", message("G1", "c", 2), ok("LOW"));
        aggregator.ingest("G1", message("G1", "d", 3), failed(false));
        let tally = ConfidenceTally::of(&aggregator.drain());
        assert_eq!(
            tally,
            ConfidenceTally {
                high: 2,
                medium: 0,
                low: 1,
                other: 1
            }
        );
    }
}
