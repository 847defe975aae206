use std::collections::BTreeMap;

use anyhow::Result;
use serde_json::Value;
use tracing::{info, warn};

use crate::scan::aggregator::{AnalyzedMessage, ConfidenceTally};
use crate::scan::state::GroupStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// History: one JSON array. Live: one JSON object per line.
    #[default]
    Json,
    /// A readable block per result.
    Pretty,
}

/// Render one batch of results. `streaming` selects the line-per-result JSON form.
pub fn render(results: &[AnalyzedMessage], format: OutputFormat, streaming: bool) -> Result<String> {
    match format {
        OutputFormat::Json if streaming => {
            let mut out = String::new();
            for result in results {
                out.push_str(&serde_json::to_string(result)?);
                out.push('\n');
            }
            Ok(out)
        }
        OutputFormat::Json => Ok(format!("{}\n", serde_json::to_string_pretty(results)?)),
        OutputFormat::Pretty => Ok(results.iter().map(render_pretty).collect()),
    }
}

fn render_pretty(result: &AnalyzedMessage) -> String {
    let time = result
        .sent_at
        .map(|t| t.to_string())
        .unwrap_or_else(|| "unknown time".to_string());
    let sender = match &result.phone {
        Some(phone) => format!("{} <{}>", result.sender, phone),
        None => result.sender.clone(),
    };

    let mut lines = vec![
        format!("[{}] {} ({})", result.group, sender, time),
        format!("  {}", result.text),
        format!("  scenario: {}", result.scenario),
    ];
    if let Some(error) = &result.error {
        lines.push(format!("  error: {}", error));
    }
    for (field, value) in &result.analysis.0 {
        let shown = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        lines.push(format!("  {}: {}", field, shown));
    }

    let mut out = lines.join("\n");
    out.push_str("\n\n");
    out
}

/// End-of-run counters, logged once the run stops.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub groups: BTreeMap<String, GroupStats>,
    pub seen: BTreeMap<String, usize>,
    pub confidence: ConfidenceTally,
    pub unknown_groups: Vec<String>,
}

impl RunSummary {
    pub fn log(&self) {
        info!("Run summary:");
        for (group, stats) in &self.groups {
            info!(
                "  {}: {} pass(es), {} extracted, {} duplicate(s), {} re-read, {} analyzed, {} with errors, {} fatal attempt(s), {} permanently failed, {} invalid, {} own, {} extraction failure(s), {} remembered",
                group,
                stats.passes,
                stats.extracted,
                stats.duplicates,
                stats.rereads,
                stats.analyzed,
                stats.recoverable_errors,
                stats.fatal_errors,
                stats.permanently_failed,
                stats.invalid,
                stats.skipped_own,
                stats.extraction_failures,
                self.seen.get(group).copied().unwrap_or(0)
            );
        }
        info!(
            "  confidence: {} HIGH, {} MEDIUM, {} LOW, {} other",
            self.confidence.high, self.confidence.medium, self.confidence.low, self.confidence.other
        );
        if !self.unknown_groups.is_empty() {
            warn!("  groups without a scenario: {}", self.unknown_groups.join(", "));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::StructuredResult;
    use crate::scan::SentAt;
    use crate::scenarios::ScenarioId;
    use chrono::{NaiveTime, TimeZone, Utc};
    use serde_json::json;

    fn result(text: &str) -> AnalyzedMessage {
        let Value::Object(map) = json!({ "is_match": true, "confidence": "HIGH" }) else {
            unreachable!()
        };
        AnalyzedMessage {
            group: "Padel Club".to_string(),
            scenario: ScenarioId::new("padel"),
            sender: "Dana".to_string(),
            phone: None,
            text: text.to_string(),
            sent_at: Some(SentAt::Instant(Utc.with_ymd_and_hms(2026, 3, 14, 18, 30, 0).unwrap())),
            pass: 1,
            sequence: 0,
            analysis: StructuredResult(map),
            confidence: Some(json!("HIGH")),
            reasoning: None,
            error: None,
        }
    }

    #[test]
    fn test_streaming_json_is_one_object_per_line() {
        let out = render(&[result("a"), result("b")], OutputFormat::Json, true).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["text"], "a");
        assert_eq!(first["analysis"]["confidence"], "HIGH");
        assert_eq!(first["sent_at"], "2026-03-14T18:30:00Z");
        assert!(first.get("error").is_none());
        assert!(first.get("phone").is_none());
    }

    #[test]
    fn test_phone_and_clock_time_are_rendered() {
        let mut r = result("court at 7?");
        r.phone = Some("+972 50-123-4567".to_string());
        r.sent_at = Some(SentAt::TimeOfDay(NaiveTime::from_hms_opt(18, 30, 0).unwrap()));

        let json = render(&[r.clone()], OutputFormat::Json, true).unwrap();
        let parsed: Value = serde_json::from_str(json.trim()).unwrap();
        assert_eq!(parsed["phone"], "+972 50-123-4567");
        assert_eq!(parsed["sent_at"], "18:30:00");

        let pretty = render(&[r], OutputFormat::Pretty, false).unwrap();
        assert!(pretty.starts_with("[Padel Club] Dana <+972 50-123-4567> (18:30)\n"));
    }

    #[test]
    fn test_history_json_is_an_array() {
        let out = render(&[result("a")], OutputFormat::Json, false).unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_pretty_block() {
        let out = render(&[result("court at 7?")], OutputFormat::Pretty, false).unwrap();
        assert!(out.starts_with("[Padel Club] Dana (2026-03-14 18:30)\n"));
        assert!(out.contains("  court at 7?\n"));
        assert!(out.contains("  scenario: padel\n"));
        assert!(out.contains("  confidence: HIGH\n"));
        assert!(out.ends_with("\n\n"));
    }
}
