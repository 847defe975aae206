use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{Scenario, ScenarioId, ScenarioRegistry};

/// On-disk scenario format. The scenario id is the file stem.
///
/// ```json
/// {
///   "prompt": "Decide whether this message is a padel game invite...",
///   "groups": ["Padel TLV", "Padel Herzliya"],
///   "response_schema": { "type": "object", "properties": { ... }, "required": [ ... ] },
///   "confidence_field": "confidence",
///   "reasoning_field": "reasoning"
/// }
/// ```
#[derive(Debug, Deserialize)]
struct ScenarioFile {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    response_schema: Option<serde_json::Value>,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    confidence_field: Option<String>,
    #[serde(default)]
    reasoning_field: Option<String>,
}

/// Load every `*.json` scenario in a directory, in file name order.
/// Incomplete or unparsable files are skipped with a warning.
pub async fn load_scenarios_from_dir(dir: &Path) -> Result<ScenarioRegistry> {
    let mut registry = ScenarioRegistry::new();

    if !dir.exists() {
        info!("Scenarios directory not found: {}, skipping", dir.display());
        return Ok(registry);
    }

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read scenarios directory: {}", dir.display()))?;

    let mut paths: Vec<PathBuf> = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("json") {
            paths.push(path);
        }
    }
    paths.sort();

    for path in paths {
        match load_scenario_file(&path).await {
            Ok(Some(scenario)) => registry.register(scenario),
            Ok(None) => {}
            Err(e) => warn!("Failed to load scenario from {}: {:#}", path.display(), e),
        }
    }

    info!("Loaded {} scenarios", registry.len());
    Ok(registry)
}

async fn load_scenario_file(path: &Path) -> Result<Option<Scenario>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read scenario file: {}", path.display()))?;
    let file: ScenarioFile =
        serde_json::from_str(&content).context("Scenario file is not valid JSON")?;

    let id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .context("Scenario file has no usable name")?;

    let prompt = file
        .prompt
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty());
    let schema = file
        .response_schema
        .filter(|s| s.is_object() && s.get("properties").is_some_and(|p| p.is_object()));
    let groups: Vec<String> = file
        .groups
        .into_iter()
        .map(|g| g.trim().to_string())
        .filter(|g| !g.is_empty())
        .collect();

    let (Some(prompt), Some(response_schema)) = (prompt, schema) else {
        warn!(
            "Skipping scenario '{}': needs a prompt and a response_schema with properties",
            id
        );
        return Ok(None);
    };
    if groups.is_empty() {
        warn!("Skipping scenario '{}': no groups listed", id);
        return Ok(None);
    }

    Ok(Some(Scenario {
        id: ScenarioId::new(id),
        prompt,
        response_schema,
        groups,
        confidence_field: file
            .confidence_field
            .unwrap_or_else(|| "confidence".to_string()),
        reasoning_field: file
            .reasoning_field
            .unwrap_or_else(|| "reasoning".to_string()),
    }))
}
