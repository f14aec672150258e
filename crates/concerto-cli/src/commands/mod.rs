//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command. Commands return
//! `Result<(), String>`; `main` prints the error and exits non-zero.

pub mod agents;
pub mod plan;

use std::sync::Arc;

use concerto_core::{AgentTable, CapabilityRegistry, EngineConfig, FixtureDocument};

/// Load a fixture file into a registry and a scripted transport.
pub fn load_fixtures(path: &str) -> Result<(CapabilityRegistry, AgentTable), String> {
    let document = FixtureDocument::from_file(path)?;
    let count = document.agents.len();
    let built = document.build().map_err(|e| e.to_string())?;
    tracing::info!("[Fixtures] Loaded {} agent(s) from '{}'", count, path);
    Ok(built)
}

/// Engine configuration from a YAML file, or the defaults.
pub fn load_engine_config(path: Option<&str>) -> Result<EngineConfig, String> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .map_err(|e| format!("Failed to read config file '{}': {}", path, e))?;
            EngineConfig::from_yaml(&content)
        }
        None => Ok(EngineConfig::default()),
    }
}

/// Build an engine over a fixture file.
pub fn fixture_engine(
    agents_file: &str,
    config: EngineConfig,
) -> Result<concerto_core::Engine, String> {
    let (registry, table) = load_fixtures(agents_file)?;
    Ok(concerto_core::Engine::new(
        Arc::new(registry),
        Arc::new(table),
        config,
    ))
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", kept)
    }
}
