//! `concerto agents` — inspect fixture contracts.

use super::{load_fixtures, truncate};

/// List every contract in a fixture file, one row per name/version.
pub async fn list(agents_file: &str) -> Result<(), String> {
    let (registry, _) = load_fixtures(agents_file)?;
    if registry.is_empty() {
        println!("No agents declared in '{}'", agents_file);
        return Ok(());
    }

    println!("┌──────────────────┬─────────┬────────────┬─────────┬────────────┐");
    println!("│ Name             │ Version │ Idempotent │ Retries │ Timeout    │");
    println!("├──────────────────┼─────────┼────────────┼─────────┼────────────┤");
    for contract in registry.contracts() {
        println!(
            "│ {:<16} │ {:<7} │ {:<10} │ {:<7} │ {:<10} │",
            truncate(&contract.name, 16),
            contract.version,
            if contract.idempotent { "yes" } else { "no" },
            contract.max_retries,
            format!("{}ms", contract.timeout_ms)
        );
    }
    println!("└──────────────────┴─────────┴────────────┴─────────┴────────────┘");
    Ok(())
}
