use qwatch_alert::{Rule, RuleManager};
use serde::Deserialize;

/// Rules seed file consumed by the `init-rules` subcommand.
#[derive(Debug, Clone, Deserialize)]
pub struct RulesSeedFile {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl RulesSeedFile {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read seed file '{}': {}", path, e))?;
        let seed: Self = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse seed file '{}': {}", path, e))?;
        Ok(seed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Upserts every seeded rule into the manager's host. A rule that fails
/// validation is logged and skipped; the rest still land.
pub async fn seed_rules(manager: &RuleManager, seed: RulesSeedFile) -> anyhow::Result<SeedSummary> {
    let mut summary = SeedSummary::default();
    for rule in seed.rules {
        let rule_id = rule.id.clone();
        let existing = manager.get_rule(&rule_id).await?;
        let result = if existing.is_some() {
            manager.update_rule(rule).await
        } else {
            manager.add_rule(rule).await
        };
        match result {
            Ok(_) if existing.is_some() => {
                summary.updated += 1;
                tracing::info!(rule_id = %rule_id, "Seeded rule updated");
            }
            Ok(_) => {
                summary.created += 1;
                tracing::info!(rule_id = %rule_id, "Seeded rule created");
            }
            Err(e) => {
                summary.failed += 1;
                tracing::warn!(rule_id = %rule_id, error = %e, "Failed to seed rule");
            }
        }
    }
    tracing::info!(
        created = summary.created,
        updated = summary.updated,
        failed = summary.failed,
        "Rules seed applied"
    );
    Ok(summary)
}
