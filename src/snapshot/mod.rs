pub mod queries;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::ControlPlaneError;
use crate::evaluation::{evaluate, EvaluationContext, FeatureDecision, FlagRecord, ScopeType};

pub const DEFAULT_ENVIRONMENT: &str = "production";

/// Narrow free-form environment strings to the known set, defaulting rather
/// than erroring so stale clients keep working.
pub fn resolve_environment(value: Option<&str>) -> String {
    match value {
        Some(env @ ("production" | "preview" | "development")) => env.to_string(),
        _ => DEFAULT_ENVIRONMENT.to_string(),
    }
}

// MODELS

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MarketingConfigRecord {
    pub id: Uuid,
    pub environment: String,
    pub section: String,
    pub config_key: String,
    pub value: Value,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SystemSettingRecord {
    pub id: Uuid,
    pub environment: String,
    pub category: String,
    pub setting_key: String,
    pub value: Value,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AuditLogRecord {
    pub id: Uuid,
    pub actor_user_id: Option<Uuid>,
    pub event_type: String,
    pub target_type: String,
    pub target_id: Option<String>,
    pub environment: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Operational toggles that gate the whole surface, independent of any flag
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OpsConfig {
    pub maintenance_mode: bool,
    pub read_only_mode: bool,
    pub emergency_lockdown: bool,
    pub rate_limit_multiplier: f64,
}

impl Default for OpsConfig {
    fn default() -> Self {
        OpsConfig {
            maintenance_mode: false,
            read_only_mode: false,
            emergency_lockdown: false,
            rate_limit_multiplier: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HeroConfig {
    pub badge_text: String,
    pub headline_primary: String,
    pub headline_accent: String,
    pub subheadline: String,
    pub primary_cta_label: String,
    pub primary_cta_href: String,
    pub secondary_cta_label: String,
    pub secondary_cta_href: String,
}

impl Default for HeroConfig {
    fn default() -> Self {
        HeroConfig {
            badge_text: "Now in beta".to_string(),
            headline_primary: "Compliance on".to_string(),
            headline_accent: "autopilot".to_string(),
            subheadline: "Evidence collection and controls that run themselves.".to_string(),
            primary_cta_label: "Get started".to_string(),
            primary_cta_href: "/join".to_string(),
            secondary_cta_label: "Book a demo".to_string(),
            secondary_cta_href: "/demo".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MarketingRuntime {
    pub hero: HeroConfig,
    pub expensive_effects_enabled: bool,
    pub active_showcase_module: String,
    pub showcase_modules: HashMap<String, bool>,
    pub theme_variant: String,
    pub background_variant: String,
    pub section_visibility: HashMap<String, bool>,
}

impl Default for MarketingRuntime {
    fn default() -> Self {
        MarketingRuntime {
            hero: HeroConfig::default(),
            expensive_effects_enabled: true,
            active_showcase_module: "overview".to_string(),
            showcase_modules: HashMap::new(),
            theme_variant: "default".to_string(),
            background_variant: "default".to_string(),
            section_visibility: HashMap::new(),
        }
    }
}

/// Point-in-time bundle served to runtime consumers. Built fresh on every
/// push, never mutated afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeSnapshot {
    pub version: String,
    pub stream_version: String,
    pub last_update_at: String,
    pub evaluation_mode: ScopeType,
    pub environment: String,
    pub ops: OpsConfig,
    pub marketing: MarketingRuntime,
    pub feature_flags: HashMap<String, FeatureDecision>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCounters {
    pub database_latency_ms: i64,
    pub api_healthy: bool,
    pub open_streams: u64,
}

/// Admin variant of the snapshot: raw records alongside resolved state, plus
/// recent audit entries and health counters.
#[derive(Debug, Clone, Serialize)]
pub struct AdminControlPlaneSnapshot {
    pub environment: String,
    pub runtime_version: String,
    pub stream_version: String,
    pub feature_flags: Vec<FlagRecord>,
    pub marketing_config: Vec<MarketingConfigRecord>,
    pub system_settings: Vec<SystemSettingRecord>,
    pub audit: Vec<AuditLogRecord>,
    pub health: HealthCounters,
}

// HELPER FUNCTIONS

fn stable_string(value: &Value, fallback: &str) -> String {
    match value.as_str() {
        Some(s) if !s.trim().is_empty() => s.to_string(),
        _ => fallback.to_string(),
    }
}

fn stable_bool(value: &Value, fallback: bool) -> bool {
    value.as_bool().unwrap_or(fallback)
}

fn object_field<'a>(value: &'a Value, field: &str) -> &'a Value {
    value.get(field).unwrap_or(&Value::Null)
}

/// Fold `ops` category settings over the defaults
pub fn materialize_ops(settings: &[SystemSettingRecord]) -> OpsConfig {
    let mut ops = OpsConfig::default();

    for setting in settings.iter().filter(|s| s.category == "ops") {
        match setting.setting_key.as_str() {
            "maintenance_mode" => {
                ops.maintenance_mode =
                    stable_bool(object_field(&setting.value, "enabled"), ops.maintenance_mode);
            }
            "read_only_mode" => {
                ops.read_only_mode =
                    stable_bool(object_field(&setting.value, "enabled"), ops.read_only_mode);
            }
            "emergency_lockdown" => {
                ops.emergency_lockdown = stable_bool(
                    object_field(&setting.value, "enabled"),
                    ops.emergency_lockdown,
                );
            }
            "rate_limit_mode" => {
                let multiplier = object_field(&setting.value, "multiplier")
                    .as_f64()
                    .filter(|m| m.is_finite())
                    .unwrap_or(ops.rate_limit_multiplier);
                ops.rate_limit_multiplier = multiplier.max(0.1);
            }
            _ => {}
        }
    }

    ops
}

/// Fold marketing rows over the defaults
pub fn materialize_marketing(rows: &[MarketingConfigRecord]) -> MarketingRuntime {
    let mut next = MarketingRuntime::default();

    for row in rows {
        if row.section == "home.hero" {
            let hero = &mut next.hero;
            match row.config_key.as_str() {
                "badge_text" => hero.badge_text = stable_string(&row.value, &hero.badge_text),
                "headline_primary" => {
                    hero.headline_primary = stable_string(&row.value, &hero.headline_primary)
                }
                "headline_accent" => {
                    hero.headline_accent = stable_string(&row.value, &hero.headline_accent)
                }
                "subheadline" => hero.subheadline = stable_string(&row.value, &hero.subheadline),
                "primary_cta_label" => {
                    hero.primary_cta_label = stable_string(&row.value, &hero.primary_cta_label)
                }
                "primary_cta_href" => {
                    hero.primary_cta_href = stable_string(&row.value, &hero.primary_cta_href)
                }
                "secondary_cta_label" => {
                    hero.secondary_cta_label = stable_string(&row.value, &hero.secondary_cta_label)
                }
                "secondary_cta_href" => {
                    hero.secondary_cta_href = stable_string(&row.value, &hero.secondary_cta_href)
                }
                _ => {}
            }
        }

        if row.section == "home.runtime" {
            match row.config_key.as_str() {
                "expensive_effects_enabled" => {
                    next.expensive_effects_enabled =
                        stable_bool(&row.value, next.expensive_effects_enabled)
                }
                "active_showcase_module" => {
                    next.active_showcase_module =
                        stable_string(&row.value, &next.active_showcase_module)
                }
                "showcase_modules" => {
                    if let Some(map) = row.value.as_object() {
                        next.showcase_modules = map
                            .iter()
                            .map(|(key, enabled)| {
                                let prior = next.showcase_modules.get(key).copied().unwrap_or(false);
                                (key.clone(), stable_bool(enabled, prior))
                            })
                            .collect();
                    }
                }
                "theme_variant" => {
                    next.theme_variant = stable_string(&row.value, &next.theme_variant)
                }
                "background_variant" => {
                    next.background_variant =
                        stable_string(&row.value, &next.background_variant)
                }
                "section_visibility" => {
                    if let Some(map) = row.value.as_object() {
                        next.section_visibility = map
                            .iter()
                            .map(|(key, enabled)| {
                                let prior = next.section_visibility.get(key).copied().unwrap_or(false);
                                (key.clone(), stable_bool(enabled, prior))
                            })
                            .collect();
                    }
                }
                _ => {}
            }
        }
    }

    next
}

fn derive_evaluation_mode(context: &EvaluationContext) -> ScopeType {
    if context.user_id.is_some() {
        ScopeType::User
    } else if context.org_id.is_some() {
        ScopeType::Organization
    } else {
        ScopeType::Global
    }
}

/// Group records by key and run the engine over each group
pub fn resolve_decisions(
    records: &[FlagRecord],
    context: &EvaluationContext,
    now: DateTime<Utc>,
) -> HashMap<String, FeatureDecision> {
    let mut grouped: HashMap<String, Vec<FlagRecord>> = HashMap::new();
    for record in records {
        grouped
            .entry(record.key.clone())
            .or_default()
            .push(record.clone());
    }

    grouped
        .into_iter()
        .map(|(key, group)| {
            let decision = evaluate(&key, &group, context, now);
            (key, decision)
        })
        .collect()
}

/// Assemble a runtime snapshot: read, compute, return. No lock is held across
/// the store calls, and nothing is cached; every call reflects the oracle
/// version it reads.
pub async fn runtime_snapshot(
    pool: &PgPool,
    environment: &str,
    context: &EvaluationContext,
    include_private: bool,
) -> Result<RuntimeSnapshot, ControlPlaneError> {
    let marker = queries::read_stream_version(pool, environment).await?;

    let mut records = queries::load_flag_records(pool, environment).await?;
    if !include_private {
        records.retain(|record| record.is_public);
    }
    let marketing = queries::load_marketing_config(pool, environment).await?;
    let settings = queries::load_system_settings(pool, environment).await?;

    Ok(RuntimeSnapshot {
        version: marker.runtime_version,
        stream_version: marker.stream_version,
        last_update_at: marker.last_changed_at,
        evaluation_mode: derive_evaluation_mode(context),
        environment: environment.to_string(),
        ops: materialize_ops(&settings),
        marketing: materialize_marketing(&marketing),
        feature_flags: resolve_decisions(&records, context, Utc::now()),
    })
}

/// Assemble the admin snapshot with raw records, audit tail and health
pub async fn admin_snapshot(
    pool: &PgPool,
    environment: &str,
    audit_limit: i64,
    open_streams: u64,
) -> Result<AdminControlPlaneSnapshot, ControlPlaneError> {
    let audit_limit = audit_limit.clamp(20, 500);

    let database_latency_ms = queries::measure_db_latency(pool).await?;
    let runtime_version = queries::read_runtime_version(pool, environment).await?;
    let stream_version = queries::read_admin_stream_version(pool, environment).await?;
    let feature_flags = queries::load_flag_records(pool, environment).await?;
    let marketing_config = queries::load_marketing_config(pool, environment).await?;
    let system_settings = queries::load_system_settings(pool, environment).await?;
    let audit = queries::load_recent_audit(pool, environment, audit_limit).await?;

    Ok(AdminControlPlaneSnapshot {
        environment: environment.to_string(),
        runtime_version,
        stream_version,
        feature_flags,
        marketing_config,
        system_settings,
        audit,
        health: HealthCounters {
            database_latency_ms,
            api_healthy: true,
            open_streams,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setting(category: &str, key: &str, value: Value) -> SystemSettingRecord {
        SystemSettingRecord {
            id: Uuid::new_v4(),
            environment: "production".to_string(),
            category: category.to_string(),
            setting_key: key.to_string(),
            value,
            description: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn marketing(section: &str, key: &str, value: Value) -> MarketingConfigRecord {
        MarketingConfigRecord {
            id: Uuid::new_v4(),
            environment: "production".to_string(),
            section: section.to_string(),
            config_key: key.to_string(),
            value,
            description: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_resolve_environment() {
        assert_eq!(resolve_environment(Some("preview")), "preview");
        assert_eq!(resolve_environment(Some("development")), "development");
        assert_eq!(resolve_environment(Some("staging")), "production");
        assert_eq!(resolve_environment(None), "production");
    }

    #[test]
    fn test_materialize_ops_defaults() {
        let ops = materialize_ops(&[]);
        assert_eq!(ops, OpsConfig::default());
        assert!(!ops.maintenance_mode);
        assert_eq!(ops.rate_limit_multiplier, 1.0);
    }

    #[test]
    fn test_materialize_ops_overrides() {
        let settings = vec![
            setting("ops", "maintenance_mode", json!({ "enabled": true })),
            setting("ops", "emergency_lockdown", json!({ "enabled": true })),
            setting("ops", "rate_limit_mode", json!({ "multiplier": 0.01 })),
            // Non-ops categories are ignored
            setting("integrations", "maintenance_mode", json!({ "enabled": false })),
        ];
        let ops = materialize_ops(&settings);
        assert!(ops.maintenance_mode);
        assert!(ops.emergency_lockdown);
        assert!(!ops.read_only_mode);
        // Multiplier is clamped to a floor of 0.1
        assert_eq!(ops.rate_limit_multiplier, 0.1);
    }

    #[test]
    fn test_materialize_ops_ignores_malformed_values() {
        let settings = vec![setting("ops", "maintenance_mode", json!("yes"))];
        let ops = materialize_ops(&settings);
        assert!(!ops.maintenance_mode);
    }

    #[test]
    fn test_materialize_marketing_overrides() {
        let rows = vec![
            marketing("home.hero", "badge_text", json!("Launch week")),
            marketing("home.hero", "headline_primary", json!("  ")),
            marketing("home.runtime", "theme_variant", json!("midnight")),
            marketing("home.runtime", "background_variant", json!("aurora")),
            marketing("home.runtime", "expensive_effects_enabled", json!(false)),
            marketing("home.runtime", "active_showcase_module", json!("pipelines")),
            marketing(
                "home.runtime",
                "showcase_modules",
                json!({ "pipelines": true, "insights": false }),
            ),
            marketing(
                "home.runtime",
                "section_visibility",
                json!({ "pricing": true, "faq": false }),
            ),
        ];
        let runtime = materialize_marketing(&rows);
        assert_eq!(runtime.hero.badge_text, "Launch week");
        // Blank strings keep the default
        assert_eq!(
            runtime.hero.headline_primary,
            HeroConfig::default().headline_primary
        );
        assert_eq!(runtime.theme_variant, "midnight");
        assert_eq!(runtime.background_variant, "aurora");
        assert!(!runtime.expensive_effects_enabled);
        assert_eq!(runtime.active_showcase_module, "pipelines");
        assert_eq!(runtime.showcase_modules.get("pipelines"), Some(&true));
        assert_eq!(runtime.showcase_modules.get("insights"), Some(&false));
        assert_eq!(runtime.section_visibility.get("pricing"), Some(&true));
        assert_eq!(runtime.section_visibility.get("faq"), Some(&false));
    }

    #[test]
    fn test_materialize_marketing_runtime_defaults() {
        let runtime = materialize_marketing(&[]);
        assert!(runtime.expensive_effects_enabled);
        assert_eq!(runtime.active_showcase_module, "overview");
        assert_eq!(runtime.theme_variant, "default");
        assert_eq!(runtime.background_variant, "default");
        assert!(runtime.showcase_modules.is_empty());
    }

    #[test]
    fn test_derive_evaluation_mode() {
        let user = EvaluationContext {
            user_id: Some("u".to_string()),
            org_id: Some("o".to_string()),
            anonymous_id: None,
        };
        assert_eq!(derive_evaluation_mode(&user), ScopeType::User);

        let org = EvaluationContext {
            user_id: None,
            org_id: Some("o".to_string()),
            anonymous_id: None,
        };
        assert_eq!(derive_evaluation_mode(&org), ScopeType::Organization);

        assert_eq!(
            derive_evaluation_mode(&EvaluationContext::default()),
            ScopeType::Global
        );
    }
}
