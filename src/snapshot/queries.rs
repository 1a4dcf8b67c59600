use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::time::Instant;

use super::{AuditLogRecord, MarketingConfigRecord, SystemSettingRecord};
use crate::error::ControlPlaneError;
use crate::evaluation::{FlagRecord, ScopeType};

const DEFAULT_RUNTIME_VERSION: &str = "0";

// Database row types; converted to engine types before evaluation
#[derive(Debug, sqlx::FromRow)]
struct FlagRow {
    flag_key: String,
    environment: String,
    scope_type: String,
    scope_id: Option<String>,
    enabled: bool,
    kill_switch: bool,
    rollout_percentage: i32,
    variants: Value,
    default_variant: Option<String>,
    start_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
    is_public: bool,
}

fn parse_variants(value: &Value) -> BTreeMap<String, i64> {
    match value.as_object() {
        Some(map) => map
            .iter()
            .filter_map(|(name, weight)| weight.as_i64().map(|w| (name.clone(), w)))
            .collect(),
        None => BTreeMap::new(),
    }
}

impl FlagRow {
    /// Rows with an unrecognized scope tag are dropped rather than evaluated;
    /// a bad record must never take down evaluation for everyone
    fn into_record(self) -> Option<FlagRecord> {
        let scope_type = ScopeType::parse(&self.scope_type)?;
        Some(FlagRecord {
            key: self.flag_key,
            environment: self.environment,
            scope_type,
            scope_id: self.scope_id,
            enabled: self.enabled,
            kill_switch: self.kill_switch,
            rollout_percentage: self.rollout_percentage as i64,
            variants: parse_variants(&self.variants),
            default_variant: self.default_variant,
            start_at: self.start_at,
            end_at: self.end_at,
            is_public: self.is_public,
        })
    }
}

pub async fn load_flag_records(
    pool: &PgPool,
    environment: &str,
) -> Result<Vec<FlagRecord>, ControlPlaneError> {
    let rows: Vec<FlagRow> = sqlx::query_as(
        r#"
        SELECT flag_key, environment, scope_type, scope_id, enabled, kill_switch,
               rollout_percentage, variants, default_variant, start_at, end_at, is_public
        FROM feature_flags
        WHERE environment = $1
        ORDER BY updated_at DESC
        "#,
    )
    .bind(environment)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().filter_map(FlagRow::into_record).collect())
}

/// Candidate records for a single key, for the one-shot decision path
pub async fn load_flag_records_for_key(
    pool: &PgPool,
    environment: &str,
    key: &str,
) -> Result<Vec<FlagRecord>, ControlPlaneError> {
    let rows: Vec<FlagRow> = sqlx::query_as(
        r#"
        SELECT flag_key, environment, scope_type, scope_id, enabled, kill_switch,
               rollout_percentage, variants, default_variant, start_at, end_at, is_public
        FROM feature_flags
        WHERE environment = $1 AND flag_key = $2
        "#,
    )
    .bind(environment)
    .bind(key)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().filter_map(FlagRow::into_record).collect())
}

pub async fn load_marketing_config(
    pool: &PgPool,
    environment: &str,
) -> Result<Vec<MarketingConfigRecord>, ControlPlaneError> {
    let rows = sqlx::query_as(
        r#"
        SELECT id, environment, section, config_key, value, description, created_at, updated_at
        FROM marketing_config
        WHERE environment = $1
        ORDER BY section ASC
        "#,
    )
    .bind(environment)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn load_system_settings(
    pool: &PgPool,
    environment: &str,
) -> Result<Vec<SystemSettingRecord>, ControlPlaneError> {
    let rows = sqlx::query_as(
        r#"
        SELECT id, environment, category, setting_key, value, description, created_at, updated_at
        FROM system_settings
        WHERE environment = $1
        ORDER BY category ASC
        "#,
    )
    .bind(environment)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn load_recent_audit(
    pool: &PgPool,
    environment: &str,
    limit: i64,
) -> Result<Vec<AuditLogRecord>, ControlPlaneError> {
    let rows = sqlx::query_as(
        r#"
        SELECT id, actor_user_id, event_type, target_type, target_id, environment, metadata, created_at
        FROM audit_log
        WHERE environment = $1
        ORDER BY created_at DESC
        LIMIT $2
        "#,
    )
    .bind(environment)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// The runtime version marker the CRUD layer bumps on every write
pub async fn read_runtime_version(
    pool: &PgPool,
    environment: &str,
) -> Result<String, ControlPlaneError> {
    let value: Option<Value> = sqlx::query_scalar(
        r#"
        SELECT value FROM system_settings
        WHERE environment = $1 AND category = 'runtime' AND setting_key = 'version'
        "#,
    )
    .bind(environment)
    .fetch_optional(pool)
    .await?;

    let version = value
        .as_ref()
        .and_then(|v| v.get("value"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(DEFAULT_RUNTIME_VERSION)
        .to_string();

    Ok(version)
}

async fn latest_flag_update(
    pool: &PgPool,
    environment: &str,
) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    sqlx::query_scalar("SELECT MAX(updated_at) FROM feature_flags WHERE environment = $1")
        .bind(environment)
        .fetch_one(pool)
        .await
}

async fn latest_marketing_update(
    pool: &PgPool,
    environment: &str,
) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    sqlx::query_scalar("SELECT MAX(updated_at) FROM marketing_config WHERE environment = $1")
        .bind(environment)
        .fetch_one(pool)
        .await
}

async fn latest_setting_update(
    pool: &PgPool,
    environment: &str,
) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    sqlx::query_scalar("SELECT MAX(updated_at) FROM system_settings WHERE environment = $1")
        .bind(environment)
        .fetch_one(pool)
        .await
}

async fn latest_audit_create(
    pool: &PgPool,
    environment: &str,
) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    sqlx::query_scalar("SELECT MAX(created_at) FROM audit_log WHERE environment = $1")
        .bind(environment)
        .fetch_one(pool)
        .await
}

fn marker(stamp: Option<DateTime<Utc>>) -> String {
    match stamp {
        Some(at) => at.to_rfc3339(),
        None => "0".to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct StreamVersion {
    pub runtime_version: String,
    pub stream_version: String,
    pub last_changed_at: String,
}

/// The cheap "has anything changed" read the distributor polls. A write to
/// any record covered by the runtime snapshot changes this value.
pub async fn read_stream_version(
    pool: &PgPool,
    environment: &str,
) -> Result<StreamVersion, ControlPlaneError> {
    let (runtime_version, flags_at, marketing_at, settings_at) = tokio::try_join!(
        read_runtime_version(pool, environment),
        async {
            Ok::<_, ControlPlaneError>(latest_flag_update(pool, environment).await?)
        },
        async {
            Ok::<_, ControlPlaneError>(latest_marketing_update(pool, environment).await?)
        },
        async {
            Ok::<_, ControlPlaneError>(latest_setting_update(pool, environment).await?)
        },
    )?;

    let stream_version = [
        runtime_version.clone(),
        marker(flags_at),
        marker(marketing_at),
        marker(settings_at),
    ]
    .join("|");

    let last_changed_at = [flags_at, marketing_at, settings_at]
        .into_iter()
        .flatten()
        .max()
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| Utc::now().to_rfc3339());

    Ok(StreamVersion {
        runtime_version,
        stream_version,
        last_changed_at,
    })
}

/// Admin streams additionally react to audit writes
pub async fn read_admin_stream_version(
    pool: &PgPool,
    environment: &str,
) -> Result<String, ControlPlaneError> {
    let (runtime_marker, audit_at) = tokio::try_join!(
        read_stream_version(pool, environment),
        async {
            Ok::<_, ControlPlaneError>(latest_audit_create(pool, environment).await?)
        },
    )?;

    Ok([runtime_marker.stream_version, marker(audit_at)].join("|"))
}

/// Round-trip latency of a trivial query, reported in admin health
pub async fn measure_db_latency(pool: &PgPool) -> Result<i64, ControlPlaneError> {
    let started = Instant::now();
    sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(pool).await?;
    Ok((started.elapsed().as_millis() as i64).max(1))
}
