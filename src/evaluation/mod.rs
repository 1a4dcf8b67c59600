use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// Caller context for evaluation
#[derive(Debug, Deserialize, Clone, Default)]
pub struct EvaluationContext {
    pub user_id: Option<String>,
    pub org_id: Option<String>,
    pub anonymous_id: Option<String>,
}

/// How broadly a flag record applies. Resolution always narrows to the most
/// specific matching scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    Global,
    Organization,
    User,
}

impl ScopeType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "global" => Some(ScopeType::Global),
            "organization" => Some(ScopeType::Organization),
            "user" => Some(ScopeType::User),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeType::Global => "global",
            ScopeType::Organization => "organization",
            ScopeType::User => "user",
        }
    }
}

// Flag data needed for evaluation. Rows are loaded and converted in
// snapshot::queries; this type stays store-free.
#[derive(Debug, Clone, Serialize)]
pub struct FlagRecord {
    pub key: String,
    pub environment: String,
    pub scope_type: ScopeType,
    pub scope_id: Option<String>,
    pub enabled: bool,
    pub kill_switch: bool,
    pub rollout_percentage: i64,
    pub variants: BTreeMap<String, i64>,
    pub default_variant: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub is_public: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionReason {
    NotConfigured,
    KillSwitch,
    OutsideSchedule,
    Disabled,
    OutsideRollout,
    Enabled,
}

// Flag evaluation result; computed, never persisted
#[derive(Debug, Clone, Serialize)]
pub struct FeatureDecision {
    pub enabled: bool,
    pub variant: Option<String>,
    pub reason: DecisionReason,
    pub scope_type: Option<ScopeType>,
}

impl FeatureDecision {
    fn disabled(reason: DecisionReason, scope_type: Option<ScopeType>) -> Self {
        FeatureDecision {
            enabled: false,
            variant: None,
            reason,
            scope_type,
        }
    }
}

const FNV_OFFSET_BASIS: u32 = 0x811c9dc5;
const FNV_PRIME: u32 = 16777619;

/// FNV-1a over the input bytes, 32-bit. Deterministic across processes so a
/// caller's rollout and variant assignment survive restarts. DefaultHasher is
/// randomly seeded per process and must not be used here.
pub fn stable_hash(input: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in input.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Select the single most specific record applying to this context:
/// user scope beats organization scope beats global.
fn resolve_scope<'a>(
    records: &'a [FlagRecord],
    context: &EvaluationContext,
) -> Option<&'a FlagRecord> {
    let mut org_match = None;
    let mut global_match = None;

    for record in records {
        match record.scope_type {
            ScopeType::User => {
                if record.scope_id.is_some() && record.scope_id == context.user_id {
                    return Some(record);
                }
            }
            ScopeType::Organization => {
                if org_match.is_none()
                    && record.scope_id.is_some()
                    && record.scope_id == context.org_id
                {
                    org_match = Some(record);
                }
            }
            ScopeType::Global => {
                if global_match.is_none() {
                    global_match = Some(record);
                }
            }
        }
    }

    org_match.or(global_match)
}

fn schedule_active(record: &FlagRecord, now: DateTime<Utc>) -> bool {
    if let Some(start_at) = record.start_at {
        if now < start_at {
            return false;
        }
    }
    if let Some(end_at) = record.end_at {
        // End is exclusive
        if now >= end_at {
            return false;
        }
    }
    true
}

/// Build the identity string the rollout and variant buckets hash over.
/// Organization-scoped flags prefer the org id so every user in the same org
/// lands in the same bucket.
fn rollout_identity(key: &str, scope_type: ScopeType, context: &EvaluationContext) -> String {
    let subject = match scope_type {
        ScopeType::User => context
            .user_id
            .as_deref()
            .or(context.anonymous_id.as_deref())
            .unwrap_or("anon"),
        ScopeType::Organization => context
            .org_id
            .as_deref()
            .or(context.user_id.as_deref())
            .or(context.anonymous_id.as_deref())
            .unwrap_or("anon"),
        ScopeType::Global => context
            .user_id
            .as_deref()
            .or(context.org_id.as_deref())
            .or(context.anonymous_id.as_deref())
            .unwrap_or("anon"),
    };
    format!("{}:{}", key, subject)
}

/// Weighted variant choice. Reuses the same identity hash as rollout
/// admission so a caller's experience is one stable coordinate; do not split
/// this into two independent hashes.
fn select_variant(record: &FlagRecord, identity: &str) -> Option<String> {
    if record.variants.is_empty() {
        return record.default_variant.clone();
    }

    // Negative weights are a producer bug; skip them rather than fail
    let weighted: Vec<(&String, i64)> = record
        .variants
        .iter()
        .filter(|(_, weight)| **weight > 0)
        .map(|(name, weight)| (name, *weight))
        .collect();

    let total: i64 = weighted.iter().map(|(_, weight)| weight).sum();
    if total <= 0 {
        return record.default_variant.clone();
    }

    let bucket = (stable_hash(identity) as i64) % total;
    let mut cumulative = 0;
    for (name, weight) in &weighted {
        cumulative += weight;
        if bucket < cumulative {
            return Some((*name).clone());
        }
    }

    // Unreachable given the total check, but fall back rather than panic
    weighted.first().map(|(name, _)| (*name).clone())
}

/// Evaluate one flag key against its candidate records (already filtered by
/// key and environment by the caller). Pure and total: every outcome is a
/// reason code, never an error.
pub fn evaluate(
    key: &str,
    records: &[FlagRecord],
    context: &EvaluationContext,
    now: DateTime<Utc>,
) -> FeatureDecision {
    let record = match resolve_scope(records, context) {
        Some(record) => record,
        None => return FeatureDecision::disabled(DecisionReason::NotConfigured, None),
    };

    let scope_type = Some(record.scope_type);

    // Kill switch wins over everything, including the schedule, so an
    // operator can always force a flag off instantly
    if record.kill_switch {
        return FeatureDecision::disabled(DecisionReason::KillSwitch, scope_type);
    }

    if !schedule_active(record, now) {
        return FeatureDecision::disabled(DecisionReason::OutsideSchedule, scope_type);
    }

    if !record.enabled {
        return FeatureDecision::disabled(DecisionReason::Disabled, scope_type);
    }

    let identity = rollout_identity(key, record.scope_type, context);
    let rollout = record.rollout_percentage.clamp(0, 100);
    let bucket = (stable_hash(&identity) % 100) as i64;
    if bucket >= rollout {
        return FeatureDecision::disabled(DecisionReason::OutsideRollout, scope_type);
    }

    FeatureDecision {
        enabled: true,
        variant: select_variant(record, &identity),
        reason: DecisionReason::Enabled,
        scope_type,
    }
}
