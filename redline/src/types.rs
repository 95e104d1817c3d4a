//! Core identifiers and domain enums shared across the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

macro_rules! uuid_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl std::ops::Deref for $name {
            type Target = Uuid;

            fn deref(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_newtype!(
    /// Identifier of a single analysis record (and its queue job).
    AnalysisId
);
uuid_newtype!(
    /// Identifier of the user that owns an analysis.
    UserId
);
uuid_newtype!(
    /// Identifier of a worker instance, used when claiming jobs.
    WorkerId
);

/// Service tier requested for an analysis.
///
/// Unknown tier names deserialize to `Premium`, mirroring the resolver's
/// default for missing tier keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Basic,
    Forensic,
    #[default]
    #[serde(other)]
    Premium,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Basic => "basic",
            Tier::Premium => "premium",
            Tier::Forensic => "forensic",
        }
    }

    pub fn parse_or_default(s: &str) -> Tier {
        match s.trim() {
            "basic" => Tier::Basic,
            "forensic" => Tier::Forensic,
            _ => Tier::Premium,
        }
    }

    /// Timeout applied to the single model invocation for this tier.
    pub fn provider_timeout(&self) -> Duration {
        match self {
            Tier::Basic => Duration::from_millis(120_000),
            Tier::Premium => Duration::from_millis(300_000),
            Tier::Forensic => Duration::from_millis(600_000),
        }
    }

    /// Hard timeout for the whole job attempt. Must exceed the provider
    /// timeout so the model client gets a chance to classify its own failure.
    pub fn job_timeout(&self) -> Duration {
        self.provider_timeout() + Duration::from_secs(50)
    }

    /// Tokens reserved for the prompt scaffold when computing the
    /// preprocessing budget. Forensic gets a larger buffer to protect its
    /// much larger context window.
    pub fn reserved_prompt_buffer(&self) -> usize {
        match self {
            Tier::Forensic => 5000,
            _ => 2000,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical three-level risk scale stored on completed records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    High,
    Medium,
    Low,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::High => "high",
            RiskLevel::Medium => "medium",
            RiskLevel::Low => "low",
        }
    }

    /// Map a provider-specific risk label onto the canonical scale.
    ///
    /// The lookup table covers the vocabularies observed from the analysis
    /// prompts over time, including legacy Spanish labels. Unrecognized
    /// labels default to `Medium` and are logged so they can be reviewed.
    pub fn from_provider_label(label: &str) -> RiskLevel {
        match label.trim() {
            "high" | "High" | "HIGH" | "Alto" | "PELIGROSO" => RiskLevel::High,
            "medium" | "Medium" | "MEDIUM" | "Medio" | "PRECAUCI\u{d3}N" => RiskLevel::Medium,
            "low" | "Low" | "LOW" | "Bajo" | "ACEPTABLE" => RiskLevel::Low,
            other => {
                tracing::warn!(label = %other, "unrecognized risk label, defaulting to medium");
                RiskLevel::Medium
            }
        }
    }

    pub fn parse(s: &str) -> Option<RiskLevel> {
        match s {
            "high" => Some(RiskLevel::High),
            "medium" => Some(RiskLevel::Medium),
            "low" => Some(RiskLevel::Low),
            _ => None,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of an analysis record. Strictly forward:
/// `Pending -> Processing -> {Completed | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Processing => "processing",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<AnalysisStatus> {
        match s {
            "pending" => Some(AnalysisStatus::Pending),
            "processing" => Some(AnalysisStatus::Processing),
            "completed" => Some(AnalysisStatus::Completed),
            "failed" => Some(AnalysisStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AnalysisStatus::Completed | AnalysisStatus::Failed)
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent analysis record. `summary` is an opaque structured result
/// whose reserved `_debug` key is access-controlled by the debug gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: AnalysisId,
    pub user_id: UserId,
    pub contract_name: String,
    pub storage_path: String,
    pub status: AnalysisStatus,
    pub risk_level: Option<RiskLevel>,
    pub summary: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub analysis_type: Tier,
    pub credits_used: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Explicit per-request caller context. Passed as an argument into every
/// component that needs it, never read from ambient state.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub user_id: UserId,
    /// Privileged callers (admins) see debug metadata and other users' records.
    pub privileged: bool,
    /// Development/testing escape hatch: when the `debug_visible` feature
    /// flag is on, debug metadata is visible to everyone.
    pub debug_enabled: bool,
}

impl RequestContext {
    pub fn user(user_id: UserId) -> Self {
        Self {
            user_id,
            privileged: false,
            debug_enabled: false,
        }
    }

    pub fn privileged(user_id: UserId) -> Self {
        Self {
            user_id,
            privileged: true,
            debug_enabled: false,
        }
    }

    pub fn with_debug_enabled(mut self, enabled: bool) -> Self {
        self.debug_enabled = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_parse_defaults_to_premium() {
        assert_eq!(Tier::parse_or_default("basic"), Tier::Basic);
        assert_eq!(Tier::parse_or_default("forensic"), Tier::Forensic);
        assert_eq!(Tier::parse_or_default("premium"), Tier::Premium);
        assert_eq!(Tier::parse_or_default("platinum"), Tier::Premium);
        assert_eq!(Tier::parse_or_default(""), Tier::Premium);
    }

    #[test]
    fn tier_deserializes_unknown_as_premium() {
        let t: Tier = serde_json::from_str("\"gold\"").unwrap();
        assert_eq!(t, Tier::Premium);
        let t: Tier = serde_json::from_str("\"basic\"").unwrap();
        assert_eq!(t, Tier::Basic);
    }

    #[test]
    fn risk_label_mapping_covers_known_vocabularies() {
        assert_eq!(RiskLevel::from_provider_label("Alto"), RiskLevel::High);
        assert_eq!(RiskLevel::from_provider_label("PELIGROSO"), RiskLevel::High);
        assert_eq!(RiskLevel::from_provider_label("Medio"), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_provider_label("Bajo"), RiskLevel::Low);
        assert_eq!(RiskLevel::from_provider_label("ACEPTABLE"), RiskLevel::Low);
        assert_eq!(RiskLevel::from_provider_label("High"), RiskLevel::High);
        assert_eq!(RiskLevel::from_provider_label("low"), RiskLevel::Low);
    }

    #[test]
    fn unrecognized_risk_label_defaults_to_medium() {
        assert_eq!(
            RiskLevel::from_provider_label("CATASTROPHIC"),
            RiskLevel::Medium
        );
    }

    #[test]
    fn job_timeout_exceeds_provider_timeout() {
        for tier in [Tier::Basic, Tier::Premium, Tier::Forensic] {
            assert!(tier.job_timeout() > tier.provider_timeout());
        }
    }
}
