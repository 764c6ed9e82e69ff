use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub const SECONDS_PER_DAY: i64 = 86_400;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// Signals and assessments share the same three-step scale.
pub type SignalLevel = RiskLevel;

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            other => Err(format!(
                "invalid risk level '{other}', expected one of: LOW, MEDIUM, HIGH"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalTier {
    Baseline,
    OnDemand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum SignalName {
    Coupling,
    CoChange,
    TestRatio,
    OwnershipChurn,
    IncidentSimilarity,
}

impl SignalName {
    pub const ALL: [SignalName; 5] = [
        Self::Coupling,
        Self::CoChange,
        Self::TestRatio,
        Self::OwnershipChurn,
        Self::IncidentSimilarity,
    ];

    pub const BASELINE: [SignalName; 3] = [Self::Coupling, Self::CoChange, Self::TestRatio];

    pub const ON_DEMAND: [SignalName; 2] = [Self::OwnershipChurn, Self::IncidentSimilarity];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Coupling => "coupling",
            Self::CoChange => "co_change",
            Self::TestRatio => "test_ratio",
            Self::OwnershipChurn => "ownership_churn",
            Self::IncidentSimilarity => "incident_similarity",
        }
    }

    pub fn tier(self) -> SignalTier {
        match self {
            Self::Coupling | Self::CoChange | Self::TestRatio => SignalTier::Baseline,
            Self::OwnershipChurn | Self::IncidentSimilarity => SignalTier::OnDemand,
        }
    }
}

impl fmt::Display for SignalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SignalName {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "coupling" => Ok(Self::Coupling),
            "co_change" | "cochange" => Ok(Self::CoChange),
            "test_ratio" => Ok(Self::TestRatio),
            "ownership_churn" => Ok(Self::OwnershipChurn),
            "incident_similarity" => Ok(Self::IncidentSimilarity),
            _ => Err(format!(
                "invalid signal '{}', expected one of: coupling, co_change, test_ratio, ownership_churn, incident_similarity",
                value.trim()
            )),
        }
    }
}

pub fn normalize_path(path: &str) -> String {
    let path = path.trim().replace('\\', "/");
    path.strip_prefix("./").map(str::to_owned).unwrap_or(path)
}

pub fn stable_id(parts: &[&str]) -> String {
    blake3_hex(parts.join("\n").as_bytes())
}

pub fn now_unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_secs() as i64)
        .unwrap_or(0)
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_millis() as i64)
        .unwrap_or(0)
}

pub fn days_between(earlier_unix: i64, later_unix: i64) -> i64 {
    (later_unix.saturating_sub(earlier_unix)).max(0) / SECONDS_PER_DAY
}

fn blake3_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_level_parses_case_insensitively_and_serializes_uppercase() {
        assert_eq!("medium".parse::<RiskLevel>(), Ok(RiskLevel::Medium));
        assert_eq!(" HIGH ".parse::<RiskLevel>(), Ok(RiskLevel::High));
        assert!("CRITICAL".parse::<RiskLevel>().is_err());

        let json = serde_json::to_string(&RiskLevel::Low).expect("serialize");
        assert_eq!(json, "\"LOW\"");
    }

    #[test]
    fn signal_names_parse_aliases_and_report_tiers() {
        assert_eq!("co-change".parse::<SignalName>(), Ok(SignalName::CoChange));
        assert_eq!(
            "Ownership Churn".parse::<SignalName>(),
            Ok(SignalName::OwnershipChurn)
        );
        assert!("semantic".parse::<SignalName>().is_err());

        assert!(
            SignalName::BASELINE
                .iter()
                .all(|name| name.tier() == SignalTier::Baseline)
        );
        assert!(
            SignalName::ON_DEMAND
                .iter()
                .all(|name| name.tier() == SignalTier::OnDemand)
        );
    }

    #[test]
    fn normalize_path_unifies_separators_and_strips_dot_prefix() {
        assert_eq!(normalize_path("./src\\auth\\login.py"), "src/auth/login.py");
        assert_eq!(normalize_path("  src/lib.rs "), "src/lib.rs");
    }

    #[test]
    fn stable_id_is_deterministic() {
        assert_eq!(stable_id(&["a", "b"]), stable_id(&["a", "b"]));
        assert_ne!(stable_id(&["a", "b"]), stable_id(&["ab"]));
    }

    #[test]
    fn days_between_never_goes_negative() {
        assert_eq!(days_between(0, SECONDS_PER_DAY * 3 + 10), 3);
        assert_eq!(days_between(SECONDS_PER_DAY, 0), 0);
    }
}
