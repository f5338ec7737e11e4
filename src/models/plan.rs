//! Subscription tiers and the limits each one grants.

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr};

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Pro,
    Business,
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Plan::Free => "free",
            Plan::Pro => "pro",
            Plan::Business => "business",
        };
        f.write_str(name)
    }
}

impl FromStr for Plan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Plan::Free),
            "pro" => Ok(Plan::Pro),
            "business" => Ok(Plan::Business),
            other => Err(format!("unsupported plan `{}`", other)),
        }
    }
}

/// Per-plan caps enforced at transfer creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    /// Largest aggregate size of a single transfer.
    pub max_transfer_bytes: u64,
    /// Lifetime applied when the caller does not pick an expiry.
    pub expiry_days: u32,
    /// Upper bound for a caller-supplied expiry.
    pub max_expiry_days: u32,
    /// Transfers per calendar month; `None` means unlimited.
    pub monthly_transfers: Option<u32>,
}

impl PlanLimits {
    pub fn default_table() -> HashMap<Plan, PlanLimits> {
        HashMap::from([
            (
                Plan::Free,
                PlanLimits {
                    max_transfer_bytes: 2 * GIB,
                    expiry_days: 7,
                    max_expiry_days: 7,
                    monthly_transfers: Some(10),
                },
            ),
            (
                Plan::Pro,
                PlanLimits {
                    max_transfer_bytes: 200 * GIB,
                    expiry_days: 7,
                    max_expiry_days: 30,
                    monthly_transfers: Some(1000),
                },
            ),
            (
                Plan::Business,
                PlanLimits {
                    max_transfer_bytes: 1024 * GIB,
                    expiry_days: 14,
                    max_expiry_days: 365,
                    monthly_transfers: None,
                },
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_names_parse_case_insensitively() {
        assert_eq!("PRO".parse::<Plan>(), Ok(Plan::Pro));
        assert_eq!(" free ".parse::<Plan>(), Ok(Plan::Free));
        assert!("enterprise".parse::<Plan>().is_err());
    }

    #[test]
    fn plans_file_format_round_trips_through_serde() {
        let raw = r#"{"free": {"max_transfer_bytes": 100, "expiry_days": 3,
                     "max_expiry_days": 5, "monthly_transfers": null}}"#;
        let table: HashMap<Plan, PlanLimits> = serde_json::from_str(raw).unwrap();
        let free = &table[&Plan::Free];
        assert_eq!(free.max_transfer_bytes, 100);
        assert_eq!(free.monthly_transfers, None);
    }

    #[test]
    fn default_expiry_never_exceeds_cap() {
        for limits in PlanLimits::default_table().values() {
            assert!(limits.expiry_days <= limits.max_expiry_days);
        }
    }
}
