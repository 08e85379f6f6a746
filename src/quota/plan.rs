//! Plans and the limits they grant

use serde::{Deserialize, Serialize};
use std::fmt;

const GIB: u64 = 1024 * 1024 * 1024;

/// Subscription tier of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Premium,
    Family,
}

impl Plan {
    /// Limits are a pure function of the plan
    pub const fn limits(self) -> PlanLimits {
        match self {
            Plan::Free => PlanLimits {
                storage_bytes: GIB,
                files: 50,
                folders: 5,
            },
            Plan::Premium => PlanLimits {
                storage_bytes: 50 * GIB,
                files: 1_000,
                folders: 50,
            },
            Plan::Family => PlanLimits {
                storage_bytes: 200 * GIB,
                files: 5_000,
                folders: 100,
            },
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Plan::Free => "free",
            Plan::Premium => "premium",
            Plan::Family => "family",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub storage_bytes: u64,
    pub files: u64,
    pub folders: u64,
}

impl PlanLimits {
    pub fn limit_for(&self, dimension: QuotaDimension) -> u64 {
        match dimension {
            QuotaDimension::Storage => self.storage_bytes,
            QuotaDimension::Files => self.files,
            QuotaDimension::Folders => self.folders,
        }
    }
}

/// One measured axis of a quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaDimension {
    Storage,
    Files,
    Folders,
}

impl fmt::Display for QuotaDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QuotaDimension::Storage => "storage",
            QuotaDimension::Files => "files",
            QuotaDimension::Folders => "folders",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_limits_table() {
        assert_eq!(Plan::Free.limits().storage_bytes, 1024 * 1024 * 1024);
        assert_eq!(Plan::Free.limits().files, 50);
        assert_eq!(Plan::Free.limits().folders, 5);
        assert_eq!(Plan::Premium.limits().storage_bytes, 50 * GIB);
        assert_eq!(Plan::Premium.limits().files, 1_000);
        assert_eq!(Plan::Family.limits().storage_bytes, 200 * GIB);
        assert_eq!(Plan::Family.limits().folders, 100);
    }

    #[test]
    fn test_plan_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Plan::Premium).unwrap(), "\"premium\"");
        let plan: Plan = serde_json::from_str("\"family\"").unwrap();
        assert_eq!(plan, Plan::Family);
    }
}
