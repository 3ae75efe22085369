//! Collaborator-permission ranking (spec.md §4.5).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    None,
    Read,
    Triage,
    Write,
    Maintain,
    Admin,
}

impl PermissionLevel {
    /// Maps a source-control platform's collaborator-permission string
    /// to a rank. Unknown strings map to `None` (closed, not permissive).
    pub fn from_api_value(value: &str) -> Self {
        match value {
            "admin" => Self::Admin,
            "maintain" => Self::Maintain,
            "write" => Self::Write,
            "triage" => Self::Triage,
            "read" => Self::Read,
            _ => Self::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_order_as_specified() {
        assert!(PermissionLevel::Admin > PermissionLevel::Maintain);
        assert!(PermissionLevel::Maintain > PermissionLevel::Write);
        assert!(PermissionLevel::Write > PermissionLevel::Triage);
        assert!(PermissionLevel::Triage > PermissionLevel::Read);
        assert!(PermissionLevel::Read > PermissionLevel::None);
    }

    #[test]
    fn unknown_api_value_is_closed_to_none() {
        assert_eq!(PermissionLevel::from_api_value("bogus"), PermissionLevel::None);
    }

    #[test]
    fn default_policy_threshold_accepts_triage_and_above() {
        let threshold = PermissionLevel::Triage;
        assert!(PermissionLevel::Write >= threshold);
        assert!(PermissionLevel::Triage >= threshold);
        assert!(PermissionLevel::Read < threshold);
    }
}
