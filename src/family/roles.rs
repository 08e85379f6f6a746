//! Roles and the authorization predicates derived from them

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FamilyRole {
    Owner,
    Contributor,
    Viewer,
}

impl FamilyRole {
    pub fn can_invite(self) -> bool {
        matches!(self, FamilyRole::Owner | FamilyRole::Contributor)
    }

    pub fn can_change_role(self) -> bool {
        self == FamilyRole::Owner
    }

    pub fn can_remove(self) -> bool {
        self == FamilyRole::Owner
    }

    pub fn permissions(self) -> Permissions {
        Permissions {
            can_invite: self.can_invite(),
            can_change_role: self.can_change_role(),
            can_remove: self.can_remove(),
        }
    }
}

impl fmt::Display for FamilyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FamilyRole::Owner => "owner",
            FamilyRole::Contributor => "contributor",
            FamilyRole::Viewer => "viewer",
        };
        f.write_str(name)
    }
}

/// The whole authorization surface of a family unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub can_invite: bool,
    pub can_change_role: bool,
    pub can_remove: bool,
}

/// Actions gated by a caller's effective role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FamilyAction {
    View,
    Invite,
    ChangeRole,
    Remove,
}

impl FamilyAction {
    pub(crate) fn allowed_for(self, role: FamilyRole) -> bool {
        match self {
            FamilyAction::View => true,
            FamilyAction::Invite => role.can_invite(),
            FamilyAction::ChangeRole => role.can_change_role(),
            FamilyAction::Remove => role.can_remove(),
        }
    }

    /// Least privileged role that may perform the action
    pub(crate) fn required_role(self) -> FamilyRole {
        match self {
            FamilyAction::View => FamilyRole::Viewer,
            FamilyAction::Invite => FamilyRole::Contributor,
            FamilyAction::ChangeRole | FamilyAction::Remove => FamilyRole::Owner,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_table() {
        assert_eq!(
            FamilyRole::Owner.permissions(),
            Permissions {
                can_invite: true,
                can_change_role: true,
                can_remove: true
            }
        );
        assert_eq!(
            FamilyRole::Contributor.permissions(),
            Permissions {
                can_invite: true,
                can_change_role: false,
                can_remove: false
            }
        );
        assert_eq!(
            FamilyRole::Viewer.permissions(),
            Permissions {
                can_invite: false,
                can_change_role: false,
                can_remove: false
            }
        );
    }

    #[test]
    fn test_required_role_is_sufficient() {
        for action in [
            FamilyAction::View,
            FamilyAction::Invite,
            FamilyAction::ChangeRole,
            FamilyAction::Remove,
        ] {
            assert!(action.allowed_for(action.required_role()));
            assert!(action.allowed_for(FamilyRole::Owner));
        }
    }
}
