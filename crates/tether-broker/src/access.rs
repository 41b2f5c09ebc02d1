//! Team-based access control shared by every broker operation.

use tether_state::TeamName;

/// True iff the caller's teams intersect the resource's ACL.
pub fn has_access<T: AsRef<str>>(teams: &[T], resource_teams: &[TeamName]) -> bool {
    teams
        .iter()
        .any(|team| resource_teams.iter().any(|r| r == team.as_ref()))
}

/// Result of trying to drop a team from an ACL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Revocation {
    Revoked,
    NotGranted,
    /// Refused: the ACL would become empty.
    LastTeam,
}

/// Remove `team` from `acl` unless it is absent or the sole entry.
pub(crate) fn revoke_team(acl: &mut Vec<TeamName>, team: &str) -> Revocation {
    if !acl.iter().any(|t| t == team) {
        return Revocation::NotGranted;
    }
    if acl.iter().all(|t| t == team) {
        return Revocation::LastTeam;
    }
    acl.retain(|t| t != team);
    Revocation::Revoked
}
