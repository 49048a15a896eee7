use sokana_contracts::{Requester, Role};
use uuid::Uuid;

/// Kind of PHI access being attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhiAction {
    Read,
    Write,
}

impl PhiAction {
    pub fn as_str(self) -> &'static str {
        match self {
            PhiAction::Read => "read",
            PhiAction::Write => "write",
        }
    }
}

/// How a denied request is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    /// 200 with an empty data object; existence of the record is not confirmed.
    SilentEmpty,
    /// 403.
    Forbidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(Denial),
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allow
    }
}

/// The single PHI authorization rule used by both the API and the broker.
pub fn is_authorized(requester: &Requester, client_id: Uuid) -> bool {
    match requester.role {
        Role::Admin => true,
        Role::Doula => requester.assigned_client_ids.contains(&client_id),
        Role::Other => false,
    }
}

pub fn denial_for(action: PhiAction) -> Denial {
    match action {
        PhiAction::Read => Denial::SilentEmpty,
        PhiAction::Write => Denial::Forbidden,
    }
}

pub fn decide(requester: &Requester, client_id: Uuid, action: PhiAction) -> Decision {
    if is_authorized(requester, client_id) {
        Decision::Allow
    } else {
        Decision::Deny(denial_for(action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requester(role: Role, assigned: &[Uuid]) -> Requester {
        Requester {
            role,
            user_id: "user-1".to_string(),
            assigned_client_ids: assigned.to_vec(),
        }
    }

    #[test]
    fn admin_is_always_authorized() {
        let admin = requester(Role::Admin, &[]);
        assert!(is_authorized(&admin, Uuid::new_v4()));
    }

    #[test]
    fn doula_is_authorized_only_for_assigned_clients() {
        let x = Uuid::new_v4();
        let y = Uuid::new_v4();
        let doula = requester(Role::Doula, &[x]);
        assert!(is_authorized(&doula, x));
        assert!(!is_authorized(&doula, y));
        assert!(!is_authorized(&requester(Role::Doula, &[]), x));
    }

    #[test]
    fn other_roles_are_never_authorized() {
        let x = Uuid::new_v4();
        assert!(!is_authorized(&requester(Role::Other, &[x]), x));
    }

    #[test]
    fn denials_differ_between_read_and_write() {
        let x = Uuid::new_v4();
        let other = requester(Role::Other, &[]);
        assert_eq!(
            decide(&other, x, PhiAction::Read),
            Decision::Deny(Denial::SilentEmpty)
        );
        assert_eq!(
            decide(&other, x, PhiAction::Write),
            Decision::Deny(Denial::Forbidden)
        );
        assert!(decide(&requester(Role::Admin, &[]), x, PhiAction::Write).is_allowed());
    }
}
