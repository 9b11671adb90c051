use crate::db::models::User;
use crate::db::types::UserRole;

/// Identity a core operation runs under.
///
/// When an admin impersonates someone, `user` is the impersonated account and
/// every permission check is evaluated against it; `impersonator` is kept for
/// audit logging only.
#[derive(Debug, Clone)]
pub(crate) struct ActingUser {
    user: User,
    impersonator: Option<User>,
}

impl ActingUser {
    pub(crate) fn new(user: User) -> Self {
        Self { user, impersonator: None }
    }

    pub(crate) fn impersonated(user: User, impersonator: User) -> Self {
        Self { user, impersonator: Some(impersonator) }
    }

    pub(crate) fn id(&self) -> &str {
        &self.user.id
    }

    pub(crate) fn role(&self) -> UserRole {
        self.user.role
    }

    pub(crate) fn user(&self) -> &User {
        &self.user
    }

    pub(crate) fn impersonator_id(&self) -> Option<&str> {
        self.impersonator.as_ref().map(|user| user.id.as_str())
    }

    pub(crate) fn is_admin(&self) -> bool {
        self.user.role == UserRole::Admin
    }

    /// Teachers and admins author problems and exams.
    pub(crate) fn is_staff(&self) -> bool {
        matches!(self.user.role, UserRole::Teacher | UserRole::Admin)
    }

    pub(crate) fn can_manage(&self, owner_id: &str) -> bool {
        self.is_admin() || (self.is_staff() && self.user.id == owner_id)
    }

    /// Students see their own submissions; staff see everyone's.
    pub(crate) fn can_view_submission_of(&self, submitter_id: &str) -> bool {
        self.is_staff() || self.user.id == submitter_id
    }
}
