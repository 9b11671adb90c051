use serde::{Deserialize, Serialize};

use crate::core::time::format_primitive;
use crate::db::models::User;
use crate::db::types::UserRole;

#[derive(Debug, Serialize)]
pub(crate) struct UserResponse {
    pub(crate) id: String,
    pub(crate) username: String,
    pub(crate) full_name: String,
    pub(crate) role: UserRole,
    pub(crate) is_active: bool,
    pub(crate) created_at: String,
    pub(crate) updated_at: String,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            full_name: user.full_name,
            role: user.role,
            is_active: user.is_active,
            created_at: format_primitive(user.created_at),
            updated_at: format_primitive(user.updated_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct MeResponse {
    #[serde(flatten)]
    pub(crate) user: UserResponse,
    /// Set when an admin is acting as this user.
    pub(crate) impersonated_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RoleUpdate {
    pub(crate) role: UserRole,
}
