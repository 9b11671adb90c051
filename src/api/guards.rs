use async_trait::async_trait;
use axum::extract::{FromRequestParts, State};
use axum::http::{header, request::Parts, HeaderName};

use crate::api::errors::ApiError;
use crate::core::{security, state::AppState};
use crate::db::models::User;
use crate::services::access::ActingUser;

pub(crate) const IMPERSONATE_HEADER: HeaderName = HeaderName::from_static("x-impersonate-user");

/// The user every core operation runs as. Admins may act as another user
/// through the `X-Impersonate-User` header.
pub(crate) struct CurrentUser(pub(crate) ActingUser);
pub(crate) struct CurrentStaff(pub(crate) ActingUser);
pub(crate) struct CurrentAdmin(pub(crate) ActingUser);

async fn authenticated_user(parts: &Parts, state: &AppState) -> Result<User, ApiError> {
    let auth_header = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or(ApiError::Unauthorized("Invalid authentication credentials"))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(ApiError::Unauthorized("Invalid authentication credentials"))?;

    let claims = security::verify_token(token, state.settings())
        .map_err(|_| ApiError::Unauthorized("Invalid authentication credentials"))?;

    let user = state.stores().users.find_by_id(&claims.sub).await?;

    let Some(user) = user else {
        return Err(ApiError::Unauthorized("User not found"));
    };

    if !user.is_active {
        return Err(ApiError::Unauthorized("Invalid authentication credentials"));
    }

    Ok(user)
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let State(app_state) = State::<AppState>::from_request_parts(parts, state)
            .await
            .map_err(|e| ApiError::internal(e, "Failed to access application state"))?;

        let user = authenticated_user(parts, &app_state).await?;

        let target_id = parts
            .headers
            .get(&IMPERSONATE_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let Some(target_id) = target_id else {
            return Ok(CurrentUser(ActingUser::new(user)));
        };

        let admin = ActingUser::new(user);
        if !admin.is_admin() {
            return Err(ApiError::Forbidden("Only admins may impersonate users"));
        }
        let target = app_state
            .stores()
            .users
            .find_by_id(target_id)
            .await?
            .filter(|target| target.is_active)
            .ok_or_else(|| ApiError::NotFound("Impersonated user not found".to_string()))?;

        tracing::info!(
            impersonator_id = %admin.id(),
            user_id = %target.id,
            "Acting as another user"
        );
        Ok(CurrentUser(ActingUser::impersonated(target, admin.user().clone())))
    }
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentStaff {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let CurrentUser(acting) = CurrentUser::from_request_parts(parts, state).await?;

        if acting.is_staff() {
            Ok(CurrentStaff(acting))
        } else {
            Err(ApiError::Forbidden("Teacher access required"))
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentAdmin {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let CurrentUser(acting) = CurrentUser::from_request_parts(parts, state).await?;

        if acting.is_admin() {
            Ok(CurrentAdmin(acting))
        } else {
            Err(ApiError::Forbidden("Admin access required"))
        }
    }
}
