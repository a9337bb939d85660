//! Team and membership management endpoints.

use actix_web::{delete, get, post, put, web, HttpRequest, HttpResponse};
use serde::Deserialize;

use trustplane::authz::Role;

use crate::error::{ApiError, ErrorCode};
use crate::middleware::{
    authenticate, enforce_ip_limit, enforce_user_limit, team_scope, RequestContext,
};
use crate::state::AppState;

fn parse_role(ctx: &RequestContext, role: &str) -> Result<Role, ApiError> {
    Role::parse(role).ok_or_else(|| {
        ctx.err(ErrorCode::ValidationError)
            .message("role must be one of viewer, member, admin, owner")
            .field("role")
    })
}

#[derive(Deserialize)]
pub struct CreateTeamRequest {
    pub name: String,
}

#[post("/teams")]
pub async fn create_team(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CreateTeamRequest>,
) -> Result<HttpResponse, ApiError> {
    let ctx = RequestContext::new(&req);
    enforce_ip_limit(&state, &ctx)?;
    let session = authenticate(&state, &req, &ctx)?;
    enforce_user_limit(&state, &ctx, &session.user_id)?;

    let team_id = state
        .authz
        .create_team(&body.name, &session.user_id)
        .map_err(|e| ctx.core_err(e))?;
    Ok(ctx.ok_json(serde_json::json!({ "team_id": team_id })))
}

#[get("/teams")]
pub async fn list_teams(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let ctx = RequestContext::new(&req);
    enforce_ip_limit(&state, &ctx)?;
    let session = authenticate(&state, &req, &ctx)?;
    enforce_user_limit(&state, &ctx, &session.user_id)?;

    let teams = state
        .authz
        .list_teams(&session.user_id, true)
        .map_err(|e| ctx.core_err(e))?;
    Ok(ctx.ok_json(serde_json::json!({ "teams": teams })))
}

#[derive(Deserialize)]
pub struct AddMemberRequest {
    pub user_id: String,
    pub role: String,
}

#[post("/teams/{team_id}/members")]
pub async fn add_member(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<AddMemberRequest>,
) -> Result<HttpResponse, ApiError> {
    let ctx = RequestContext::new(&req);
    enforce_ip_limit(&state, &ctx)?;
    let session = authenticate(&state, &req, &ctx)?;
    enforce_user_limit(&state, &ctx, &session.user_id)?;

    let team_id = path.into_inner();
    team_scope(&state, &ctx, &session.user_id, &team_id, Some(Role::Admin))?;

    let role = parse_role(&ctx, &body.role)?;
    let membership = state
        .authz
        .add_member(&team_id, &body.user_id, role, &session.user_id)
        .map_err(|e| ctx.core_err(e))?;
    Ok(ctx.ok_json(serde_json::json!({ "membership": membership })))
}

#[derive(Deserialize)]
pub struct ChangeRoleRequest {
    pub role: String,
}

#[put("/teams/{team_id}/members/{user_id}/role")]
pub async fn change_role(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    body: web::Json<ChangeRoleRequest>,
) -> Result<HttpResponse, ApiError> {
    let ctx = RequestContext::new(&req);
    enforce_ip_limit(&state, &ctx)?;
    let session = authenticate(&state, &req, &ctx)?;
    enforce_user_limit(&state, &ctx, &session.user_id)?;

    let (team_id, target_user) = path.into_inner();
    team_scope(&state, &ctx, &session.user_id, &team_id, Some(Role::Admin))?;

    let role = parse_role(&ctx, &body.role)?;
    state
        .authz
        .change_role(&team_id, &target_user, role, &session.user_id)
        .map_err(|e| ctx.core_err(e))?;
    Ok(ctx.ok_json(serde_json::json!({
        "message": "Role changed. Affected user's sessions revoked."
    })))
}

#[delete("/teams/{team_id}/members/{user_id}")]
pub async fn remove_member(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, ApiError> {
    let ctx = RequestContext::new(&req);
    enforce_ip_limit(&state, &ctx)?;
    let session = authenticate(&state, &req, &ctx)?;
    enforce_user_limit(&state, &ctx, &session.user_id)?;

    let (team_id, target_user) = path.into_inner();
    team_scope(&state, &ctx, &session.user_id, &team_id, Some(Role::Admin))?;

    state
        .authz
        .remove_member(&team_id, &target_user, &session.user_id)
        .map_err(|e| ctx.core_err(e))?;
    Ok(ctx.ok_json(serde_json::json!({ "message": "Member removed" })))
}
