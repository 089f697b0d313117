use axum::Json;
use axum::extract::{Path, State};
use utoipa_axum::{router::OpenApiRouter, routes};

use crate::config::AppState;
use crate::error::Result;

use super::model::{Job, Project};

/// List projects
///
/// Returns the most recently updated projects first.
#[utoipa::path(
    get,
    path = "/projects",
    responses(
        (status = 200, body = Vec<Project>)
    )
)]
async fn list_projects(State(app_state): State<AppState>) -> Result<Json<Vec<Project>>> {
    let conn = &mut app_state.pool.get().await?;
    let projects = Project::list(conn).await?;
    Ok(Json(projects))
}

/// List jobs for a repository
///
/// Returns the repository's jobs, newest first.
#[utoipa::path(
    get,
    path = "/projects/{owner}/{repo}/jobs",
    responses(
        (status = 200, body = Vec<Job>)
    ),
    params(
        ("owner" = String, Path, description = "Repository owner"),
        ("repo" = String, Path, description = "Repository name"),
    )
)]
async fn list_jobs(
    State(app_state): State<AppState>,
    Path((owner, repo)): Path<(String, String)>,
) -> Result<Json<Vec<Job>>> {
    let conn = &mut app_state.pool.get().await?;
    let jobs = Job::list_for_repo(conn, &owner, &repo).await?;
    Ok(Json(jobs))
}

pub fn router() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(list_projects))
        .routes(routes!(list_jobs))
}
