use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use eyre::{OptionExt, eyre};
use octocrab::models::webhook_events::payload::PullRequestWebhookEventAction;
use octocrab::models::webhook_events::{EventInstallation, WebhookEvent, WebhookEventPayload};
use utoipa_axum::{router::OpenApiRouter, routes};

use crate::config::AppState;
use crate::error::Result;
use crate::github::host::RepoHost;
use crate::job::model::Project;

fn verify_signature(body: &[u8], signature: &str, secret: &str) -> eyre::Result<()> {
    use hmac::{Hmac, Mac, digest::CtOutput};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;

    let signature = signature
        .strip_prefix("sha256=")
        .ok_or(eyre!("invalid signature format"))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
    mac.update(body);

    let signature_bytes = hex::decode(signature)?;
    let signature_array = hmac::digest::Output::<Sha256>::from_slice(&signature_bytes).to_owned();

    // Constant-time comparison via the hmac crate
    if mac.finalize() == CtOutput::new(signature_array) {
        Ok(())
    } else {
        Err(eyre!("invalid signature"))
    }
}

/// Resolves the repository state a sync job needs and starts it. `head_sha`
/// comes from the event when the event carries one; otherwise the default
/// branch tip is looked up.
async fn start_job(
    app_state: &AppState,
    install_id: i64,
    owner: &str,
    repo: &str,
    head_sha: Option<String>,
    trigger: &str,
) -> Result<()> {
    let host = app_state
        .installations
        .get(&app_state.github, install_id)
        .await?;
    let meta = host.repo_metadata(owner, repo).await?;
    let head_sha = match head_sha {
        Some(sha) => sha,
        None => host.branch_tip(owner, repo, &meta.default_branch).await?,
    };
    let project = Project::snapshot(install_id, owner, repo, &meta, &head_sha, trigger);
    let handle = app_state
        .runner
        .start(host, project, trigger.to_string())
        .await?;
    tracing::info!(job = handle.num, owner, repo, trigger, "queued sync job");
    Ok(())
}

#[utoipa::path(post, path = "/webhook", responses((status = OK, body = ())))]
#[tracing::instrument(skip_all)]
async fn webhook(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<()> {
    let event_name = headers
        .get("X-GitHub-Event")
        .map(|h| h.to_str().unwrap_or_default())
        .unwrap_or_default();
    let signature = headers
        .get("X-Hub-Signature-256")
        .map(|h| h.to_str().unwrap_or_default())
        .unwrap_or_default();

    verify_signature(&body, signature, &app_state.config.github.webhook_secret)?;

    let event: WebhookEvent = WebhookEvent::try_from_header_and_body(event_name, &body)?;

    let installation = event
        .installation
        .ok_or_eyre("could not get installation")?;
    let install_id = match &installation {
        EventInstallation::Full(installation) => installation.id.0 as i64,
        EventInstallation::Minimal(minimal) => minimal.id.0 as i64,
    };
    let sender = event.sender;
    let repository = event.repository;

    match event.specific {
        WebhookEventPayload::Push(push) => {
            let repository = repository.ok_or_eyre("push without repository")?;
            let owner = repository
                .owner
                .as_ref()
                .ok_or_eyre("push without owner")?
                .login
                .clone();
            let repo = repository.name.clone();

            let branch = push.r#ref.trim_start_matches("refs/heads/").to_string();
            if Some(branch.as_str()) != repository.default_branch.as_deref() {
                tracing::debug!(owner, repo, branch, "ignoring push to non-default branch");
                return Ok(());
            }
            // Our own README commits land on the sync branch, but the merge
            // commit back into the default branch is also ours; skip it.
            let bot = format!("{}[bot]", app_state.config.github.app_name);
            if sender.as_ref().is_some_and(|s| s.login == bot) {
                tracing::debug!(owner, repo, "ignoring push from our own app");
                return Ok(());
            }

            let trigger = format!("push to {branch}");
            start_job(&app_state, install_id, &owner, &repo, Some(push.after), &trigger).await?;
        }
        WebhookEventPayload::InstallationRepositories(payload) => {
            let account = match installation {
                EventInstallation::Full(installation) => installation.account,
                EventInstallation::Minimal(_) => {
                    return Err(eyre!("installation event without account").into());
                }
            };
            for repo in payload.repositories_added {
                start_job(
                    &app_state,
                    install_id,
                    &account.login,
                    &repo.name,
                    None,
                    "new installation",
                )
                .await?;
            }
        }
        WebhookEventPayload::PullRequest(pr) => {
            if !matches!(pr.action, PullRequestWebhookEventAction::Closed)
                || pr.pull_request.merged_at.is_none()
            {
                return Ok(());
            }
            let repository = repository.ok_or_eyre("pull request without repository")?;
            let owner = repository
                .owner
                .as_ref()
                .ok_or_eyre("pull request without owner")?
                .login
                .clone();
            let repo = repository.name.clone();
            if Some(pr.pull_request.base.ref_field.as_str()) != repository.default_branch.as_deref()
            {
                return Ok(());
            }
            let trigger = format!("PR#{} merged", pr.number);
            start_job(&app_state, install_id, &owner, &repo, None, &trigger).await?;
        }
        _ => {}
    }

    Ok(())
}

pub fn router() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().routes(routes!(webhook))
}
