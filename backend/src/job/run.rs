use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::Instrument;

use crate::digest::{blob_digest, short_sha};
use crate::error::JobError;
use crate::github::host::{RepoHost, SYNC_BRANCH};
use crate::readme::DocumentGenerator;

use super::model::{Job, JobStatus, JobStore, Project};

const CREDITS: &str =
    "\n---\n*README generated by [readmebot](https://github.com/apps/readmebot).*\n";

/// Runs sync jobs: one spawned task per attempt, bounded by a deadline,
/// finishing with a terminal job write and a project reconciliation.
#[derive(Clone)]
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    generator: Arc<dyn DocumentGenerator>,
    timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub message: String,
}

/// Returned by [`JobRunner::start`] once the job row is durable. The attempt
/// itself runs in the background; `done` resolves when it reaches a terminal
/// status.
pub struct JobHandle {
    pub num: i32,
    pub done: oneshot::Receiver<JobOutcome>,
}

struct Failure {
    message: String,
    error: JobError,
}

impl Failure {
    fn new(message: impl Into<String>, error: JobError) -> Self {
        Self {
            message: message.into(),
            error,
        }
    }
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        generator: Arc<dyn DocumentGenerator>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            generator,
            timeout,
        }
    }

    /// Records the job and spawns its attempt. Returns as soon as the
    /// `Started` row is committed, so a crash after this point still leaves
    /// an auditable record.
    pub async fn start(
        &self,
        host: Arc<dyn RepoHost>,
        project: Project,
        trigger: String,
    ) -> Result<JobHandle, JobError> {
        let job = self.store.create(project, &trigger).await?;
        let num = job.num;
        let span = tracing::info_span!("job", id = %job.slug(), sha = short_sha(&job.head_sha));
        let (tx, rx) = oneshot::channel();
        let runner = self.clone();
        tokio::spawn(
            async move {
                runner.run(host, job, tx).await;
            }
            .instrument(span),
        );
        Ok(JobHandle { num, done: rx })
    }

    async fn run(&self, host: Arc<dyn RepoHost>, mut job: Job, tx: oneshot::Sender<JobOutcome>) {
        let started = Instant::now();
        tracing::info!(trigger = %job.trigger, "starting sync job");

        let result = tokio::time::timeout(self.timeout, self.attempt(host.as_ref(), &mut job)).await;
        let (status, message, debug) = match result {
            Ok(Ok(message)) => {
                tracing::info!("{message}");
                (JobStatus::Success, message, None)
            }
            Ok(Err(failure)) => {
                tracing::error!(error = %failure.error.detail(), "{}", failure.message);
                (
                    JobStatus::Failed,
                    failure.message,
                    Some(failure.error.detail()),
                )
            }
            Err(_) => {
                let error = JobError::Timeout(self.timeout.as_secs());
                tracing::error!("{error}");
                (JobStatus::Failed, "job timed out".to_string(), Some(error.detail()))
            }
        };

        job.status = status.clone();
        job.message = message.clone();
        job.debug = debug;
        job.duration_ms = started.elapsed().as_millis() as i64;

        if let Err(err) = self.store.finish(&job).await {
            tracing::error!(error = %err.detail(), "failed saving finished job");
        }
        match self.store.reconcile(&job).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!("skipping project update, a newer job already finished");
            }
            Err(err) => tracing::error!(error = %err.detail(), "failed saving project"),
        }

        let _ = tx.send(JobOutcome { status, message });
    }

    async fn attempt(&self, host: &dyn RepoHost, job: &mut Job) -> Result<String, Failure> {
        let config = host
            .read_config(&job.owner, &job.repo, &job.default_branch)
            .await
            .map_err(|e| Failure::new("failed reading readmebot.json", e))?;

        let mut content = self
            .generator
            .generate(host, &job.owner, &job.repo, &job.default_branch, &config)
            .await
            .map_err(|e| {
                Failure::new("failed generating README", JobError::Generate(e.to_string()))
            })?;
        if !config.skip_credits {
            content.extend_from_slice(CREDITS.as_bytes());
        }
        let new_digest = blob_digest(&content);

        let published = host
            .read_document(&job.owner, &job.repo, &job.default_branch)
            .await
            .map_err(|e| Failure::new("failed reading published README", e))?;
        if published.digest.as_ref() == Some(&new_digest) {
            return Ok(format!("README on {} is up to date", job.default_branch));
        }

        let created = host
            .ensure_branch(&job.owner, &job.repo, SYNC_BRANCH, &job.head_sha)
            .await
            .map_err(|e| Failure::new("failed ensuring sync branch", e))?;
        if created {
            tracing::info!("created branch {SYNC_BRANCH} at {}", short_sha(&job.head_sha));
        } else {
            tracing::info!("reusing existing branch {SYNC_BRANCH}");
        }

        // The document at the branch tip is the required commit base: for a
        // branch created just now that is the default branch's document, for
        // a pre-existing branch its own tip.
        let tip = host
            .read_document(&job.owner, &job.repo, SYNC_BRANCH)
            .await
            .map_err(|e| Failure::new("failed reading sync branch README", e))?;
        if tip.digest.as_ref() == Some(&new_digest) {
            tracing::info!("README on {SYNC_BRANCH} is current, making sure a PR is open");
        }

        host.publish_document(
            &job.owner,
            &job.repo,
            SYNC_BRANCH,
            &published.path,
            &content,
            tip.digest.as_ref(),
        )
        .await
        .map_err(|e| Failure::new("failed publishing README", e))?;

        let (number, created_pr) = host
            .resolve_pull_request(&job.owner, &job.repo, SYNC_BRANCH, &job.default_branch)
            .await
            .map_err(|e| Failure::new("failed resolving pull request", e))?;
        job.pr_number = number as i32;

        Ok(if created_pr {
            format!("created PR #{number}")
        } else {
            format!("updated PR #{number}")
        })
    }
}
