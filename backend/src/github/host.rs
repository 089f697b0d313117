use async_trait::async_trait;
use octocrab::Octocrab;
use octocrab::models::repos::Object;
use octocrab::params::repos::Reference;

use crate::digest::{Digest, blob_digest};
use crate::error::JobError;
use crate::readme::RenderConfig;

/// Canonical path for the generated document when none exists yet.
pub const DOCUMENT_PATH: &str = "README.md";
/// Optional per-repository configuration file at the repository root.
pub const CONFIG_PATH: &str = "readmebot.json";
/// The dedicated branch that stages generated-document changes.
pub const SYNC_BRANCH: &str = "readmebot";

const COMMIT_MESSAGE: &str = "Update README from crate documentation";
const PR_TITLE: &str = "readme: update from crate documentation";
const PR_BODY: &str =
    "This pull request keeps the README in sync with the crate documentation.";

/// The published document on a given branch, or its absence.
#[derive(Debug, Clone)]
pub struct RemoteDocument {
    /// Digest of the decoded content; `None` when no document exists on the
    /// branch (distinct from "present but empty").
    pub digest: Option<Digest>,
    /// Where the document lives; defaults to [`DOCUMENT_PATH`] when absent.
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct RepoMetadata {
    pub default_branch: String,
    pub private: bool,
    pub stars: u32,
}

/// Everything the job flow needs from the repository host.
///
/// The production implementation wraps an installation-authenticated octocrab
/// client; tests substitute an in-memory repository.
#[async_trait]
pub trait RepoHost: Send + Sync {
    async fn repo_metadata(&self, owner: &str, repo: &str) -> Result<RepoMetadata, JobError>;

    /// Sha of the commit a branch currently points at.
    async fn branch_tip(&self, owner: &str, repo: &str, branch: &str)
    -> Result<String, JobError>;

    /// Decoded content of a file, or `None` on 404.
    async fn read_file(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        branch: &str,
    ) -> Result<Option<String>, JobError>;

    /// The published document on `branch`; absence is a valid outcome, never
    /// an error.
    async fn read_document(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<RemoteDocument, JobError>;

    /// Creates `branch` at `base_sha` if it does not exist. An existing
    /// branch is left untouched; publishing reconciles its content.
    async fn ensure_branch(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        base_sha: &str,
    ) -> Result<bool, JobError>;

    /// Commits `content` to `path` on `branch`. `base` must be the digest of
    /// the document currently at the branch tip; `None` creates the file. A
    /// stale base is rejected by the host and surfaces as
    /// [`JobError::RemoteWrite`].
    async fn publish_document(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        path: &str,
        content: &[u8],
        base: Option<&Digest>,
    ) -> Result<(), JobError>;

    /// Finds the open pull request from `head` into `base`, or creates one.
    /// Returns the PR number and whether it was created by this call.
    async fn resolve_pull_request(
        &self,
        owner: &str,
        repo: &str,
        head: &str,
        base: &str,
    ) -> Result<(u64, bool), JobError>;

    /// Repository configuration from [`CONFIG_PATH`]; absent means defaults.
    async fn read_config(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<RenderConfig, JobError>;
}

/// [`RepoHost`] over an installation-authenticated GitHub client.
pub struct GithubHost {
    client: Octocrab,
}

impl GithubHost {
    pub fn new(client: Octocrab) -> Self {
        Self { client }
    }

    async fn fetch_content(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        branch: &str,
    ) -> Result<Option<octocrab::models::repos::Content>, JobError> {
        match self
            .client
            .repos(owner, repo)
            .get_content()
            .path(path)
            .r#ref(branch)
            .send()
            .await
        {
            Ok(contents) => Ok(contents.items.into_iter().next()),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(JobError::remote_read(err)),
        }
    }

    /// Finds a readme variant in the repository root when the canonical path
    /// is missing (e.g. `Readme.md`, `readme.markdown`).
    async fn find_document_path(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Option<String>, JobError> {
        let root = match self
            .client
            .repos(owner, repo)
            .get_content()
            .r#ref(branch)
            .send()
            .await
        {
            Ok(contents) => contents,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(JobError::remote_read(err)),
        };
        let mut candidates: Vec<String> = root
            .items
            .into_iter()
            .filter(|item| item.name.to_ascii_lowercase().starts_with("readme"))
            .map(|item| item.path)
            .collect();
        candidates.sort();
        Ok(candidates.into_iter().next())
    }
}

#[async_trait]
impl RepoHost for GithubHost {
    async fn repo_metadata(&self, owner: &str, repo: &str) -> Result<RepoMetadata, JobError> {
        let repository = self
            .client
            .repos(owner, repo)
            .get()
            .await
            .map_err(JobError::remote_read)?;
        Ok(RepoMetadata {
            default_branch: repository
                .default_branch
                .unwrap_or_else(|| "main".to_string()),
            private: repository.private.unwrap_or(false),
            stars: repository.stargazers_count.unwrap_or(0),
        })
    }

    async fn branch_tip(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<String, JobError> {
        let reference = self
            .client
            .repos(owner, repo)
            .get_ref(&Reference::Branch(branch.to_string()))
            .await
            .map_err(JobError::remote_read)?;
        match reference.object {
            Object::Commit { sha, .. } => Ok(sha),
            _ => Err(JobError::Decode),
        }
    }

    async fn read_file(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        branch: &str,
    ) -> Result<Option<String>, JobError> {
        match self.fetch_content(owner, repo, path, branch).await? {
            Some(content) => Ok(Some(content.decoded_content().ok_or(JobError::Decode)?)),
            None => Ok(None),
        }
    }

    async fn read_document(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<RemoteDocument, JobError> {
        let content = match self
            .fetch_content(owner, repo, DOCUMENT_PATH, branch)
            .await?
        {
            Some(content) => Some(content),
            None => match self.find_document_path(owner, repo, branch).await? {
                Some(path) => self.fetch_content(owner, repo, &path, branch).await?,
                None => None,
            },
        };
        match content {
            Some(content) => {
                let decoded = content.decoded_content().ok_or(JobError::Decode)?;
                Ok(RemoteDocument {
                    digest: Some(blob_digest(decoded.as_bytes())),
                    path: content.path,
                })
            }
            None => Ok(RemoteDocument {
                digest: None,
                path: DOCUMENT_PATH.to_string(),
            }),
        }
    }

    async fn ensure_branch(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        base_sha: &str,
    ) -> Result<bool, JobError> {
        let repos = self.client.repos(owner, repo);
        match repos.get_ref(&Reference::Branch(branch.to_string())).await {
            Ok(_) => Ok(false),
            Err(err) if is_not_found(&err) => {
                repos
                    .create_ref(&Reference::Branch(branch.to_string()), base_sha)
                    .await
                    .map_err(JobError::remote_write)?;
                Ok(true)
            }
            Err(err) => Err(JobError::remote_read(err)),
        }
    }

    async fn publish_document(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        path: &str,
        content: &[u8],
        base: Option<&Digest>,
    ) -> Result<(), JobError> {
        let repos = self.client.repos(owner, repo);
        match base {
            Some(digest) => {
                repos
                    .update_file(path, COMMIT_MESSAGE, content, digest.as_str())
                    .branch(branch)
                    .send()
                    .await
                    .map_err(JobError::remote_write)?;
            }
            None => {
                repos
                    .create_file(path, COMMIT_MESSAGE, content)
                    .branch(branch)
                    .send()
                    .await
                    .map_err(JobError::remote_write)?;
            }
        }
        Ok(())
    }

    async fn resolve_pull_request(
        &self,
        owner: &str,
        repo: &str,
        head: &str,
        base: &str,
    ) -> Result<(u64, bool), JobError> {
        let page = self
            .client
            .pulls(owner, repo)
            .list()
            .state(octocrab::params::State::Open)
            .base(base)
            .per_page(100)
            .send()
            .await
            .map_err(JobError::remote_read)?;

        let mut numbers: Vec<u64> = page
            .items
            .iter()
            .filter(|pr| pr.head.ref_field == head)
            .map(|pr| pr.number)
            .collect();
        numbers.sort_unstable();

        match numbers.as_slice() {
            [] => {
                let pr = self
                    .client
                    .pulls(owner, repo)
                    .create(PR_TITLE, head, base)
                    .body(PR_BODY)
                    .send()
                    .await
                    .map_err(JobError::remote_write)?;
                Ok((pr.number, true))
            }
            [number] => Ok((*number, false)),
            [number, ..] => {
                // Duplicate open PRs from the sync branch should not happen;
                // converge on the lowest number instead of adding another.
                tracing::warn!(
                    owner,
                    repo,
                    count = numbers.len(),
                    "multiple open pull requests from {head}, reusing #{number}"
                );
                Ok((*number, false))
            }
        }
    }

    async fn read_config(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<RenderConfig, JobError> {
        match self.fetch_content(owner, repo, CONFIG_PATH, branch).await? {
            None => Ok(RenderConfig::default()),
            Some(content) => {
                let text = content.decoded_content().ok_or(JobError::Decode)?;
                serde_json::from_str(&text).map_err(JobError::Config)
            }
        }
    }
}

fn is_not_found(err: &octocrab::Error) -> bool {
    matches!(err, octocrab::Error::GitHub { source, .. } if source.status_code.as_u16() == 404)
}
