use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::digest::{Digest, blob_digest};
use crate::error::JobError;
use crate::github::host::{DOCUMENT_PATH, RemoteDocument, RepoHost, RepoMetadata, SYNC_BRANCH};
use crate::readme::{DocumentGenerator, RenderConfig};

use super::model::{Job, JobStatus, JobStore, Project};
use super::run::{JobOutcome, JobRunner};

const OWNER: &str = "octocat";
const REPO: &str = "widget";
const HEAD: &str = "1111111111111111111111111111111111111111";

#[derive(Default)]
struct MemState {
    jobs: Vec<Job>,
    projects: HashMap<(String, String), Project>,
}

/// In-memory store with the same transactional rules as the database one:
/// numbering serialized per repository, write-once terminal jobs,
/// last-writer-wins project reconciliation.
#[derive(Default)]
struct MemStore {
    state: Mutex<MemState>,
}

impl MemStore {
    fn project(&self, owner: &str, repo: &str) -> Option<Project> {
        self.state
            .lock()
            .unwrap()
            .projects
            .get(&(owner.to_string(), repo.to_string()))
            .cloned()
    }

    fn job(&self, owner: &str, repo: &str, num: i32) -> Option<Job> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .iter()
            .find(|j| j.owner == owner && j.repo == repo && j.num == num)
            .cloned()
    }
}

#[async_trait]
impl JobStore for MemStore {
    async fn create(&self, mut project: Project, trigger: &str) -> Result<Job, JobError> {
        let mut state = self.state.lock().unwrap();
        let max = state
            .jobs
            .iter()
            .filter(|j| j.owner == project.owner && j.repo == project.repo)
            .map(|j| j.num)
            .max()
            .unwrap_or(0);
        let num = max + 1;
        project.last_job = num;
        let job = Job::from_snapshot(&project, num, trigger);
        state
            .projects
            .insert((project.owner.clone(), project.repo.clone()), project);
        state.jobs.push(job.clone());
        Ok(job)
    }

    async fn finish(&self, job: &Job) -> Result<(), JobError> {
        let mut state = self.state.lock().unwrap();
        if let Some(stored) = state
            .jobs
            .iter_mut()
            .find(|j| j.owner == job.owner && j.repo == job.repo && j.num == job.num)
        {
            if stored.status == JobStatus::Started {
                *stored = job.clone();
            }
        }
        Ok(())
    }

    async fn reconcile(&self, job: &Job) -> Result<bool, JobError> {
        let mut state = self.state.lock().unwrap();
        let key = (job.owner.clone(), job.repo.clone());
        if let Some(current) = state.projects.get(&key) {
            if current.last_job > job.num {
                return Ok(false);
            }
        }
        state.projects.insert(key, job.as_project());
        Ok(true)
    }
}

#[derive(Debug, Clone)]
struct PublishCall {
    branch: String,
    path: String,
    base: Option<Digest>,
    content: String,
}

struct HostState {
    default_branch: String,
    branches: HashMap<String, String>,
    documents: HashMap<String, String>,
    config: Option<String>,
    prs: Vec<(u64, String, String)>,
    next_pr: u64,
    published: Vec<PublishCall>,
}

/// In-memory repository: branches, per-branch documents and open PRs, with
/// the compare-and-swap publish semantics of the real host.
struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    fn new(default_doc: Option<&str>) -> Self {
        let mut branches = HashMap::new();
        branches.insert("main".to_string(), HEAD.to_string());
        let mut documents = HashMap::new();
        if let Some(doc) = default_doc {
            documents.insert("main".to_string(), doc.to_string());
        }
        Self {
            state: Mutex::new(HostState {
                default_branch: "main".to_string(),
                branches,
                documents,
                config: None,
                prs: Vec::new(),
                next_pr: 1,
                published: Vec::new(),
            }),
        }
    }

    fn set_config(&self, json: &str) {
        self.state.lock().unwrap().config = Some(json.to_string());
    }

    fn add_branch(&self, name: &str, sha: &str, doc: &str) {
        let mut state = self.state.lock().unwrap();
        state.branches.insert(name.to_string(), sha.to_string());
        state.documents.insert(name.to_string(), doc.to_string());
    }

    fn published(&self) -> Vec<PublishCall> {
        self.state.lock().unwrap().published.clone()
    }

    fn open_prs(&self) -> usize {
        self.state.lock().unwrap().prs.len()
    }

    fn branch_sha(&self, branch: &str) -> Option<String> {
        self.state.lock().unwrap().branches.get(branch).cloned()
    }

    fn document(&self, branch: &str) -> Option<String> {
        self.state.lock().unwrap().documents.get(branch).cloned()
    }
}

#[async_trait]
impl RepoHost for FakeHost {
    async fn repo_metadata(&self, _owner: &str, _repo: &str) -> Result<RepoMetadata, JobError> {
        Ok(RepoMetadata {
            default_branch: self.state.lock().unwrap().default_branch.clone(),
            private: false,
            stars: 0,
        })
    }

    async fn branch_tip(
        &self,
        _owner: &str,
        _repo: &str,
        branch: &str,
    ) -> Result<String, JobError> {
        self.state
            .lock()
            .unwrap()
            .branches
            .get(branch)
            .cloned()
            .ok_or_else(|| JobError::remote_read(format!("no branch {branch}")))
    }

    async fn read_file(
        &self,
        _owner: &str,
        _repo: &str,
        _path: &str,
        _branch: &str,
    ) -> Result<Option<String>, JobError> {
        Ok(None)
    }

    async fn read_document(
        &self,
        _owner: &str,
        _repo: &str,
        branch: &str,
    ) -> Result<RemoteDocument, JobError> {
        let state = self.state.lock().unwrap();
        Ok(RemoteDocument {
            digest: state
                .documents
                .get(branch)
                .map(|doc| blob_digest(doc.as_bytes())),
            path: DOCUMENT_PATH.to_string(),
        })
    }

    async fn ensure_branch(
        &self,
        _owner: &str,
        _repo: &str,
        branch: &str,
        base_sha: &str,
    ) -> Result<bool, JobError> {
        let mut state = self.state.lock().unwrap();
        if state.branches.contains_key(branch) {
            return Ok(false);
        }
        state
            .branches
            .insert(branch.to_string(), base_sha.to_string());
        // Branching copies the tree, so the new branch starts with the
        // default branch's document.
        let inherited = state.documents.get(&state.default_branch).cloned();
        if let Some(doc) = inherited {
            state.documents.insert(branch.to_string(), doc);
        }
        Ok(true)
    }

    async fn publish_document(
        &self,
        _owner: &str,
        _repo: &str,
        branch: &str,
        path: &str,
        content: &[u8],
        base: Option<&Digest>,
    ) -> Result<(), JobError> {
        let mut state = self.state.lock().unwrap();
        let current = state
            .documents
            .get(branch)
            .map(|doc| blob_digest(doc.as_bytes()));
        if current.as_ref() != base {
            return Err(JobError::remote_write("stale base digest"));
        }
        let content = String::from_utf8(content.to_vec()).map_err(|_| JobError::Decode)?;
        state.published.push(PublishCall {
            branch: branch.to_string(),
            path: path.to_string(),
            base: base.cloned(),
            content: content.clone(),
        });
        state.documents.insert(branch.to_string(), content);
        Ok(())
    }

    async fn resolve_pull_request(
        &self,
        _owner: &str,
        _repo: &str,
        head: &str,
        base: &str,
    ) -> Result<(u64, bool), JobError> {
        // List-then-create under one lock, like the serialized remote calls.
        let mut state = self.state.lock().unwrap();
        let existing = state
            .prs
            .iter()
            .filter(|(_, h, b)| h == head && b == base)
            .map(|(n, _, _)| *n)
            .min();
        if let Some(number) = existing {
            return Ok((number, false));
        }
        let number = state.next_pr;
        state.next_pr += 1;
        state.prs.push((number, head.to_string(), base.to_string()));
        Ok((number, true))
    }

    async fn read_config(
        &self,
        _owner: &str,
        _repo: &str,
        _branch: &str,
    ) -> Result<RenderConfig, JobError> {
        match &self.state.lock().unwrap().config {
            None => Ok(RenderConfig::default()),
            Some(json) => serde_json::from_str(json).map_err(JobError::Config),
        }
    }
}

struct FakeGenerator {
    output: Vec<u8>,
}

impl FakeGenerator {
    fn new(output: &str) -> Self {
        Self {
            output: output.as_bytes().to_vec(),
        }
    }
}

#[async_trait]
impl DocumentGenerator for FakeGenerator {
    async fn generate(
        &self,
        _host: &dyn RepoHost,
        _owner: &str,
        _repo: &str,
        _branch: &str,
        _config: &RenderConfig,
    ) -> eyre::Result<Vec<u8>> {
        Ok(self.output.clone())
    }
}

struct HangingGenerator;

#[async_trait]
impl DocumentGenerator for HangingGenerator {
    async fn generate(
        &self,
        _host: &dyn RepoHost,
        _owner: &str,
        _repo: &str,
        _branch: &str,
        _config: &RenderConfig,
    ) -> eyre::Result<Vec<u8>> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Vec::new())
    }
}

fn runner(store: Arc<MemStore>, generator: Arc<dyn DocumentGenerator>) -> JobRunner {
    JobRunner::new(store, generator, Duration::from_secs(30))
}

async fn run_job(runner: &JobRunner, host: &Arc<FakeHost>) -> (i32, JobOutcome) {
    let meta = RepoMetadata {
        default_branch: "main".to_string(),
        private: false,
        stars: 0,
    };
    let project = Project::snapshot(1, OWNER, REPO, &meta, HEAD, "test");
    let handle = runner
        .start(host.clone(), project, "test".to_string())
        .await
        .unwrap();
    let outcome = handle.done.await.unwrap();
    (handle.num, outcome)
}

#[tokio::test]
async fn skips_publishing_when_the_readme_is_current() {
    let host = Arc::new(FakeHost::new(Some("# widget\n")));
    host.set_config(r#"{"skip_credits": true}"#);
    let store = Arc::new(MemStore::default());
    let runner = runner(store.clone(), Arc::new(FakeGenerator::new("# widget\n")));

    let (num, outcome) = run_job(&runner, &host).await;

    assert_eq!(outcome.status, JobStatus::Success);
    assert!(outcome.message.contains("up to date"), "{}", outcome.message);
    assert!(host.published().is_empty());
    assert_eq!(host.open_prs(), 0);
    assert!(host.branch_sha(SYNC_BRANCH).is_none());

    let job = store.job(OWNER, REPO, num).unwrap();
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.pr_number, 0);

    // A retriggered job converges to the same skip.
    let (_, outcome) = run_job(&runner, &host).await;
    assert_eq!(outcome.status, JobStatus::Success);
    assert!(host.published().is_empty());
}

#[tokio::test]
async fn a_new_branch_commits_against_the_default_branch_document() {
    let host = Arc::new(FakeHost::new(Some("old\n")));
    host.set_config(r#"{"skip_credits": true}"#);
    let store = Arc::new(MemStore::default());
    let runner = runner(store.clone(), Arc::new(FakeGenerator::new("new\n")));

    let (num, outcome) = run_job(&runner, &host).await;

    assert_eq!(outcome.status, JobStatus::Success);
    assert_eq!(outcome.message, "created PR #1");
    assert_eq!(host.branch_sha(SYNC_BRANCH).as_deref(), Some(HEAD));

    let published = host.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].branch, SYNC_BRANCH);
    assert_eq!(published[0].path, DOCUMENT_PATH);
    assert_eq!(published[0].base, Some(blob_digest(b"old\n")));
    assert_eq!(host.document(SYNC_BRANCH).as_deref(), Some("new\n"));

    let job = store.job(OWNER, REPO, num).unwrap();
    assert_eq!(job.pr_number, 1);
    let project = store.project(OWNER, REPO).unwrap();
    assert_eq!(project.last_job, num);
    assert_eq!(project.status, JobStatus::Success);
}

#[tokio::test]
async fn an_existing_branch_commits_against_its_own_tip() {
    let host = Arc::new(FakeHost::new(Some("old\n")));
    host.set_config(r#"{"skip_credits": true}"#);
    host.add_branch(SYNC_BRANCH, "2222222222222222222222222222222222222222", "stale\n");
    let store = Arc::new(MemStore::default());
    let runner = runner(store, Arc::new(FakeGenerator::new("new\n")));

    let (_, outcome) = run_job(&runner, &host).await;

    assert_eq!(outcome.status, JobStatus::Success);
    let published = host.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].base, Some(blob_digest(b"stale\n")));
    // The branch is left where it was, only its document moves.
    assert_eq!(
        host.branch_sha(SYNC_BRANCH).as_deref(),
        Some("2222222222222222222222222222222222222222")
    );
}

#[tokio::test]
async fn an_up_to_date_branch_tip_still_converges_on_a_pull_request() {
    let host = Arc::new(FakeHost::new(Some("old\n")));
    host.set_config(r#"{"skip_credits": true}"#);
    let store = Arc::new(MemStore::default());
    let runner = runner(store, Arc::new(FakeGenerator::new("new\n")));

    let (_, first) = run_job(&runner, &host).await;
    assert_eq!(first.message, "created PR #1");

    // The sync branch now already holds the generated content; a second job
    // must not skip the PR step.
    let (_, second) = run_job(&runner, &host).await;
    assert_eq!(second.status, JobStatus::Success);
    assert_eq!(second.message, "updated PR #1");
    assert_eq!(host.open_prs(), 1);
    assert_eq!(host.published().len(), 2);
}

#[tokio::test]
async fn concurrent_jobs_converge_on_one_pull_request() {
    let host = Arc::new(FakeHost::new(Some("old\n")));
    host.set_config(r#"{"skip_credits": true}"#);
    let store = Arc::new(MemStore::default());
    let runner = runner(store, Arc::new(FakeGenerator::new("new\n")));

    let (a, b, c, d) = tokio::join!(
        run_job(&runner, &host),
        run_job(&runner, &host),
        run_job(&runner, &host),
        run_job(&runner, &host),
    );
    for (_, outcome) in [a, b, c, d] {
        assert_eq!(outcome.status, JobStatus::Success);
    }
    assert_eq!(host.open_prs(), 1);
}

#[tokio::test]
async fn job_numbers_are_dense_and_unique() {
    let host = Arc::new(FakeHost::new(Some("old\n")));
    host.set_config(r#"{"skip_credits": true}"#);
    let store = Arc::new(MemStore::default());
    let runner = runner(store, Arc::new(FakeGenerator::new("new\n")));

    let (a, b, c, d, e) = tokio::join!(
        run_job(&runner, &host),
        run_job(&runner, &host),
        run_job(&runner, &host),
        run_job(&runner, &host),
        run_job(&runner, &host),
    );
    let mut nums = vec![a.0, b.0, c.0, d.0, e.0];
    nums.sort_unstable();
    assert_eq!(nums, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn an_older_job_never_overwrites_a_newer_project_snapshot() {
    let store = MemStore::default();
    let meta = RepoMetadata {
        default_branch: "main".to_string(),
        private: false,
        stars: 0,
    };
    let snapshot = Project::snapshot(1, OWNER, REPO, &meta, HEAD, "test");

    let mut job1 = store.create(snapshot.clone(), "test").await.unwrap();
    let mut job2 = store.create(snapshot, "test").await.unwrap();

    job2.status = JobStatus::Success;
    job2.message = "created PR #1".to_string();
    assert!(store.reconcile(&job2).await.unwrap());

    job1.status = JobStatus::Failed;
    job1.message = "failed publishing README".to_string();
    assert!(!store.reconcile(&job1).await.unwrap());

    let project = store.project(OWNER, REPO).unwrap();
    assert_eq!(project.last_job, job2.num);
    assert_eq!(project.status, JobStatus::Success);
    assert_eq!(project.message, "created PR #1");
}

#[tokio::test(start_paused = true)]
async fn a_stuck_attempt_fails_with_a_timeout() {
    let host = Arc::new(FakeHost::new(Some("old\n")));
    let store = Arc::new(MemStore::default());
    let runner = JobRunner::new(store.clone(), Arc::new(HangingGenerator), Duration::from_secs(5));

    let (num, outcome) = run_job(&runner, &host).await;

    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.message, "job timed out");
    assert!(host.published().is_empty());
    assert_eq!(host.open_prs(), 0);

    let job = store.job(OWNER, REPO, num).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.debug.unwrap().contains("timed out"));
}

#[tokio::test]
async fn an_invalid_repo_config_fails_the_job() {
    let host = Arc::new(FakeHost::new(Some("old\n")));
    host.set_config(r#"{"unknown_option": true}"#);
    let store = Arc::new(MemStore::default());
    let runner = runner(store.clone(), Arc::new(FakeGenerator::new("new\n")));

    let (num, outcome) = run_job(&runner, &host).await;

    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.message, "failed reading readmebot.json");
    assert!(host.published().is_empty());
    let job = store.job(OWNER, REPO, num).unwrap();
    assert!(job.debug.unwrap().contains("readmebot.json"));
}

#[tokio::test]
async fn appends_the_credits_footer_by_default() {
    let host = Arc::new(FakeHost::new(Some("old\n")));
    let store = Arc::new(MemStore::default());
    let runner = runner(store, Arc::new(FakeGenerator::new("# widget\n")));

    let (_, outcome) = run_job(&runner, &host).await;

    assert_eq!(outcome.status, JobStatus::Success);
    let published = host.published();
    assert_eq!(published.len(), 1);
    assert!(published[0].content.starts_with("# widget\n"));
    assert!(published[0].content.contains("generated by [readmebot]"));
}
