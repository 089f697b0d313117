use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::deserialize::{FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::prelude::*;
use diesel::serialize::ToSql;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use std::io::Write;
use strum_macros::{Display, EnumString};
use utoipa::ToSchema;

use crate::config::DbPool;
use crate::error::JobError;
use crate::github::host::RepoMetadata;
use crate::schema::{jobs, projects};

#[derive(
    Debug, Serialize, Deserialize, AsExpression, FromSqlRow, Display, EnumString, ToSchema, Clone,
    PartialEq, Eq,
)]
#[diesel(sql_type = diesel::sql_types::Text)]
pub enum JobStatus {
    Started,
    Success,
    Failed,
}

impl ToSql<diesel::sql_types::Text, diesel::pg::Pg> for JobStatus {
    fn to_sql(
        &self,
        out: &mut diesel::serialize::Output<diesel::pg::Pg>,
    ) -> diesel::serialize::Result {
        out.write_all(self.to_string().as_bytes())?;
        Ok(diesel::serialize::IsNull::No)
    }
}

impl FromSql<diesel::sql_types::Text, diesel::pg::Pg> for JobStatus {
    fn from_sql(bytes: diesel::pg::PgValue<'_>) -> diesel::deserialize::Result<Self> {
        let string = <String as FromSql<diesel::sql_types::Text, diesel::pg::Pg>>::from_sql(bytes)?;
        string.parse().map_err(|_| "Unrecognized job status".into())
    }
}

/// The converged "current status" of a repository's integration. One row per
/// (owner, repo); always reflects the highest-numbered job that wrote it.
#[derive(
    Debug,
    Clone,
    Queryable,
    Selectable,
    Identifiable,
    Insertable,
    AsChangeset,
    Serialize,
    Deserialize,
    ToSchema,
)]
#[diesel(table_name = projects, primary_key(owner, repo))]
pub struct Project {
    pub owner: String,
    pub repo: String,
    pub install_id: i64,
    pub last_job: i32,
    pub head_sha: String,
    pub pr_number: i32,
    pub message: String,
    pub status: JobStatus,
    pub default_branch: String,
    pub private: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn snapshot(
        install_id: i64,
        owner: &str,
        repo: &str,
        meta: &RepoMetadata,
        head_sha: &str,
        message: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            install_id,
            last_job: 0,
            head_sha: head_sha.to_string(),
            pr_number: 0,
            message: message.to_string(),
            status: JobStatus::Started,
            default_branch: meta.default_branch.clone(),
            private: meta.private,
            created_at: now,
            updated_at: now,
        }
    }

    pub async fn list(conn: &mut AsyncPgConnection) -> QueryResult<Vec<Self>> {
        projects::table
            .order_by(projects::updated_at.desc())
            .limit(100)
            .select(Project::as_select())
            .load(conn)
            .await
    }
}

/// One attempt of the sync workflow. Append-mostly: created in `Started`,
/// updated exactly once to a terminal status, never deleted.
#[derive(
    Debug,
    Clone,
    Queryable,
    Selectable,
    Identifiable,
    Insertable,
    Serialize,
    Deserialize,
    ToSchema,
)]
#[diesel(table_name = jobs, primary_key(owner, repo, num))]
pub struct Job {
    pub owner: String,
    pub repo: String,
    pub num: i32,
    pub install_id: i64,
    pub trigger: String,
    pub head_sha: String,
    pub pr_number: i32,
    pub message: String,
    pub status: JobStatus,
    pub default_branch: String,
    pub private: bool,
    pub duration_ms: i64,
    pub debug: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn from_snapshot(project: &Project, num: i32, trigger: &str) -> Self {
        let now = Utc::now();
        Self {
            owner: project.owner.clone(),
            repo: project.repo.clone(),
            num,
            install_id: project.install_id,
            trigger: trigger.to_string(),
            head_sha: project.head_sha.clone(),
            pr_number: project.pr_number,
            message: project.message.clone(),
            status: JobStatus::Started,
            default_branch: project.default_branch.clone(),
            private: project.private,
            duration_ms: 0,
            debug: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The project snapshot this job proposes during reconciliation.
    pub fn as_project(&self) -> Project {
        Project {
            owner: self.owner.clone(),
            repo: self.repo.clone(),
            install_id: self.install_id,
            last_job: self.num,
            head_sha: self.head_sha.clone(),
            pr_number: self.pr_number,
            message: self.message.clone(),
            status: self.status.clone(),
            default_branch: self.default_branch.clone(),
            private: self.private,
            created_at: self.created_at,
            updated_at: Utc::now(),
        }
    }

    pub fn slug(&self) -> String {
        format!("{}/{}#{}", self.owner, self.repo, self.num)
    }

    pub async fn list_for_repo(
        conn: &mut AsyncPgConnection,
        owner: &str,
        repo: &str,
    ) -> QueryResult<Vec<Self>> {
        jobs::table
            .filter(jobs::owner.eq(owner))
            .filter(jobs::repo.eq(repo))
            .order_by(jobs::num.desc())
            .limit(50)
            .select(Job::as_select())
            .load(conn)
            .await
    }
}

/// Durable job/project records. The orchestrator only talks to this trait;
/// tests substitute an in-memory store with the same transactional rules.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Allocates the next job number for the project's repository and writes
    /// the `Started` job together with the initiating project snapshot in one
    /// transaction.
    async fn create(&self, project: Project, trigger: &str) -> Result<Job, JobError>;

    /// Writes the terminal state of a job. Only `Started` rows are updated;
    /// terminal rows are immutable.
    async fn finish(&self, job: &Job) -> Result<(), JobError>;

    /// Last-writer-wins project reconciliation: upserts the job's snapshot
    /// unless a higher-numbered job already wrote the row. Returns whether
    /// the write happened.
    async fn reconcile(&self, job: &Job) -> Result<bool, JobError>;
}

pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn create(&self, project: Project, trigger: &str) -> Result<Job, JobError> {
        let conn = &mut self.pool.get().await?;
        let trigger = trigger.to_string();
        let job = conn
            .build_transaction()
            .run::<_, diesel::result::Error, _>(|conn| {
                Box::pin(async move {
                    // The upsert takes the project row lock, which serializes
                    // number allocation per repository.
                    diesel::insert_into(projects::table)
                        .values(&project)
                        .on_conflict((projects::owner, projects::repo))
                        .do_update()
                        .set(&project)
                        .execute(conn)
                        .await?;

                    let max: Option<i32> = jobs::table
                        .filter(jobs::owner.eq(&project.owner))
                        .filter(jobs::repo.eq(&project.repo))
                        .select(diesel::dsl::max(jobs::num))
                        .first(conn)
                        .await?;
                    let num = max.unwrap_or(0) + 1;

                    diesel::update(
                        projects::table.find((project.owner.clone(), project.repo.clone())),
                    )
                    .set(projects::last_job.eq(num))
                    .execute(conn)
                    .await?;

                    let job = Job::from_snapshot(&project, num, &trigger);
                    diesel::insert_into(jobs::table)
                        .values(&job)
                        .execute(conn)
                        .await?;
                    Ok(job)
                })
            })
            .await?;
        Ok(job)
    }

    async fn finish(&self, job: &Job) -> Result<(), JobError> {
        let conn = &mut self.pool.get().await?;
        diesel::update(jobs::table.find((job.owner.clone(), job.repo.clone(), job.num)))
            .filter(jobs::status.eq(JobStatus::Started))
            .set((
                jobs::status.eq(job.status.clone()),
                jobs::message.eq(job.message.clone()),
                jobs::pr_number.eq(job.pr_number),
                jobs::duration_ms.eq(job.duration_ms),
                jobs::debug.eq(job.debug.clone()),
                jobs::updated_at.eq(Utc::now()),
            ))
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn reconcile(&self, job: &Job) -> Result<bool, JobError> {
        let conn = &mut self.pool.get().await?;
        let project = job.as_project();
        let num = job.num;
        let updated = conn
            .build_transaction()
            .run::<_, diesel::result::Error, _>(|conn| {
                Box::pin(async move {
                    let current: Option<Project> = projects::table
                        .find((project.owner.clone(), project.repo.clone()))
                        .for_update()
                        .select(Project::as_select())
                        .first(conn)
                        .await
                        .optional()?;
                    if let Some(current) = current {
                        if current.last_job > num {
                            return Ok(false);
                        }
                    }
                    diesel::insert_into(projects::table)
                        .values(&project)
                        .on_conflict((projects::owner, projects::repo))
                        .do_update()
                        .set(&project)
                        .execute(conn)
                        .await?;
                    Ok(true)
                })
            })
            .await?;
        Ok(updated)
    }
}
