use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

pub type Result<T, E = Report> = color_eyre::Result<T, E>;
pub struct Report(color_eyre::Report);

impl std::fmt::Debug for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl<E> From<E> for Report
where
    E: Into<color_eyre::Report>,
{
    #[track_caller]
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for Report {
    fn into_response(self) -> Response {
        let err = self.0;
        let err_string = format!("{err:?}");
        tracing::error!("{err_string}");
        (StatusCode::INTERNAL_SERVER_ERROR, Json(())).into_response()
    }
}

/// Why a job attempt failed.
///
/// Every failure a running attempt can hit is classified into one of these
/// before it is written to the terminal job record. Attempts never retry on
/// their own: remote-write conflicts and read failures self-correct on the
/// next trigger, which re-reads all remote state from scratch.
#[derive(Debug, Error)]
pub enum JobError {
    /// The repository's readmebot.json exists but does not parse.
    #[error("invalid readmebot.json: {0}")]
    Config(serde_json::Error),

    /// The document generator failed. Opaque and non-retryable within the
    /// attempt.
    #[error("readme generation failed: {0}")]
    Generate(String),

    /// A host lookup (document, branch, pull request, metadata) failed for a
    /// reason other than "not found".
    #[error("remote read failed: {0}")]
    RemoteRead(String),

    /// The host rejected a mutation: a stale base digest on publish or a ref
    /// creation race.
    #[error("remote write rejected: {0}")]
    RemoteWrite(String),

    /// The host returned a payload we could not decode.
    #[error("undecodable payload from repository host")]
    Decode,

    /// The whole-attempt wall-clock budget expired.
    #[error("job timed out after {0}s")]
    Timeout(u64),

    #[error("persistence failed: {0}")]
    Persistence(#[from] diesel::result::Error),

    #[error("connection pool failed: {0}")]
    Pool(#[from] diesel_async::pooled_connection::deadpool::PoolError),
}

impl JobError {
    pub fn remote_read(err: impl std::fmt::Display) -> Self {
        Self::RemoteRead(err.to_string())
    }

    pub fn remote_write(err: impl std::fmt::Display) -> Self {
        Self::RemoteWrite(err.to_string())
    }

    /// Debug detail for the job record, including the cause chain.
    pub fn detail(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            out.push_str(": ");
            out.push_str(&err.to_string());
            source = err.source();
        }
        out
    }
}
