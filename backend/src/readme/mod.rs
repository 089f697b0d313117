use async_trait::async_trait;
use eyre::OptionExt;
use serde::{Deserialize, Serialize};

use crate::github::host::RepoHost;

/// Per-repository rendering options, read from `readmebot.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenderConfig {
    /// Overrides the `# title` heading; defaults to the package name.
    pub title: Option<String>,
    /// Adds crates.io and docs.rs badges under the title.
    pub badges: bool,
    /// Suppresses the generated-by footer.
    pub skip_credits: bool,
}

/// Produces document bytes for a repository. Opaque to the orchestrator:
/// failures are non-retryable within an attempt.
#[async_trait]
pub trait DocumentGenerator: Send + Sync {
    async fn generate(
        &self,
        host: &dyn RepoHost,
        owner: &str,
        repo: &str,
        branch: &str,
        config: &RenderConfig,
    ) -> eyre::Result<Vec<u8>>;
}

/// Renders a README from the crate manifest and its `//!` crate docs.
pub struct CrateDocGenerator;

#[async_trait]
impl DocumentGenerator for CrateDocGenerator {
    async fn generate(
        &self,
        host: &dyn RepoHost,
        owner: &str,
        repo: &str,
        branch: &str,
        config: &RenderConfig,
    ) -> eyre::Result<Vec<u8>> {
        let manifest = host
            .read_file(owner, repo, "Cargo.toml", branch)
            .await?
            .ok_or_eyre("no Cargo.toml at the repository root")?;
        let meta = CrateMeta::parse(&manifest, repo)?;

        let source = match host.read_file(owner, repo, "src/lib.rs", branch).await? {
            Some(source) => Some(source),
            None => host.read_file(owner, repo, "src/main.rs", branch).await?,
        };
        let docs = source.as_deref().map(extract_crate_docs).unwrap_or_default();

        Ok(render(&meta, &docs, config).into_bytes())
    }
}

struct CrateMeta {
    name: String,
    description: Option<String>,
}

impl CrateMeta {
    fn parse(manifest: &str, fallback_name: &str) -> eyre::Result<Self> {
        let value: toml::Value = toml::from_str(manifest)?;
        let package = value.get("package");
        let name = package
            .and_then(|p| p.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or(fallback_name)
            .to_string();
        let description = package
            .and_then(|p| p.get("description"))
            .and_then(|d| d.as_str())
            .map(str::to_string);
        Ok(Self { name, description })
    }
}

/// Collects the `//!` inner doc comment lines of a source file.
fn extract_crate_docs(source: &str) -> String {
    let mut docs = String::new();
    for line in source.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("//!") {
            docs.push_str(rest.strip_prefix(' ').unwrap_or(rest));
            docs.push('\n');
        }
    }
    docs
}

fn render(meta: &CrateMeta, docs: &str, config: &RenderConfig) -> String {
    let title = config.title.as_deref().unwrap_or(&meta.name);
    let mut out = format!("# {title}\n\n");
    if config.badges {
        out.push_str(&format!(
            "[![crates.io](https://img.shields.io/crates/v/{name}.svg)](https://crates.io/crates/{name})\n\
             [![docs.rs](https://docs.rs/{name}/badge.svg)](https://docs.rs/{name})\n\n",
            name = meta.name
        ));
    }
    if let Some(description) = &meta.description {
        out.push_str(description);
        out.push_str("\n\n");
    }
    if !docs.is_empty() {
        out.push_str(docs.trim_end());
        out.push('\n');
    }
    out
}
