use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, trace};
use url::Url;

use crate::{
    config::RelayConfig,
    forwarder::{ForwardError, Forwarder},
    github::{FetchError, FileStatus, GitHubClient, PullRequestFile},
    webhooks::github::events::PullRequestEvent,
};

/// Body POSTed to the downstream analysis API.
#[derive(Debug, Serialize)]
pub struct OutboundPayload {
    pub action: String,
    /// `X-GitHub-Delivery` of the webhook, stable across redeliveries of the same event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
    pub repository: RepositoryInfo,
    pub pull_request: PullRequestInfo,
    pub files: Vec<ChangedFile>,
}

#[derive(Debug, Serialize)]
pub struct RepositoryInfo {
    pub owner: String,
    pub name: String,
    pub full_name: String,
}

#[derive(Debug, Serialize)]
pub struct PullRequestInfo {
    pub number: u64,
    pub title: String,
    pub description: Option<String>,
    pub author: String,
    pub source_branch: String,
    pub target_branch: String,
    pub head_sha: String,
    pub url: Url,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ChangedFile {
    pub filename: String,
    pub status: FileStatus,
    pub additions: u64,
    pub deletions: u64,
    pub changes: u64,
    pub patch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_filename: Option<String>,
    /// `None` when the content couldn't be fetched or the file was removed.
    pub content: Option<String>,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to list pull request files: {0}")]
    Fetch(#[from] FetchError),

    #[error("failed to forward payload: {0}")]
    Forward(#[from] ForwardError),
}

/// Summary of a pull request that made it to the downstream API.
#[derive(Debug)]
pub struct RelayReport {
    pub files: usize,
    pub downstream_status: u16,
}

/// Builds the outbound payload. `files` must already be in listing order.
pub fn assemble(
    event: &PullRequestEvent,
    delivery_id: Option<String>,
    files: Vec<(PullRequestFile, Option<String>)>,
) -> OutboundPayload {
    let repository = &event.repository;
    let pull_request = &event.pull_request;

    OutboundPayload {
        action: event.action.clone(),
        delivery_id,
        repository: RepositoryInfo {
            owner: repository.owner.login.clone(),
            name: repository.name.clone(),
            full_name: repository.full_name.clone(),
        },
        pull_request: PullRequestInfo {
            number: pull_request.number,
            title: pull_request.title.clone(),
            description: pull_request.body.clone(),
            author: pull_request.user.login.clone(),
            source_branch: pull_request.head.r#ref.clone(),
            target_branch: pull_request.base.r#ref.clone(),
            head_sha: pull_request.head.sha.clone(),
            url: pull_request.html_url.clone(),
            created_at: pull_request.created_at,
            updated_at: pull_request.updated_at,
        },
        files: files
            .into_iter()
            .map(|(file, content)| ChangedFile {
                filename: file.filename,
                status: file.status,
                additions: file.additions,
                deletions: file.deletions,
                changes: file.changes,
                patch: file.patch,
                previous_filename: file.previous_filename,
                content,
            })
            .collect(),
    }
}

/// Fetches the content of every file at `sha`, at most `concurrency` at a time.
///
/// Results come back in the order of `files` whatever order the requests complete in. Removed
/// files have nothing to fetch and get no content.
pub async fn fetch_contents(
    github: &GitHubClient,
    owner: &str,
    repo: &str,
    sha: &str,
    files: Vec<PullRequestFile>,
    concurrency: usize,
) -> Vec<(PullRequestFile, Option<String>)> {
    stream::iter(files)
        .map(|file| async move {
            let content = match file.status {
                FileStatus::Removed => None,
                _ => {
                    github
                        .fetch_file_content(owner, repo, &file.filename, sha)
                        .await
                }
            };
            (file, content)
        })
        .buffered(concurrency.max(1))
        .collect()
        .await
}

/// Runs one pull request event through listing, content fetching, assembly and forwarding.
pub async fn relay_pull_request(
    event: &PullRequestEvent,
    delivery_id: Option<String>,
    github: &GitHubClient,
    forwarder: &Forwarder,
    config: &RelayConfig,
) -> Result<RelayReport, RelayError> {
    let owner = event.repository.owner.login.as_str();
    let repo = event.repository.name.as_str();
    let pull_request = &event.pull_request;

    let files = github
        .list_changed_files(owner, repo, pull_request.number)
        .await
        .map_err(|e| {
            error!("couldn't list files of {}: {}", pull_request, e);
            e
        })?;

    let files = fetch_contents(
        github,
        owner,
        repo,
        &pull_request.head.sha,
        files,
        config.max_concurrent_fetches,
    )
    .await;
    let missing = files.iter().filter(|(_, content)| content.is_none()).count();

    let payload = assemble(event, delivery_id, files);
    let file_count = payload.files.len();

    let response = forwarder.forward(&payload).await.map_err(|e| {
        error!("couldn't forward {}: {}", pull_request, e);
        e
    })?;
    trace!("downstream response body: {}", response.body);

    info!(
        "relayed {} of {} ({} files, {} without content), downstream answered {}",
        event.action,
        pull_request,
        file_count,
        missing,
        response.status
    );

    Ok(RelayReport {
        files: file_count,
        downstream_status: response.status.as_u16(),
    })
}
