//! Read-only client for the parts of the GitHub REST API the relay needs: the file listing of a
//! pull request and the content of a file at a given commit.

use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::{
    header::{ACCEPT, USER_AGENT},
    Client, RequestBuilder, Response, StatusCode,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};
use url::Url;

use crate::config::RelayConfig;

const PER_PAGE: usize = 100;
const GITHUB_API_VERSION: &str = "2022-11-28";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("GitHub API responded with {status}: {message}")]
    Status { status: StatusCode, message: String },

    #[error("request to the GitHub API failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("GitHub API URL `{0}` can't be used as a base for requests")]
    BaseUrl(Url),

    #[error("couldn't decode file content: {0}")]
    Decode(String),
}

/// Status of a file in a pull request, as reported by GitHub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Added,
    Removed,
    Modified,
    Renamed,
    Copied,
    Changed,
    Unchanged,
}

/// One entry of `GET /repos/{owner}/{repo}/pulls/{number}/files`.
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestFile {
    pub filename: String,
    pub status: FileStatus,
    pub additions: u64,
    pub deletions: u64,
    pub changes: u64,
    /// Missing for binary files and very large diffs.
    pub patch: Option<String>,
    pub previous_filename: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentResponse {
    encoding: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message: String,
}

pub struct GitHubClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
    max_pages: u32,
}

impl GitHubClient {
    pub fn new(config: &RelayConfig) -> reqwest::Result<Self> {
        let http = Client::builder().timeout(config.github_timeout).build()?;

        Ok(Self {
            http,
            base_url: config.github_api_url.clone(),
            token: config.github_token.clone(),
            max_pages: config.max_file_pages,
        })
    }

    /// Lists the files changed by a pull request, in the order GitHub returns them.
    ///
    /// Follows pagination until a short page comes back. Past `max_pages` pages the listing is
    /// truncated with a warning.
    pub async fn list_changed_files(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<Vec<PullRequestFile>, FetchError> {
        let url = self.endpoint(&["repos", owner, repo, "pulls", &number.to_string(), "files"])?;
        let mut files = Vec::new();

        for page in 1..=self.max_pages {
            trace!("listing files of {}/{}#{}, page {}", owner, repo, number, page);
            let response = self
                .get(url.clone())
                .query(&[("per_page", PER_PAGE as u32), ("page", page)])
                .send()
                .await?;
            let batch: Vec<PullRequestFile> = check(response).await?.json().await?;
            let full_page = batch.len() >= PER_PAGE;
            files.extend(batch);

            if !full_page {
                debug!("{}/{}#{} changes {} files", owner, repo, number, files.len());
                return Ok(files);
            }
        }

        warn!(
            "stopped listing {}/{}#{} after {} pages, only the first {} files are relayed",
            owner,
            repo,
            number,
            self.max_pages,
            files.len()
        );
        Ok(files)
    }

    /// Fetches the text content of `path` at commit `sha`.
    ///
    /// Any failure (missing file, binary content, file too large for the contents API, rate
    /// limiting) is logged and turned into `None`.
    pub async fn fetch_file_content(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        sha: &str,
    ) -> Option<String> {
        match self.try_fetch_file_content(owner, repo, path, sha).await {
            Ok(content) => Some(content),
            Err(e) => {
                warn!("couldn't fetch content of {} at {}: {}", path, sha, e);
                None
            }
        }
    }

    async fn try_fetch_file_content(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        sha: &str,
    ) -> Result<String, FetchError> {
        let mut segments = vec!["repos", owner, repo, "contents"];
        segments.extend(path.split('/'));
        let url = self.endpoint(&segments)?;

        let response = self.get(url).query(&[("ref", sha)]).send().await?;
        let content: ContentResponse = check(response).await?.json().await?;

        match (content.encoding.as_deref(), content.content) {
            (Some("base64"), Some(encoded)) => decode_content(&encoded),
            (encoding, _) => Err(FetchError::Decode(format!(
                "unsupported encoding {:?}, file is probably too large",
                encoding
            ))),
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, FetchError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| FetchError::BaseUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn get(&self, url: Url) -> RequestBuilder {
        let request = self
            .http
            .get(url)
            .header(ACCEPT, "application/vnd.github+json")
            .header(USER_AGENT, concat!("prrelay/", env!("CARGO_PKG_VERSION")))
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION);

        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

async fn check(response: Response) -> Result<Response, FetchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ApiMessage>(&body) {
        Ok(api) => api.message,
        Err(_) => body,
    };
    Err(FetchError::Status { status, message })
}

/// GitHub wraps base64 content every 60 characters.
fn decode_content(encoded: &str) -> Result<String, FetchError> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact)
        .map_err(|e| FetchError::Decode(e.to_string()))?;
    String::from_utf8(bytes)
        .map_err(|_| FetchError::Decode("content isn't valid UTF-8, binary file?".to_owned()))
}
