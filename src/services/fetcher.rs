use crate::error::PipelineError;
use crate::models::Resource;
use crate::services::hasher::fingerprint_file;
use reqwest::header::{HeaderMap, HeaderValue, REFERER, USER_AGENT};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// One remote resource to store at `dest`.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub dest: PathBuf,
    pub headers: HeaderMap,
    /// Bodies of this many bytes or fewer are rejected.
    pub min_bytes: Option<usize>,
    pub timeout: Option<Duration>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        Self {
            url: url.into(),
            dest: dest.into(),
            headers,
            min_bytes: None,
            timeout: None,
        }
    }

    pub fn referer(mut self, referer: &str) -> Self {
        match HeaderValue::from_str(referer) {
            Ok(value) => {
                self.headers.insert(REFERER, value);
            }
            Err(_) => tracing::debug!("referer {} is not a valid header value", referer),
        }
        self
    }

    pub fn min_bytes(mut self, min_bytes: usize) -> Self {
        self.min_bytes = Some(min_bytes);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Retrieves a resource to disk. Implementations report every failure as a value.
pub trait Fetch: Send + Sync + 'static {
    fn fetch(
        &self,
        request: FetchRequest,
    ) -> impl Future<Output = Result<Resource, PipelineError>> + Send;
}

pub struct ResourceFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl ResourceFetcher {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn download(&self, request: &FetchRequest) -> Result<Resource, PipelineError> {
        let response = self
            .client
            .get(&request.url)
            .headers(request.headers.clone())
            .timeout(request.timeout.unwrap_or(self.timeout))
            .send()
            .await
            .map_err(|e| PipelineError::fetch(&request.url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::fetch(&request.url, format!("HTTP {}", status)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| PipelineError::fetch(&request.url, e))?;

        if let Some(min) = request.min_bytes {
            if body.len() <= min {
                return Err(PipelineError::TooSmall {
                    url: request.url.clone(),
                    size: body.len(),
                    min,
                });
            }
        }

        write_atomically(&request.dest, &body).await?;

        let dest = request.dest.clone();
        let fingerprint = tokio::task::spawn_blocking(move || fingerprint_file(&dest))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("fingerprint task for {} failed: {}", request.url, e);
                None
            });
        let Some(fingerprint) = fingerprint else {
            if let Err(e) = tokio::fs::remove_file(&request.dest).await {
                tracing::warn!("could not remove corrupt {}: {}", request.dest.display(), e);
            }
            return Err(PipelineError::IntegrityMismatch {
                path: request.dest.clone(),
            });
        };

        Ok(Resource {
            name: request
                .dest
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: request.dest.clone(),
            fingerprint,
        })
    }
}

impl Fetch for ResourceFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<Resource, PipelineError> {
        let result = self.download(&request).await;
        match &result {
            Ok(resource) => tracing::debug!("saved {} -> {}", request.url, resource.path.display()),
            Err(e) => tracing::warn!("{}", e),
        }
        result
    }
}

async fn write_atomically(dest: &Path, body: &[u8]) -> Result<(), PipelineError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PipelineError::io(parent, e))?;
    }

    let mut partial = dest.as_os_str().to_os_string();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    tokio::fs::write(&partial, body)
        .await
        .map_err(|e| PipelineError::io(&partial, e))?;
    tokio::fs::rename(&partial, dest)
        .await
        .map_err(|e| PipelineError::io(dest, e))
}
