//! HTTP content fetching with mirror fall-back.
//!
//! One blocking client with a per-URL timeout. Failures are classified as
//! retryable (the same URL is attempted once more before moving on) or
//! final (the next mirror is tried immediately); the classification of
//! HTTP status codes is a configurable predicate since upstream behavior
//! varies.

use std::{sync::Arc, time::Duration};

use reqwest::StatusCode;

use crate::errors::SetupError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome classification for a single download attempt.
#[derive(Debug)]
pub enum FetchFailure {
    /// Transient: worth one more attempt on the same URL.
    Retryable(String),
    /// Permanent for this URL; move on to the next mirror.
    Final(String),
}

impl FetchFailure {
    pub fn message(&self) -> &str {
        match self {
            FetchFailure::Retryable(msg) | FetchFailure::Final(msg) => msg,
        }
    }
}

type RetryPredicate = dyn Fn(StatusCode) -> bool + Send + Sync;

pub struct Fetcher {
    client: reqwest::blocking::Client,
    retryable_status: Arc<RetryPredicate>,
}

fn default_retryable(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

impl Fetcher {
    pub fn new(timeout: Option<Duration>) -> Result<Self, SetupError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()
            .map_err(|e| SetupError::Network(e.to_string()))?;
        Ok(Fetcher {
            client,
            retryable_status: Arc::new(default_retryable),
        })
    }

    /// Override which HTTP statuses count as retryable.
    pub fn with_retry_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(StatusCode) -> bool + Send + Sync + 'static,
    {
        self.retryable_status = Arc::new(predicate);
        self
    }

    fn attempt(&self, url: &str) -> Result<Vec<u8>, FetchFailure> {
        let response = self.client.get(url).send().map_err(|e| {
            // connect errors and timeouts are transient by default
            FetchFailure::Retryable(format!("Fetching {url}: {e}"))
        })?;
        let status = response.status();
        if !status.is_success() {
            let msg = format!("Fetching {url}: status {status}");
            return if (self.retryable_status)(status) {
                Err(FetchFailure::Retryable(msg))
            } else {
                Err(FetchFailure::Final(msg))
            };
        }
        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|e| FetchFailure::Retryable(format!("Reading {url}: {e}")))
    }

    /// Download one URL, retrying once on a transient failure.
    pub fn download(&self, url: &str) -> Result<Vec<u8>, FetchFailure> {
        match self.attempt(url) {
            Ok(bytes) => Ok(bytes),
            Err(FetchFailure::Retryable(first)) => {
                tracing::debug!("retrying {url} after: {first}");
                self.attempt(url)
            }
            Err(err) => Err(err),
        }
    }

    /// Try `urls` in order until one succeeds; collects the per-URL
    /// failure messages otherwise.
    pub fn download_any<'a>(
        &self,
        urls: impl IntoIterator<Item = &'a str>,
    ) -> Result<Vec<u8>, String> {
        let mut failures = Vec::new();
        for url in urls {
            match self.download(url) {
                Ok(bytes) => return Ok(bytes),
                Err(failure) => {
                    tracing::warn!("{}", failure.message());
                    failures.push(failure.message().to_string());
                }
            }
        }
        Err(if failures.is_empty() {
            "No fetch source given".to_string()
        } else {
            failures.join("\n")
        })
    }
}

/// Derive the distfile name for an archive: the explicit `distfile` field
/// or the final path segment of the fetch URL.
pub fn distfile_name(distfile: Option<&str>, fetch_url: &str) -> Option<String> {
    if let Some(name) = distfile {
        return Some(name.to_string());
    }
    let trimmed = fetch_url.split(['?', '#']).next().unwrap_or(fetch_url);
    let name = trimmed.rsplit('/').next().unwrap_or("");
    (!name.is_empty()).then(|| name.to_string())
}
