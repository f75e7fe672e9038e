//! Alertmanager silence client.
//!
//! Provides the two operations the reconciler needs from the alerting
//! system:
//! - Opening one silence per configured severity for a maintenance window
//! - Closing (expiring) a silence by id
//!
//! Speaks the Alertmanager v2 HTTP API (`/api/v2/silences`).

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::store::SilenceId;

/// Errors from silence operations.
#[derive(Debug, Error)]
pub enum SilencerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("alertmanager returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("silence duration out of range: {0:?}")]
    InvalidDuration(Duration),

    /// A partial open failed and some of its silences could not be removed.
    #[error("{source}; rollback failed for {} silence(s): {}", .failed.len(), join_ids(.failed))]
    RollbackFailed {
        source: Box<SilencerError>,
        failed: Vec<SilenceId>,
    },
}

fn join_ids(ids: &[SilenceId]) -> String {
    ids.iter()
        .map(SilenceId::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

/// Opens and closes silences in the alerting system.
#[async_trait]
pub trait AlertSilencer: Send + Sync {
    /// Create one silence per severity, valid from now for `duration`.
    ///
    /// Either every silence is created, or none remain: silences created
    /// before a failure are deleted before the error is returned.
    async fn open(&self, duration: Duration) -> Result<Vec<SilenceId>, SilencerError>;

    /// Delete a silence. Unknown or already expired ids are an error.
    async fn close(&self, id: &SilenceId) -> Result<(), SilencerError>;
}

/// Label matcher attached to a silence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Matcher {
    pub name: String,
    pub value: String,
    pub is_regex: bool,
    pub is_equal: bool,
}

impl Matcher {
    /// `name="value"` matcher.
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            is_regex: false,
            is_equal: true,
        }
    }
}

/// Error parsing a matcher expression.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid matcher {0:?}: expected name=value, name!=value, name=~regex or name!~regex")]
pub struct MatcherParseError(pub String);

impl FromStr for Matcher {
    type Err = MatcherParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MatcherParseError(s.to_string());
        let eq = s.find('=').ok_or_else(invalid)?;

        let (name_end, is_equal) = if s[..eq].ends_with('!') {
            (eq - 1, false)
        } else {
            (eq, true)
        };

        let rest = &s[eq + 1..];
        let (value, is_regex) = match rest.strip_prefix('~') {
            Some(pattern) => (pattern, true),
            None => (rest, false),
        };

        let name = s[..name_end].trim();
        if name.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            name: name.to_string(),
            value: value.to_string(),
            is_regex,
            is_equal,
        })
    }
}

/// What every silence created by this process looks like.
#[derive(Debug, Clone)]
pub struct SilenceTemplate {
    /// One silence is created per severity.
    pub severities: Vec<String>,

    /// Matchers added to every silence next to the severity matcher.
    pub matchers: Vec<Matcher>,

    pub created_by: String,

    pub comment: String,
}

impl Default for SilenceTemplate {
    fn default() -> Self {
        Self {
            severities: vec!["warning".to_string(), "critical".to_string()],
            matchers: Vec::new(),
            created_by: "kured-silencer".to_string(),
            comment: "silenced for kured reboot".to_string(),
        }
    }
}

impl SilenceTemplate {
    fn build(
        &self,
        severity: &str,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> PostableSilence {
        let mut matchers = Vec::with_capacity(self.matchers.len() + 1);
        matchers.push(Matcher::equal("severity", severity));
        matchers.extend(self.matchers.iter().cloned());

        PostableSilence {
            matchers,
            starts_at,
            ends_at,
            created_by: self.created_by.clone(),
            comment: self.comment.clone(),
        }
    }
}

/// Silence creation request body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostableSilence {
    pub matchers: Vec<Matcher>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub created_by: String,
    pub comment: String,
}

#[derive(Debug, Deserialize)]
struct PostSilenceResponse {
    #[serde(rename = "silenceID")]
    silence_id: String,
}

/// Alertmanager API client.
pub struct AlertmanagerClient {
    client: reqwest::Client,
    api_url: String,
    template: SilenceTemplate,
}

impl AlertmanagerClient {
    /// Create a client for the Alertmanager at `endpoint`.
    pub fn new(
        endpoint: &Url,
        template: SilenceTemplate,
        request_timeout: Duration,
    ) -> Result<Self, SilencerError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            api_url: format!("{}/api/v2", endpoint.as_str().trim_end_matches('/')),
            template,
        })
    }

    async fn create(&self, silence: &PostableSilence) -> Result<SilenceId, SilencerError> {
        let url = format!("{}/silences", self.api_url);
        debug!(url = %url, ends_at = %silence.ends_at, "Creating silence");

        let response = self.client.post(&url).json(silence).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to create silence");
            return Err(SilencerError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let body: PostSilenceResponse = response.json().await?;
        Ok(SilenceId::new(body.silence_id))
    }

    /// Delete silences created by a failed `open`, returning the error to surface.
    async fn rollback(&self, created: Vec<SilenceId>, cause: SilencerError) -> SilencerError {
        if created.is_empty() {
            return cause;
        }

        warn!(
            created = created.len(),
            error = %cause,
            "Silence creation failed part way, rolling back"
        );

        let mut failed = Vec::new();
        for id in created {
            if let Err(e) = self.close(&id).await {
                error!(silence_id = %id, error = %e, "Failed to roll back silence");
                failed.push(id);
            }
        }

        if failed.is_empty() {
            cause
        } else {
            SilencerError::RollbackFailed {
                source: Box::new(cause),
                failed,
            }
        }
    }
}

#[async_trait]
impl AlertSilencer for AlertmanagerClient {
    async fn open(&self, duration: Duration) -> Result<Vec<SilenceId>, SilencerError> {
        let starts_at = Utc::now();
        let ends_at = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| starts_at.checked_add_signed(d))
            .ok_or(SilencerError::InvalidDuration(duration))?;

        let mut created = Vec::with_capacity(self.template.severities.len());
        for severity in &self.template.severities {
            let silence = self.template.build(severity, starts_at, ends_at);
            match self.create(&silence).await {
                Ok(id) => {
                    debug!(silence_id = %id, severity = %severity, "Silence created");
                    created.push(id);
                }
                Err(e) => return Err(self.rollback(created, e).await),
            }
        }

        info!(
            count = created.len(),
            ends_at = %ends_at,
            "Silences created"
        );
        Ok(created)
    }

    async fn close(&self, id: &SilenceId) -> Result<(), SilencerError> {
        let url = format!("{}/silence/{}", self.api_url, id);
        debug!(silence_id = %id, "Deleting silence");

        let response = self.client.delete(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(silence_id = %id, status = %status, body = %body, "Failed to delete silence");
            return Err(SilencerError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}
