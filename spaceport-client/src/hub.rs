//! Hub API calls: host lookup, space runtime status, JWT issuance and the
//! discussions check.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use spaceport_core::error::ResolveError;
use spaceport_core::types::SpaceStage;
use tracing::{debug, warn};

use crate::locator::is_space_name;

#[derive(Debug, Deserialize)]
struct HostResponse {
    host: String,
}

#[derive(Debug, Deserialize)]
struct SpaceRuntime {
    stage: String,
}

#[derive(Debug, Deserialize)]
struct SpaceInfo {
    #[serde(default)]
    id: Option<String>,
    runtime: SpaceRuntime,
}

#[derive(Debug, Deserialize)]
struct JwtResponse {
    #[serde(default)]
    token: Option<String>,
}

/// How a space id is addressed on the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceIdKind {
    /// `owner/name`.
    Name,
    /// The subdomain of a hosted space URL.
    Subdomain,
}

impl SpaceIdKind {
    pub fn of(space_id: &str) -> Self {
        if is_space_name(space_id) {
            SpaceIdKind::Name
        } else {
            SpaceIdKind::Subdomain
        }
    }
}

/// Runtime status reported by the hub for one space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceRuntimeStatus {
    pub stage: SpaceStage,
    /// Canonical `owner/name` id, when the hub reports one.
    pub name: Option<String>,
}

/// Thin client for the hub API.
#[derive(Debug, Clone)]
pub struct HubClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HubClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {token}")),
            None => request,
        }
    }

    /// Look up the serving URL of an `owner/name` space.
    pub async fn space_host(&self, space_id: &str) -> Result<String, ResolveError> {
        let url = format!("{}/api/spaces/{}/host", self.base_url, space_id);
        let metadata_error = |detail: String| ResolveError::SpaceMetadata {
            message: format!("Space metadata could not be loaded: {detail}"),
        };

        let response = self
            .authorized(self.http.get(&url))
            .send()
            .await
            .map_err(|e| metadata_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(metadata_error(format!("hub returned {status}")));
        }

        let body: HostResponse = response
            .json()
            .await
            .map_err(|e| metadata_error(e.to_string()))?;
        Ok(body.host)
    }

    /// Current runtime stage of a space.
    pub async fn space_status(&self, space_id: &str) -> Result<SpaceRuntimeStatus, ResolveError> {
        let url = match SpaceIdKind::of(space_id) {
            SpaceIdKind::Name => format!("{}/api/spaces/{}", self.base_url, space_id),
            SpaceIdKind::Subdomain => {
                format!("{}/api/spaces/by-subdomain/{}", self.base_url, space_id)
            }
        };
        let status_error = |detail: String| ResolveError::SpaceMetadata {
            message: format!("Could not get space status: {detail}"),
        };

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| status_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(format!("hub returned {status}")));
        }

        let info: SpaceInfo = response
            .json()
            .await
            .map_err(|e| status_error(e.to_string()))?;

        debug!(space = space_id, stage = %info.runtime.stage, "Polled space status");
        Ok(SpaceRuntimeStatus {
            stage: SpaceStage::parse(&info.runtime.stage),
            name: info.id,
        })
    }

    /// Request a short-lived signing token for a private space.
    ///
    /// Requires a hub token. Any failure yields `None`.
    pub async fn jwt(&self, space_id: &str) -> Option<String> {
        self.token.as_ref()?;
        let url = format!("{}/api/spaces/{}/jwt", self.base_url, space_id);

        let response = match self.authorized(self.http.get(&url)).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(space = space_id, error = %e, "Could not request space JWT");
                return None;
            }
        };

        match response.json::<JwtResponse>().await {
            Ok(body) => body.token.filter(|t| !t.is_empty()),
            Err(e) => {
                warn!(space = space_id, error = %e, "Invalid JWT response");
                None
            }
        }
    }

    /// Whether the space accepts discussions. Transport failures count as disabled.
    pub async fn discussions_enabled(&self, space_id: &str) -> bool {
        let url = format!("{}/api/spaces/{}/discussions", self.base_url, space_id);
        let response = match self.http.head(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(space = space_id, error = %e, "Discussions check failed");
                return false;
            }
        };

        match response
            .headers()
            .get("x-error-message")
            .and_then(|v| v.to_str().ok())
        {
            Some(message) => !discussions_disabled(message),
            None => true,
        }
    }
}

static DISCUSSIONS_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b[dD]iscussions?\b").ok());
static DISABLED_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b[dD]isabled\b").ok());

/// Whether an `x-error-message` header says discussions are disabled.
pub fn discussions_disabled(message: &str) -> bool {
    mentions(&DISCUSSIONS_PATTERN, message) && mentions(&DISABLED_PATTERN, message)
}

fn mentions(pattern: &Option<Regex>, message: &str) -> bool {
    pattern.as_ref().is_some_and(|re| re.is_match(message))
}
