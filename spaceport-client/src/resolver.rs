//! Resolving an app's configuration and schema.
//!
//! Configuration comes from the hosting page when one injected it, or from
//! `GET {origin}/config` otherwise. When that fails for a hosted space, the
//! resolver polls the hub until the space is running (reporting progress
//! through the status callback) and then retries once.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use spaceport_core::config::ClientConfig;
use spaceport_core::error::ResolveError;
use spaceport_core::schema::{ApiInfo, RawApiInfo, normalize};
use spaceport_core::types::{
    AppConfig, BROKEN_CONNECTION_MSG, LoadStatus, SpaceStage, SpaceState, SpaceStatus,
};
use tracing::{debug, info, warn};

use crate::hub::HubClient;
use crate::locator::EndpointInfo;

/// Receives space loading progress.
pub type StatusCallback = Arc<dyn Fn(&SpaceStatus) + Send + Sync>;

/// Configuration embedded in the page hosting the client.
#[derive(Debug, Clone, PartialEq)]
pub struct PageContext {
    pub config: AppConfig,
    /// Origin the page was served from.
    pub location_origin: String,
}

/// Result of a successful resolution.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub config: AppConfig,
    /// Normalized schema; `None` if it could not be fetched.
    pub api: Option<ApiInfo>,
    /// Signing token for the queue socket of a private space.
    pub jwt: Option<String>,
}

fn space_status(
    status: SpaceState,
    load_status: LoadStatus,
    message: &str,
    detail: impl Into<String>,
) -> SpaceStatus {
    SpaceStatus {
        status,
        load_status,
        message: message.to_string(),
        detail: detail.into(),
        discussions_enabled: None,
    }
}

fn load_failed() -> SpaceStatus {
    space_status(
        SpaceState::Error,
        LoadStatus::Error,
        "Could not load this space.",
        "NOT_FOUND",
    )
}

pub struct Resolver {
    http: reqwest::Client,
    hub: HubClient,
    token: Option<String>,
    local_dev_origin: String,
    poll_interval: Duration,
    page: Option<PageContext>,
    callback: Option<StatusCallback>,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("hub", &self.hub.base_url())
            .field("poll_interval", &self.poll_interval)
            .field("page", &self.page.is_some())
            .finish()
    }
}

impl Resolver {
    pub fn new(
        http: reqwest::Client,
        hub: HubClient,
        settings: &ClientConfig,
        token: Option<String>,
    ) -> Self {
        Self {
            http,
            hub,
            token,
            local_dev_origin: settings.local_dev_origin.clone(),
            poll_interval: Duration::from_millis(settings.wake_poll_interval_ms),
            page: None,
            callback: None,
        }
    }

    pub fn with_page(mut self, page: Option<PageContext>) -> Self {
        self.page = page;
        self
    }

    pub fn with_status_callback(mut self, callback: Option<StatusCallback>) -> Self {
        self.callback = callback;
        self
    }

    fn notify(&self, status: SpaceStatus) {
        debug!(status = ?status.status, detail = %status.detail, "Space status");
        if let Some(callback) = &self.callback {
            callback(&status);
        }
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {token}")),
            None => request,
        }
    }

    /// Obtain the app configuration, preferring a page-injected copy.
    pub async fn resolve_config(&self, endpoint: &EndpointInfo) -> Result<AppConfig, ResolveError> {
        let origin = endpoint.http_origin();

        if let Some(page) = &self.page
            && page.location_origin != self.local_dev_origin
        {
            let mut config = page.config.clone();
            config.path = config.root.clone();
            config.root = format!("{origin}{}", config.root);
            debug!(root = %config.root, "Using page-injected config");
            return Ok(config);
        }

        let url = format!("{origin}/config");
        let response = self
            .authorized(self.http.get(&url))
            .send()
            .await
            .map_err(|e| ResolveError::ConfigUnavailable {
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ResolveError::ConfigUnavailable {
                message: format!("{url} returned {status}"),
            });
        }

        let mut config: AppConfig =
            response
                .json()
                .await
                .map_err(|e| ResolveError::ConfigUnavailable {
                    message: format!("invalid config document: {e}"),
                })?;
        config.root = origin;
        Ok(config)
    }

    /// Fetch and normalize the schema from `{root}/info`.
    pub async fn fetch_schema(&self, config: &AppConfig) -> Result<ApiInfo, ResolveError> {
        let url = format!("{}/info", config.root.trim_end_matches('/'));
        let response = self
            .authorized(self.http.get(&url))
            .send()
            .await
            .map_err(|e| ResolveError::SchemaUnavailable {
                message: format!("{BROKEN_CONNECTION_MSG} {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ResolveError::SchemaUnavailable {
                message: format!("{BROKEN_CONNECTION_MSG} {url} returned {status}"),
            });
        }

        let document: Value =
            response
                .json()
                .await
                .map_err(|e| ResolveError::SchemaUnavailable {
                    message: format!("invalid schema document: {e}"),
                })?;
        let raw =
            RawApiInfo::from_document(document).map_err(|e| ResolveError::SchemaUnavailable {
                message: format!("invalid schema document: {e}"),
            })?;
        Ok(normalize(&raw))
    }

    /// Resolve configuration, schema and signing token for `endpoint`.
    pub async fn resolve(&self, endpoint: &EndpointInfo) -> Result<Resolved, ResolveError> {
        match self.resolve_config(endpoint).await {
            Ok(config) => Ok(self.finish(config, endpoint).await),
            Err(e) => {
                warn!(host = %endpoint.host, error = %e, "Could not resolve app config");
                match &endpoint.space_id {
                    Some(space_id) => self.wake(space_id, endpoint).await,
                    None => {
                        self.notify(load_failed());
                        Err(e)
                    }
                }
            }
        }
    }

    async fn wake(&self, space_id: &str, endpoint: &EndpointInfo) -> Result<Resolved, ResolveError> {
        info!(space = space_id, "Waiting for space to become available");
        loop {
            let runtime = match self.hub.space_status(space_id).await {
                Ok(runtime) => runtime,
                Err(e) => {
                    self.notify(space_status(
                        SpaceState::Error,
                        LoadStatus::Error,
                        "Could not get space status",
                        "NOT_FOUND",
                    ));
                    return Err(e);
                }
            };
            let detail = runtime.stage.to_string();

            match runtime.stage {
                SpaceStage::Stopped | SpaceStage::Sleeping => self.notify(space_status(
                    SpaceState::Sleeping,
                    LoadStatus::Pending,
                    "Space is asleep. Waking it up...",
                    detail,
                )),
                SpaceStage::Building => self.notify(space_status(
                    SpaceState::Building,
                    LoadStatus::Pending,
                    "Space is building...",
                    detail,
                )),
                SpaceStage::Running | SpaceStage::RunningBuilding => {
                    self.notify(space_status(
                        SpaceState::Running,
                        LoadStatus::Complete,
                        "",
                        detail,
                    ));
                    return match self.resolve_config(endpoint).await {
                        Ok(config) => Ok(self.finish(config, endpoint).await),
                        Err(e) => {
                            warn!(space = space_id, error = %e, "Space is running but config is unavailable");
                            self.notify(load_failed());
                            Err(e)
                        }
                    };
                }
                SpaceStage::Other(stage) => {
                    let name = runtime.name.as_deref().unwrap_or(space_id);
                    let discussions_enabled = self.hub.discussions_enabled(name).await;
                    self.notify(SpaceStatus {
                        discussions_enabled: Some(discussions_enabled),
                        ..space_status(
                            SpaceState::SpaceError,
                            LoadStatus::Error,
                            "This space is experiencing an issue.",
                            detail,
                        )
                    });
                    return Err(ResolveError::SpaceUnavailable { stage });
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn finish(&self, config: AppConfig, endpoint: &EndpointInfo) -> Resolved {
        let jwt = match &endpoint.space_id {
            Some(space_id) => self.hub.jwt(space_id).await,
            None => None,
        };
        let api = match self.fetch_schema(&config).await {
            Ok(api) => Some(api),
            Err(e) => {
                warn!(root = %config.root, error = %e, "Could not load API info");
                None
            }
        };
        info!(
            root = %config.root,
            endpoints = config.dependencies.len(),
            "Resolved app"
        );
        Resolved { config, api, jwt }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn unreachable_endpoint(space_id: Option<&str>) -> EndpointInfo {
        EndpointInfo {
            ws_protocol: "ws".into(),
            http_protocol: "http:".into(),
            host: "127.0.0.1:1".into(),
            space_id: space_id.map(str::to_string),
        }
    }

    fn resolver(page: Option<PageContext>, seen: Arc<Mutex<Vec<SpaceStatus>>>) -> Resolver {
        let http = reqwest::Client::new();
        let hub = HubClient::new(http.clone(), "http://127.0.0.1:1", None);
        let callback: StatusCallback = Arc::new(move |s: &SpaceStatus| {
            seen.lock().unwrap().push(s.clone())
        });
        Resolver::new(http, hub, &ClientConfig::default(), None)
            .with_page(page)
            .with_status_callback(Some(callback))
    }

    fn page(origin: &str) -> PageContext {
        PageContext {
            config: serde_json::from_value(json!({
                "root": "/app",
                "enable_queue": true,
                "dependencies": []
            }))
            .unwrap(),
            location_origin: origin.to_string(),
        }
    }

    #[tokio::test]
    async fn test_page_config_used_off_dev_origin() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let r = resolver(Some(page("https://example.com")), seen);
        let config = r.resolve_config(&unreachable_endpoint(None)).await.unwrap();
        assert_eq!(config.root, "http://127.0.0.1:1/app");
        assert_eq!(config.path, "/app");
    }

    #[tokio::test]
    async fn test_page_config_ignored_on_dev_origin() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let r = resolver(Some(page("http://localhost:9876")), seen);
        let err = r.resolve_config(&unreachable_endpoint(None)).await.unwrap_err();
        assert!(matches!(err, ResolveError::ConfigUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_non_space_failure_reports_load_error() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let r = resolver(None, seen.clone());
        let err = r.resolve(&unreachable_endpoint(None)).await.unwrap_err();
        assert!(matches!(err, ResolveError::ConfigUnavailable { .. }));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, SpaceState::Error);
        assert_eq!(seen[0].message, "Could not load this space.");
        assert_eq!(seen[0].detail, "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_space_status_failure_stops_polling() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let r = resolver(None, seen.clone());
        let err = r
            .resolve(&unreachable_endpoint(Some("owner/app")))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::SpaceMetadata { .. }));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].message, "Could not get space status");
        assert_eq!(seen[0].load_status, LoadStatus::Error);
    }

    #[tokio::test]
    async fn test_schema_failure_is_not_fatal() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let r = resolver(Some(page("https://example.com")), seen.clone());
        let resolved = r.resolve(&unreachable_endpoint(None)).await.unwrap();
        assert!(resolved.api.is_none());
        assert!(resolved.jwt.is_none());
        assert!(seen.lock().unwrap().is_empty());
    }
}
