//! Turning an app reference into connection coordinates.
//!
//! A reference is one of:
//! - a hub space name (`owner/name`), looked up through the hub API;
//! - a hosted space URL ending in `hf.space`;
//! - any other `http(s)://` URL;
//! - a bare host, assumed to be served over TLS.

use async_trait::async_trait;
use spaceport_core::error::ResolveError;
use tracing::debug;
use url::{Position, Url};

use crate::hub::HubClient;

const SPACE_DOMAIN_SUFFIX: &str = "hf.space";

/// Where an app lives and how to talk to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    /// `ws` or `wss`.
    pub ws_protocol: String,
    /// `http:` or `https:` (with the trailing colon).
    pub http_protocol: String,
    /// Host and optional port.
    pub host: String,
    /// Hub space id when the app is a hosted space.
    pub space_id: Option<String>,
}

impl EndpointInfo {
    /// `{http_protocol}//{host}`.
    pub fn http_origin(&self) -> String {
        format!("{}//{}", self.http_protocol, self.host)
    }

    /// `{ws_protocol}://{host}`.
    pub fn ws_origin(&self) -> String {
        format!("{}://{}", self.ws_protocol, self.host)
    }
}

/// Whether `reference` has the `owner/name` shape of a hub space.
pub fn is_space_name(reference: &str) -> bool {
    reference.split('/').count() == 2
}

fn is_space_domain(reference: &str) -> bool {
    reference.trim_end_matches('/').ends_with(SPACE_DOMAIN_SUFFIX)
}

/// Derive protocols and host from a URL or bare host. Never fails: anything
/// that does not parse as an http(s) URL is treated as a bare host.
pub fn determine_protocol(endpoint: &str) -> EndpointInfo {
    if (endpoint.starts_with("http://") || endpoint.starts_with("https://"))
        && let Ok(url) = Url::parse(endpoint)
    {
        let host = url[Position::BeforeHost..Position::BeforePath].to_string();
        let http_protocol = format!("{}:", url.scheme());
        let ws_protocol = if host.ends_with(SPACE_DOMAIN_SUFFIX) || url.scheme() == "https" {
            "wss"
        } else {
            "ws"
        };
        return EndpointInfo {
            ws_protocol: ws_protocol.to_string(),
            http_protocol,
            host,
            space_id: None,
        };
    }

    EndpointInfo {
        ws_protocol: "wss".to_string(),
        http_protocol: "https:".to_string(),
        host: endpoint.trim_end_matches('/').to_string(),
        space_id: None,
    }
}

/// Resolves an app reference to an [`EndpointInfo`].
#[async_trait]
pub trait EndpointLocator: Send + Sync {
    async fn locate(&self, reference: &str) -> Result<EndpointInfo, ResolveError>;
}

/// Default locator backed by the hub API.
#[derive(Debug, Clone)]
pub struct HubLocator {
    hub: HubClient,
}

impl HubLocator {
    pub fn new(hub: HubClient) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl EndpointLocator for HubLocator {
    async fn locate(&self, reference: &str) -> Result<EndpointInfo, ResolveError> {
        let reference = reference.trim();

        if is_space_name(reference) {
            let host = self.hub.space_host(reference).await?;
            debug!(space = reference, host = %host, "Resolved space host");
            return Ok(EndpointInfo {
                space_id: Some(reference.to_string()),
                ..determine_protocol(&host)
            });
        }

        let info = determine_protocol(reference);
        if is_space_domain(reference) {
            let space_id = info.host.replace(".hf.space", "");
            return Ok(EndpointInfo {
                space_id: Some(space_id),
                ..info
            });
        }

        Ok(info)
    }
}
