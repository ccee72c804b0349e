//! The client facade: connect to an app, inspect its API, run jobs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use spaceport_core::blob::{BlobPlatform, NativePlatform, PayloadValue};
use spaceport_core::config::{ClientConfig, load_config};
use spaceport_core::error::{ConfigError, ResolveError, SpaceportError, SubmitError};
use spaceport_core::events::Listener;
use spaceport_core::schema::ApiInfo;
use spaceport_core::types::{AppConfig, EndpointRef, EventKind, SpaceStatus};
use tracing::{debug, info};
use uuid::Uuid;

use crate::hub::HubClient;
use crate::locator::{EndpointInfo, EndpointLocator, HubLocator};
use crate::resolver::{PageContext, Resolver, StatusCallback};
use crate::submit::{Dispatch, Job, Submission};
use crate::transport::{QueueConnector, WebSocketConnector};
use crate::upload::{HttpUploader, Uploader};

/// Options for [`Client::connect`].
#[derive(Clone)]
pub struct ClientOptions {
    /// Hub token. Takes precedence over `settings.hf_token`.
    pub token: Option<String>,
    /// Receives progress while a sleeping space wakes up.
    pub status_callback: Option<StatusCallback>,
    pub settings: ClientConfig,
    pub platform: Arc<dyn BlobPlatform>,
    /// Queue socket factory; WebSocket by default.
    pub connector: Option<Arc<dyn QueueConnector>>,
    /// File uploader; multipart HTTP by default.
    pub uploader: Option<Arc<dyn Uploader>>,
    /// Reference resolver; the hub API by default.
    pub locator: Option<Arc<dyn EndpointLocator>>,
    /// Configuration injected by a hosting page.
    pub page: Option<PageContext>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            token: None,
            status_callback: None,
            settings: ClientConfig::default(),
            platform: Arc::new(NativePlatform),
            connector: None,
            uploader: None,
            locator: None,
            page: None,
        }
    }
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("status_callback", &self.status_callback.is_some())
            .field("settings", &self.settings.hub_url)
            .field("page", &self.page.is_some())
            .finish()
    }
}

impl ClientOptions {
    /// Options whose settings come from the layered config files and
    /// `SPACEPORT_*` environment variables.
    pub fn load(workspace: Option<&Path>) -> Result<Self, SpaceportError> {
        Ok(Self {
            settings: load_config(workspace, None)?,
            ..Self::default()
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_status_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&SpaceStatus) + Send + Sync + 'static,
    {
        self.status_callback = Some(Arc::new(callback));
        self
    }

    pub fn with_settings(mut self, settings: ClientConfig) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_platform(mut self, platform: Arc<dyn BlobPlatform>) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn QueueConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn with_locator(mut self, locator: Arc<dyn EndpointLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn with_page(mut self, page: PageContext) -> Self {
        self.page = Some(page);
        self
    }
}

struct Inner {
    dispatch: Arc<Dispatch>,
    resolver: Resolver,
    api_map: HashMap<String, usize>,
    api: Mutex<Option<ApiInfo>>,
}

/// A connection to one app.
///
/// Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.inner.dispatch.endpoint)
            .field("session_hash", &self.inner.dispatch.session_hash)
            .finish()
    }
}

impl Client {
    /// Resolve `reference` and load the app's configuration.
    ///
    /// `reference` is a hub space name (`owner/name`), a hosted space URL, an
    /// `http(s)` URL, or a bare host.
    pub async fn connect(reference: &str, options: ClientOptions) -> Result<Self, SpaceportError> {
        let settings = options.settings;
        let problems = settings.validate();
        if !problems.is_empty() {
            return Err(ConfigError::Invalid {
                message: problems.join("; "),
            }
            .into());
        }

        let token = options.token.or_else(|| settings.hf_token.clone());
        let timeout = Duration::from_secs(settings.connect_timeout_secs);
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ResolveError::Connection {
                message: format!("Failed to build HTTP client: {e}"),
            })?;

        let hub = HubClient::new(http.clone(), settings.hub_base(), token.clone());
        let locator = options
            .locator
            .unwrap_or_else(|| Arc::new(HubLocator::new(hub.clone())));
        let endpoint = locator.locate(reference).await?;
        debug!(
            reference,
            host = %endpoint.host,
            space = ?endpoint.space_id,
            "Located app"
        );

        let resolver = Resolver::new(http.clone(), hub, &settings, token.clone())
            .with_page(options.page)
            .with_status_callback(options.status_callback);
        let resolved = resolver.resolve(&endpoint).await?;

        let dispatch = Dispatch {
            connector: options
                .connector
                .unwrap_or_else(|| Arc::new(WebSocketConnector::new(timeout))),
            uploader: options
                .uploader
                .unwrap_or_else(|| Arc::new(HttpUploader::new(http.clone()))),
            http,
            platform: options.platform,
            endpoint,
            config: resolved.config,
            token,
            jwt: resolved.jwt,
            session_hash: Uuid::new_v4().simple().to_string(),
        };
        let api_map = dispatch.config.api_map();
        info!(
            host = %dispatch.endpoint.host,
            endpoints = api_map.len(),
            "Connected"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                dispatch: Arc::new(dispatch),
                resolver,
                api_map,
                api: Mutex::new(resolved.api),
            }),
        })
    }

    /// The app's configuration document.
    pub fn config(&self) -> &AppConfig {
        &self.inner.dispatch.config
    }

    pub fn endpoint_info(&self) -> &EndpointInfo {
        &self.inner.dispatch.endpoint
    }

    pub fn session_hash(&self) -> &str {
        &self.inner.dispatch.session_hash
    }

    fn cached_api(&self) -> Option<ApiInfo> {
        self.inner
            .api
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The normalized API schema, fetched on first use if connecting could
    /// not load it.
    pub async fn view_api(&self) -> Result<ApiInfo, SpaceportError> {
        if let Some(api) = self.cached_api() {
            return Ok(api);
        }
        let api = self
            .inner
            .resolver
            .fetch_schema(&self.inner.dispatch.config)
            .await?;
        *self.inner.api.lock().unwrap_or_else(PoisonError::into_inner) = Some(api.clone());
        Ok(api)
    }

    fn fn_index(&self, endpoint: &EndpointRef) -> Result<usize, SubmitError> {
        match endpoint {
            EndpointRef::Index(i) => Ok(*i),
            EndpointRef::Name(_) => endpoint
                .trimmed_name()
                .and_then(|name| self.inner.api_map.get(name).copied())
                .ok_or_else(|| SubmitError::UnknownEndpoint {
                    endpoint: endpoint.to_string(),
                }),
        }
    }

    /// Assemble a job. Listeners added on the builder see every event.
    pub fn job(&self, endpoint: impl Into<EndpointRef>, args: Vec<PayloadValue>) -> JobBuilder<'_> {
        JobBuilder {
            client: self,
            endpoint: endpoint.into(),
            args,
            event_data: Value::Null,
            listeners: Vec::new(),
        }
    }

    /// Start a job and return its handle without waiting for output.
    pub fn submit(
        &self,
        endpoint: impl Into<EndpointRef>,
        args: Vec<PayloadValue>,
    ) -> Result<Submission, SpaceportError> {
        self.job(endpoint, args).submit()
    }

    /// Like [`submit`](Self::submit), with an `event_data` value for the job.
    pub fn submit_with_event_data(
        &self,
        endpoint: impl Into<EndpointRef>,
        args: Vec<PayloadValue>,
        event_data: Value,
    ) -> Result<Submission, SpaceportError> {
        self.job(endpoint, args).event_data(event_data).submit()
    }

    fn start_job(&self, builder: JobBuilder<'_>) -> Result<Submission, SpaceportError> {
        let JobBuilder {
            endpoint,
            args,
            event_data,
            listeners,
            ..
        } = builder;
        let fn_index = self.fn_index(&endpoint)?;

        let components = self
            .cached_api()
            .and_then(|api| {
                api.endpoint(&endpoint).map(|schema| {
                    (0..args.len())
                        .map(|i| schema.component_at(i).map(str::to_string))
                        .collect()
                })
            })
            .unwrap_or_default();

        Ok(Submission::start(
            self.inner.dispatch.clone(),
            Job {
                endpoint,
                fn_index,
                args,
                components,
                event_data,
                listeners,
            },
        ))
    }

    /// Run a job and wait for its first output.
    pub async fn predict(
        &self,
        endpoint: impl Into<EndpointRef>,
        args: Vec<PayloadValue>,
    ) -> Result<Value, SpaceportError> {
        let submission = self.submit(endpoint, args)?;
        Ok(submission.first_output().await?)
    }
}

/// A job under construction, from [`Client::job`].
pub struct JobBuilder<'a> {
    client: &'a Client,
    endpoint: EndpointRef,
    args: Vec<PayloadValue>,
    event_data: Value,
    listeners: Vec<(EventKind, Listener)>,
}

impl std::fmt::Debug for JobBuilder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobBuilder")
            .field("endpoint", &self.endpoint)
            .field("args", &self.args.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl JobBuilder<'_> {
    pub fn event_data(mut self, event_data: Value) -> Self {
        self.event_data = event_data;
        self
    }

    /// Register a listener before the job starts.
    pub fn on(mut self, kind: EventKind, listener: Listener) -> Self {
        self.listeners.push((kind, listener));
        self
    }

    /// Start the job.
    pub fn submit(self) -> Result<Submission, SpaceportError> {
        let client = self.client;
        client.start_job(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelConnector, ChannelTransport};
    use serde_json::json;
    use spaceport_core::events::listener;
    use spaceport_core::types::Stage;

    fn page() -> PageContext {
        PageContext {
            config: serde_json::from_value(json!({
                "root": "",
                "enable_queue": true,
                "dependencies": [{"api_name": "predict"}, {"api_name": false}]
            }))
            .unwrap(),
            location_origin: "https://example.com".into(),
        }
    }

    async fn offline_client(connector: Arc<ChannelConnector>) -> Client {
        let options = ClientOptions::default()
            .with_page(page())
            .with_connector(connector);
        Client::connect("http://127.0.0.1:1", options).await.unwrap()
    }

    #[tokio::test]
    async fn test_invalid_settings_rejected() {
        let options = ClientOptions::default().with_settings(ClientConfig {
            wake_poll_interval_ms: 0,
            ..ClientConfig::default()
        });
        let err = Client::connect("http://127.0.0.1:1", options)
            .await
            .unwrap_err();
        assert!(matches!(err, SpaceportError::Config(ConfigError::Invalid { .. })));
    }

    #[tokio::test]
    async fn test_unknown_endpoint() {
        let client = offline_client(Arc::new(ChannelConnector::default())).await;
        let err = client.submit("/missing", Vec::new()).unwrap_err();
        assert!(matches!(
            err,
            SpaceportError::Submit(SubmitError::UnknownEndpoint { .. })
        ));
    }

    #[tokio::test]
    async fn test_named_and_numeric_endpoints_resolve() {
        let client = offline_client(Arc::new(ChannelConnector::default())).await;
        assert_eq!(client.fn_index(&EndpointRef::from("/predict")).unwrap(), 0);
        assert_eq!(client.fn_index(&EndpointRef::from("predict")).unwrap(), 0);
        assert_eq!(client.fn_index(&EndpointRef::from(1usize)).unwrap(), 1);
        assert_eq!(client.config().root, "http://127.0.0.1:1");
        assert_eq!(client.session_hash().len(), 32);
    }

    #[tokio::test]
    async fn test_view_api_retries_fetch() {
        let client = offline_client(Arc::new(ChannelConnector::default())).await;
        let err = client.view_api().await.unwrap_err();
        assert!(matches!(
            err,
            SpaceportError::Resolve(ResolveError::SchemaUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_predict_over_channel_queue() {
        let (transport, peer) = ChannelTransport::pair(8);
        let client = offline_client(Arc::new(ChannelConnector::new(vec![transport]))).await;
        let task = tokio::spawn({
            let client = client.clone();
            async move { client.predict("/predict", vec![PayloadValue::from("x")]).await }
        });
        peer.push(r#"{"msg":"process_generating","success":true,"output":{"data":["partial"]}}"#)
            .await;
        let output = task.await.unwrap().unwrap();
        assert_eq!(output, json!(["partial"]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_builder_listeners_see_every_event() {
        let client = offline_client(Arc::new(ChannelConnector::default())).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let submission = client
            .job("/predict", vec![PayloadValue::from("x")])
            .on(
                EventKind::Status,
                listener(move |e| {
                    if let Some(update) = e.as_status() {
                        recorder.lock().unwrap().push(update.stage);
                    }
                }),
            )
            .submit()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = submission.first_output().await.unwrap_err();
        assert!(matches!(err, SubmitError::Connection { .. }));
        assert_eq!(*seen.lock().unwrap(), vec![Stage::Pending, Stage::Error]);
    }

    #[tokio::test]
    async fn test_loaded_settings_drive_connect() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_dir = dir.path().join(".spaceport");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(
            cfg_dir.join("config.toml"),
            "hub_url = \"http://127.0.0.1:1\"\nhf_token = \"hf_file\"\n",
        )
        .unwrap();

        let options = ClientOptions::load(Some(dir.path())).unwrap();
        assert_eq!(options.settings.hub_url, "http://127.0.0.1:1");
        assert_eq!(options.settings.hf_token.as_deref(), Some("hf_file"));

        let client = Client::connect("http://127.0.0.1:1", options.with_page(page()))
            .await
            .unwrap();
        assert_eq!(client.config().root, "http://127.0.0.1:1");
    }
}
