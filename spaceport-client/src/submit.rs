//! Submission handles and the drivers that feed them.
//!
//! Every job runs on its own task. The driver first resolves binary
//! arguments, then takes one of two paths:
//! - direct: a single `POST {app}/run{route}` when the endpoint skips the queue;
//! - queued: a socket to `{app}/queue/join` driven by [`QueueMachine`].
//!
//! Events reach the caller twice, through the listener registry and through
//! a lossless stream created before the driver starts. Listeners passed in
//! with the job are registered before the driver starts too.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Value, json};
use spaceport_core::blob::{BlobPlatform, PayloadValue, extract_blobs};
use spaceport_core::error::SubmitError;
use spaceport_core::events::{EventBus, Listener};
use spaceport_core::protocol::{Action, QueueMachine};
use spaceport_core::types::{
    AppConfig, EndpointRef, Event, EventBody, EventKind, Fault, Payload, Stage, StatusUpdate,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::locator::EndpointInfo;
use crate::transport::{Inbound, QueueConnector};
use crate::upload::{Uploader, reinsert, resolve_blobs};

/// Everything a driver needs that is shared by all jobs of one client.
pub(crate) struct Dispatch {
    pub http: reqwest::Client,
    pub connector: Arc<dyn QueueConnector>,
    pub uploader: Arc<dyn Uploader>,
    pub platform: Arc<dyn BlobPlatform>,
    pub endpoint: EndpointInfo,
    pub config: AppConfig,
    pub token: Option<String>,
    pub jwt: Option<String>,
    pub session_hash: String,
}

impl Dispatch {
    /// `{http_protocol}//{host}{path}`.
    pub fn app_base(&self) -> String {
        format!("{}{}", self.endpoint.http_origin(), self.config.path)
    }

    pub fn queue_url(&self) -> String {
        let base = format!(
            "{}{}/queue/join",
            self.endpoint.ws_origin(),
            self.config.path
        );
        let Some(jwt) = &self.jwt else {
            return base;
        };
        match Url::parse(&base) {
            Ok(mut url) => {
                url.query_pairs_mut().append_pair("__sign", jwt);
                url.to_string()
            }
            Err(_) => format!("{base}?__sign={jwt}"),
        }
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {token}")),
            None => request,
        }
    }
}

/// One call to an endpoint.
pub(crate) struct Job {
    pub endpoint: EndpointRef,
    pub fn_index: usize,
    pub args: Vec<PayloadValue>,
    /// Declared component per argument position.
    pub components: Vec<Option<String>>,
    pub event_data: Value,
    /// Registered before the driver starts.
    pub listeners: Vec<(EventKind, Listener)>,
}

struct Shared {
    endpoint: String,
    fn_index: usize,
    bus: EventBus,
    /// Held while an event is checked against `forward` and emitted.
    emitting: Mutex<()>,
    forward: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
    dispatch: Arc<Dispatch>,
}

/// Handle to a running job.
///
/// Cloning yields another handle to the same job.
#[derive(Clone)]
pub struct Submission {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for Submission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submission")
            .field("endpoint", &self.inner.endpoint)
            .field("fn_index", &self.inner.fn_index)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Submission {
    /// Create the handle and spawn its driver.
    pub(crate) fn start(dispatch: Arc<Dispatch>, mut job: Job) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = EventBus::new();
        for (kind, listener) in job.listeners.drain(..) {
            bus.subscribe(kind, listener);
        }
        let submission = Self {
            inner: Arc::new(Shared {
                endpoint: job.endpoint.to_string(),
                fn_index: job.fn_index,
                bus,
                emitting: Mutex::new(()),
                forward: Mutex::new(Some(tx)),
                events: Mutex::new(Some(rx)),
                cancel: CancellationToken::new(),
                driver: Mutex::new(None),
                dispatch: dispatch.clone(),
            }),
        };

        info!(
            endpoint = %submission.inner.endpoint,
            fn_index = job.fn_index,
            "Submitting job"
        );
        let handle = tokio::spawn(drive(submission.clone(), dispatch, job));
        *submission
            .inner
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        submission
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn fn_index(&self) -> usize {
        self.inner.fn_index
    }

    /// Register a listener. Returns `self` for chaining.
    ///
    /// The job is already running, so events delivered before this call are
    /// not replayed. Listeners that must see every event belong on the job
    /// builder ([`Client::job`](crate::Client::job)).
    pub fn on(&self, kind: EventKind, listener: Listener) -> &Self {
        self.inner.bus.subscribe(kind, listener);
        self
    }

    /// Remove a listener registered with [`on`](Self::on).
    pub fn off(&self, kind: EventKind, listener: &Listener) -> &Self {
        self.inner.bus.unsubscribe(kind, listener);
        self
    }

    /// Every event of this job, in order, from the start.
    ///
    /// The stream ends once the job reaches a terminal state. Only the
    /// first call gets the stream.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<Event>> {
        self.inner
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Whether the job has finished or been cancelled.
    pub fn is_finished(&self) -> bool {
        self.inner
            .forward
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Wait for the first output.
    ///
    /// Resolves with the first data event, fails on the first error status,
    /// and fails with [`SubmitError::Incomplete`] if the job ends without output.
    /// A listener panic inside the driver is resumed here.
    pub async fn first_output(&self) -> Result<Value, SubmitError> {
        let mut events = self.events().ok_or_else(|| SubmitError::Transport {
            message: "event stream already taken".to_string(),
        })?;

        while let Some(event) = events.recv().await {
            match event.body {
                EventBody::Data { data } => return Ok(data),
                EventBody::Status(update) if update.stage == Stage::Error => {
                    return Err(status_error(&update));
                }
                EventBody::Status(_) => {}
            }
        }
        self.join_driver().await;
        Err(SubmitError::Incomplete)
    }

    /// Wait for the driver task, resuming its panic if it had one.
    async fn join_driver(&self) {
        let handle = self
            .inner
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
            && e.is_panic()
        {
            std::panic::resume_unwind(e.into_panic());
        }
    }

    /// Stop the job.
    ///
    /// If the job has not finished, listeners receive a final `complete`
    /// status and nothing after it. The server is then asked to reset the
    /// job; failures there are logged and ignored.
    pub async fn cancel(&self) {
        {
            let _emitting = self
                .inner
                .emitting
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let sender = self
                .inner
                .forward
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(sender) = sender {
                let event =
                    self.event_of(EventBody::Status(StatusUpdate::new(Stage::Complete, false)));
                let _ = sender.send(event.clone());
                drop(sender);
                self.inner.bus.emit(&event);
                info!(endpoint = %self.inner.endpoint, "Submission cancelled");
            }
        }
        self.inner.cancel.cancel();

        let dispatch = &self.inner.dispatch;
        let url = format!("{}/reset", dispatch.app_base());
        let body = json!({
            "fn_index": self.inner.fn_index,
            "session_hash": dispatch.session_hash,
        });
        match dispatch.http.post(&url).json(&body).send().await {
            Ok(response) if !response.status().is_success() => {
                debug!(status = %response.status(), "Reset request rejected");
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Reset request failed"),
        }
    }

    fn event_of(&self, body: EventBody) -> Event {
        match body {
            EventBody::Status(update) => {
                Event::status(self.inner.endpoint.clone(), self.inner.fn_index, update)
            }
            EventBody::Data { data } => {
                Event::data(self.inner.endpoint.clone(), self.inner.fn_index, data)
            }
        }
    }

    /// Deliver an event unless the job already ended.
    fn deliver(&self, event: Event) {
        let _emitting = self
            .inner
            .emitting
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        {
            let forward = self
                .inner
                .forward
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let Some(sender) = forward.as_ref() else {
                return;
            };
            let _ = sender.send(event.clone());
        }
        self.inner.bus.emit(&event);
    }

    fn deliver_status(&self, update: StatusUpdate) {
        self.deliver(self.event_of(EventBody::Status(update)));
    }

    fn deliver_data(&self, data: Value) {
        self.deliver(self.event_of(EventBody::Data { data }));
    }

    /// Close the event stream.
    fn finish(&self) {
        self.inner
            .forward
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Error for a terminal error status, by fault.
pub fn status_error(update: &StatusUpdate) -> SubmitError {
    let message = update.message.clone().unwrap_or_default();
    match update.fault {
        Some(Fault::QueueFull) => SubmitError::QueueFull { message },
        Some(Fault::Connection) => SubmitError::Connection { message },
        Some(Fault::Server) | None => SubmitError::Server { message },
    }
}

/// Closes the event stream when the driver exits, unwinding included.
struct FinishOnDrop(Submission);

impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        self.0.finish();
    }
}

async fn drive(submission: Submission, dispatch: Arc<Dispatch>, job: Job) {
    let _finish = FinishOnDrop(submission.clone());
    let payload = prepare_payload(&dispatch, &job).await;
    if submission.inner.cancel.is_cancelled() {
        return;
    }

    if dispatch.config.skip_queue(job.fn_index) {
        run_direct(&submission, &dispatch, payload, &job.endpoint).await;
    } else {
        run_queued(&submission, &dispatch, payload).await;
    }
}

async fn prepare_payload(dispatch: &Dispatch, job: &Job) -> Payload {
    let components = &job.components;
    let refs = extract_blobs(
        &job.args,
        &|i: usize| components.get(i).cloned().flatten(),
        dispatch.platform.as_ref(),
    );
    let data = if refs.is_empty() {
        reinsert(&job.args, &[], Vec::new())
    } else {
        debug!(count = refs.len(), "Resolving binary arguments");
        let resolutions = resolve_blobs(
            dispatch.uploader.as_ref(),
            &dispatch.app_base(),
            &refs,
            dispatch.token.as_deref(),
        )
        .await;
        reinsert(&job.args, &refs, resolutions)
    };
    Payload {
        data,
        event_data: job.event_data.clone(),
        fn_index: job.fn_index,
    }
}

async fn run_direct(
    submission: &Submission,
    dispatch: &Dispatch,
    payload: Payload,
    endpoint: &EndpointRef,
) {
    submission.deliver_status(StatusUpdate::new(Stage::Pending, false));

    let url = format!("{}/run{}", dispatch.app_base(), endpoint.route());
    debug!(url = %url, "Posting direct run");
    let request = dispatch
        .authorized(dispatch.http.post(&url))
        .json(&payload.with_session(&dispatch.session_hash));

    let response = tokio::select! {
        _ = submission.inner.cancel.cancelled() => return,
        response = request.send() => response,
    };
    let response = match response {
        Ok(response) => response,
        Err(e) => {
            warn!(url = %url, error = %e, "Direct run request failed");
            submission.deliver_status(StatusUpdate::broken_connection(false));
            return;
        }
    };

    let status = response.status();
    let text = match response.text().await {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Failed to read direct run response");
            submission.deliver_status(StatusUpdate::broken_connection(false));
            return;
        }
    };
    let body = serde_json::from_str::<Value>(&text);

    if status == reqwest::StatusCode::OK {
        match body {
            Ok(body) => {
                let update = StatusUpdate {
                    eta: body.get("average_duration").and_then(Value::as_f64),
                    ..StatusUpdate::new(Stage::Complete, false)
                };
                submission.deliver_status(update);
                submission.deliver_data(body.get("data").cloned().unwrap_or(Value::Null));
            }
            Err(e) => {
                warn!(error = %e, "Direct run returned invalid JSON");
                submission.deliver_status(StatusUpdate::broken_connection(false));
            }
        }
        return;
    }

    let message = body
        .ok()
        .and_then(|b| b.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| {
            if text.is_empty() {
                status.to_string()
            } else {
                text.clone()
            }
        });
    warn!(status = %status, message = %message, "Direct run failed");
    submission.deliver_status(StatusUpdate {
        code: Some(json!(status.as_u16())),
        ..StatusUpdate::error(Fault::Server, message, false)
    });
}

async fn run_queued(submission: &Submission, dispatch: &Dispatch, payload: Payload) {
    submission.deliver_status(StatusUpdate::new(Stage::Pending, true));

    let url = dispatch.queue_url();
    let connected = tokio::select! {
        _ = submission.inner.cancel.cancelled() => return,
        connected = dispatch.connector.connect(&url) => connected,
    };
    let mut transport = match connected {
        Ok(transport) => transport,
        Err(e) => {
            warn!(error = %e, "Could not open queue socket");
            submission.deliver_status(StatusUpdate::broken_connection(true));
            return;
        }
    };

    let mut machine = QueueMachine::new(
        submission.inner.endpoint.clone(),
        submission.inner.fn_index,
        dispatch.session_hash.clone(),
        payload,
    );

    while !machine.is_terminal() {
        let inbound = tokio::select! {
            _ = submission.inner.cancel.cancelled() => None,
            inbound = transport.recv() => Some(inbound),
        };
        let Some(inbound) = inbound else {
            machine.terminate();
            transport.close().await;
            break;
        };

        let actions = match inbound {
            Inbound::Text(text) => machine.handle_text(&text),
            Inbound::Closed { clean } => machine.on_closed(clean),
        };

        for action in actions {
            match action {
                Action::Send(frame) => {
                    if let Err(e) = transport.send(frame.to_string()).await {
                        warn!(error = %e, "Queue socket send failed");
                        submission.deliver_status(StatusUpdate::broken_connection(true));
                        machine.terminate();
                        transport.close().await;
                        break;
                    }
                }
                Action::Emit(event) => submission.deliver(event),
                Action::Close => transport.close().await,
            }
        }
    }
}
