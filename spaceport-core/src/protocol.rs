//! Queue protocol frames and the per-submission state machine.
//!
//! The server drives the queued path by pushing frames tagged with `msg`.
//! [`QueueMachine`] turns each inbound frame into a list of [`Action`]s for
//! the driver to carry out in order: replies to send, events to emit, and
//! whether to close the socket.

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::types::{Event, Fault, Payload, ProgressUnit, QUEUE_FULL_MSG, Stage, StatusUpdate};

/// Frames pushed by the server on the queue socket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum InboundFrame {
    SendHash,
    SendData,
    QueueFull {
        #[serde(default)]
        code: Option<Value>,
        #[serde(default)]
        success: Option<bool>,
    },
    Estimation {
        #[serde(default)]
        rank: Option<u64>,
        #[serde(default)]
        queue_size: Option<u64>,
        #[serde(default)]
        rank_eta: Option<f64>,
        #[serde(default)]
        code: Option<Value>,
        #[serde(default)]
        success: Option<bool>,
    },
    Progress {
        #[serde(default)]
        progress_data: Option<Vec<ProgressUnit>>,
        #[serde(default)]
        code: Option<Value>,
        #[serde(default)]
        success: Option<bool>,
    },
    ProcessStarts {
        #[serde(default)]
        rank: Option<u64>,
        #[serde(default)]
        code: Option<Value>,
        #[serde(default)]
        success: Option<bool>,
    },
    ProcessGenerating {
        #[serde(default)]
        success: bool,
        #[serde(default)]
        output: Value,
        #[serde(default)]
        progress_data: Option<Vec<ProgressUnit>>,
        #[serde(default)]
        average_duration: Option<f64>,
        #[serde(default)]
        code: Option<Value>,
    },
    ProcessCompleted {
        #[serde(default)]
        success: bool,
        #[serde(default)]
        output: Value,
        #[serde(default)]
        progress_data: Option<Vec<ProgressUnit>>,
        #[serde(default)]
        code: Option<Value>,
    },
    #[serde(other)]
    Unknown,
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Where a queued submission stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    AwaitingHash,
    AwaitingData,
    Streaming,
    Terminal,
}

/// Something the driver must do in response to a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Send this JSON frame to the server.
    Send(Value),
    /// Deliver this event to listeners.
    Emit(Event),
    /// Close the socket; the submission is finished.
    Close,
}

/// Transition table for one queued submission.
#[derive(Debug, Clone)]
pub struct QueueMachine {
    state: QueueState,
    last_stage: Stage,
    endpoint: String,
    fn_index: usize,
    session_hash: String,
    payload: Payload,
}

fn output_error(output: &Value) -> Option<String> {
    match output.get("error") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    }
}

fn output_data(output: &Value) -> Value {
    output.get("data").cloned().unwrap_or(Value::Null)
}

impl QueueMachine {
    pub fn new(
        endpoint: impl Into<String>,
        fn_index: usize,
        session_hash: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            state: QueueState::AwaitingHash,
            last_stage: Stage::Pending,
            endpoint: endpoint.into(),
            fn_index,
            session_hash: session_hash.into(),
            payload,
        }
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state == QueueState::Terminal
    }

    /// Mark the submission finished without emitting anything.
    pub fn terminate(&mut self) {
        self.state = QueueState::Terminal;
    }

    /// Handle one raw text frame. Malformed frames are dropped.
    pub fn handle_text(&mut self, text: &str) -> Vec<Action> {
        match InboundFrame::parse(text) {
            Ok(frame) => self.handle(frame),
            Err(e) => {
                warn!(error = %e, fn_index = self.fn_index, "Dropping malformed queue frame");
                Vec::new()
            }
        }
    }

    /// Handle one parsed frame.
    pub fn handle(&mut self, frame: InboundFrame) -> Vec<Action> {
        if self.is_terminal() {
            debug!(?frame, "Ignoring frame after terminal state");
            return Vec::new();
        }

        match frame {
            InboundFrame::SendHash => {
                self.state = QueueState::AwaitingData;
                vec![Action::Send(json!({
                    "fn_index": self.fn_index,
                    "session_hash": self.session_hash,
                }))]
            }
            InboundFrame::SendData => {
                self.state = QueueState::Streaming;
                vec![Action::Send(self.payload.with_session(&self.session_hash))]
            }
            InboundFrame::QueueFull { code, success } => {
                let status = StatusUpdate {
                    code,
                    success,
                    ..StatusUpdate::error(Fault::QueueFull, QUEUE_FULL_MSG, true)
                };
                self.update(status, None)
            }
            InboundFrame::Estimation {
                rank,
                queue_size,
                rank_eta,
                code,
                success,
            } => {
                let status = StatusUpdate {
                    code,
                    success,
                    size: queue_size,
                    position: rank,
                    eta: rank_eta,
                    ..StatusUpdate::new(self.last_stage, true)
                };
                self.update(status, None)
            }
            InboundFrame::Progress {
                progress_data,
                code,
                success,
            } => {
                let status = StatusUpdate {
                    code,
                    success,
                    progress_data,
                    ..StatusUpdate::new(Stage::Pending, true)
                };
                self.update(status, None)
            }
            InboundFrame::ProcessStarts {
                rank,
                code,
                success,
            } => {
                let status = StatusUpdate {
                    code,
                    success,
                    size: rank,
                    position: Some(0),
                    ..StatusUpdate::new(Stage::Pending, true)
                };
                self.update(status, None)
            }
            InboundFrame::ProcessGenerating {
                success,
                output,
                progress_data,
                average_duration,
                code,
            } => {
                if success {
                    let status = StatusUpdate {
                        code,
                        progress_data,
                        eta: average_duration,
                        ..StatusUpdate::new(Stage::Generating, true)
                    };
                    self.update(status, Some(output_data(&output)))
                } else {
                    let status = StatusUpdate {
                        code,
                        progress_data,
                        eta: average_duration,
                        ..StatusUpdate::error(
                            Fault::Server,
                            output_error(&output).unwrap_or_default(),
                            true,
                        )
                    };
                    self.update(status, None)
                }
            }
            InboundFrame::ProcessCompleted {
                success,
                output,
                progress_data,
                code,
            } => {
                let error = output_error(&output);
                if error.is_some() || !success {
                    let status = StatusUpdate {
                        code,
                        success: Some(success),
                        ..StatusUpdate::error(Fault::Server, error.unwrap_or_default(), true)
                    };
                    self.update(status, None)
                } else {
                    let status = StatusUpdate {
                        code,
                        progress_data,
                        success: Some(true),
                        eta: output.get("average_duration").and_then(Value::as_f64),
                        ..StatusUpdate::new(Stage::Complete, true)
                    };
                    self.update(status, Some(output_data(&output)))
                }
            }
            InboundFrame::Unknown => {
                debug!(fn_index = self.fn_index, "Ignoring unknown queue frame");
                Vec::new()
            }
        }
    }

    /// The socket closed. Abnormal closure before completion is a connection error.
    pub fn on_closed(&mut self, clean: bool) -> Vec<Action> {
        if self.is_terminal() {
            return Vec::new();
        }
        self.state = QueueState::Terminal;
        if clean {
            debug!(fn_index = self.fn_index, "Queue socket closed cleanly");
            return Vec::new();
        }
        vec![Action::Emit(Event::status(
            self.endpoint.clone(),
            self.fn_index,
            StatusUpdate::broken_connection(true),
        ))]
    }

    fn update(&mut self, status: StatusUpdate, data: Option<Value>) -> Vec<Action> {
        let stage = status.stage;
        let mut actions = vec![Action::Emit(Event::status(
            self.endpoint.clone(),
            self.fn_index,
            status,
        ))];
        if let Some(data) = data {
            actions.push(Action::Emit(Event::data(
                self.endpoint.clone(),
                self.fn_index,
                data,
            )));
        }
        if stage.is_terminal() {
            self.state = QueueState::Terminal;
            actions.push(Action::Close);
        } else {
            self.last_stage = stage;
            self.state = QueueState::Streaming;
        }
        actions
    }
}
