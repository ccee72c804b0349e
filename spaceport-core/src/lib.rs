//! # Spaceport Core
//!
//! Transport-free building blocks for the Spaceport client: client
//! configuration, error types, the app configuration and event model, API
//! schema normalization, binary payload extraction, per-submission event
//! dispatch, and the queue protocol state machine.

pub mod blob;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod schema;
pub mod types;

// Re-export commonly used types at the crate root.
pub use blob::{
    Blob, BlobContent, BlobPlatform, BlobRef, DataUriPlatform, NativePlatform, PathSegment,
    PayloadValue, extract_blobs, update_at_path,
};
pub use config::{ClientConfig, config_files, load_config};
pub use error::{ConfigError, ResolveError, Result, SpaceportError, SubmitError};
pub use events::{EventBus, Listener, listener};
pub use protocol::{Action, InboundFrame, QueueMachine, QueueState};
pub use schema::{ApiInfo, ApiType, EndpointSchema, ParameterInfo, RawApiInfo, normalize};
pub use types::{
    AppConfig, BROKEN_CONNECTION_MSG, Dependency, EndpointRef, Event, EventBody, EventKind, Fault,
    LoadStatus, Payload, ProgressUnit, QUEUE_FULL_MSG, SpaceStage, SpaceState, SpaceStatus, Stage,
    StatusUpdate,
};
