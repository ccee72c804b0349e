//! # Spaceport Client
//!
//! Async client for hosted apps: resolves an app reference, wakes sleeping
//! spaces, uploads binary arguments and runs jobs either directly over HTTP
//! or through the app's WebSocket queue.
//!
//! ```no_run
//! use spaceport_client::{Client, ClientOptions};
//! use spaceport_core::PayloadValue;
//!
//! # async fn run() -> spaceport_core::Result<()> {
//! let client = Client::connect("owner/app", ClientOptions::default()).await?;
//! let output = client.predict("/predict", vec![PayloadValue::from("hello")]).await?;
//! println!("{output}");
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod hub;
pub mod locator;
pub mod resolver;
pub mod submit;
pub mod transport;
pub mod upload;

pub use client::{Client, ClientOptions, JobBuilder};
pub use hub::HubClient;
pub use locator::{EndpointInfo, EndpointLocator, HubLocator, determine_protocol};
pub use resolver::{PageContext, Resolved, Resolver, StatusCallback};
pub use submit::Submission;
pub use transport::{
    ChannelConnector, ChannelPeer, ChannelTransport, Inbound, QueueConnector, QueueTransport,
    WebSocketConnector, WebSocketTransport,
};
pub use upload::{HttpUploader, UploadError, Uploader};
