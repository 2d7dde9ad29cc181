//! Container-host adapter.
//!
//! [`InstanceServer`] is the capability set the control loops consume from
//! the local Incus daemon: instance lifecycle, file push/pull, command
//! execution, async operations, the event stream, and image publishing.
//! [`IncusClient`] implements it over the unix-socket REST API;
//! [`MockServer`] implements it in memory for tests.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

mod client;
mod mock;
mod types;

pub use client::IncusClient;
pub use mock::MockServer;
pub use types::{
    Event, ExecPost, FileArgs, ImageAliasesEntry, ImageAliasesPost, ImageSource, ImagesPost,
    Instance, InstanceFull, InstanceSource, InstanceState, InstanceStatePut, InstancesPost,
    Operation,
};

/// Errors from the container host.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O failure talking to the host socket. Retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// The target object no longer exists on the host.
    #[error("not found")]
    NotFound,

    /// The host rejected or failed the request.
    #[error("host error {status}: {message}")]
    Api { status: u16, message: String },

    /// A response or operation was missing an expected field.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<hyper::Error> for Error {
    fn from(err: hyper::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

/// Push stream of host events.
///
/// Ends (returns `None`) when the underlying connection closes.
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
}

impl EventStream {
    pub(crate) fn new(rx: mpsc::Receiver<Event>) -> Self {
        Self { rx }
    }

    /// Receive the next event, or `None` once the stream has closed.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

/// Operations the control loops require from the container host.
///
/// Independent calls from different tasks are safe; a single
/// [`EventStream`] must not be shared across tasks.
#[async_trait]
pub trait InstanceServer: Send + Sync {
    /// List container instances (name and creation time).
    async fn list_instances(&self) -> Result<Vec<Instance>, Error>;

    /// List container instances including runtime state.
    async fn list_instances_full(&self) -> Result<Vec<InstanceFull>, Error>;

    /// Fetch a single instance and its ETag.
    async fn get_instance(&self, name: &str) -> Result<(Instance, String), Error>;

    /// Submit an instance creation. The returned operation must be waited on.
    async fn create_instance(&self, req: &InstancesPost) -> Result<Operation, Error>;

    /// Write a file inside an instance.
    async fn create_instance_file(
        &self,
        instance: &str,
        path: &str,
        content: &[u8],
        args: &FileArgs,
    ) -> Result<(), Error>;

    /// Read a file from an instance.
    async fn read_instance_file(&self, instance: &str, path: &str) -> Result<Vec<u8>, Error>;

    /// Execute a command inside an instance. After waiting, the operation's
    /// `metadata.return` holds the process exit code.
    async fn exec_instance(&self, instance: &str, req: &ExecPost) -> Result<Operation, Error>;

    /// Change an instance's running state (start/stop/restart).
    async fn update_instance_state(
        &self,
        instance: &str,
        req: &InstanceStatePut,
        etag: &str,
    ) -> Result<Operation, Error>;

    /// Delete an instance.
    async fn delete_instance(&self, instance: &str) -> Result<Operation, Error>;

    /// Block until an operation completes; returns its final form.
    async fn wait_operation(&self, id: &str) -> Result<Operation, Error>;

    /// Snapshot an operation without waiting.
    async fn get_operation(&self, id: &str) -> Result<Operation, Error>;

    /// Subscribe to the host event stream.
    async fn events(&self) -> Result<EventStream, Error>;

    /// Publish an image from an instance.
    async fn create_image(&self, req: &ImagesPost) -> Result<Operation, Error>;

    /// Look up an image alias.
    async fn get_image_alias(&self, name: &str) -> Result<ImageAliasesEntry, Error>;

    /// Delete an image alias.
    async fn delete_image_alias(&self, name: &str) -> Result<(), Error>;

    /// Create an image alias.
    async fn create_image_alias(&self, req: &ImageAliasesPost) -> Result<(), Error>;

    /// Derive a client scoped to an Incus project. Event filtering by
    /// project remains the caller's job: some hosts deliver cross-project
    /// events on the same stream.
    fn with_project(&self, project: &str) -> Arc<dyn InstanceServer>;
}
