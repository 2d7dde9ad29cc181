//! HTTP client for the Incus unix-socket REST API.
//!
//! Follows the Incus response envelope: synchronous requests return their
//! payload in `metadata`, asynchronous requests return an operation there
//! which is then waited on via `GET /1.0/operations/{id}/wait`. The event
//! stream is a websocket upgrade of `GET /1.0/events` on a dedicated
//! socket connection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::Deserialize;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::types::{
    Event, ExecPost, FileArgs, ImageAliasesEntry, ImageAliasesPost, ImagesPost, Instance,
    InstanceFull, InstanceStatePut, InstancesPost, Operation,
};
use super::{Error, EventStream, InstanceServer};

/// Default Incus daemon socket.
const DEFAULT_SOCKET: &str = "/var/lib/incus/unix.socket";

/// Incus REST client over the local unix socket.
#[derive(Clone)]
pub struct IncusClient {
    socket_path: PathBuf,
    client: Client<UnixConnector>,
    project: Option<String>,
}

/// The envelope every Incus REST response is wrapped in.
#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    #[serde(rename = "type", default)]
    response_type: String,
    #[serde(default)]
    error_code: u16,
    #[serde(default)]
    error: String,
    #[serde(default)]
    metadata: serde_json::Value,
}

impl IncusClient {
    /// Connect to the local Incus daemon.
    ///
    /// The socket path comes from `INCUS_SOCKET` when set, otherwise the
    /// system default. Fails if the socket does not exist.
    pub fn connect() -> Result<Self, Error> {
        let socket_path = std::env::var_os("INCUS_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET));
        if !socket_path.exists() {
            return Err(Error::Transport(format!(
                "incus socket not found at {}",
                socket_path.display()
            )));
        }
        Ok(Self {
            socket_path,
            client: Client::unix(),
            project: None,
        })
    }

    /// Build a client against an explicit socket path.
    pub fn with_socket<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            client: Client::unix(),
            project: None,
        }
    }

    /// Append query parameters, including the project scope when set.
    fn path_with(&self, path: &str, params: &[(&str, &str)]) -> String {
        let mut query = String::new();
        let project = self.project.as_deref().map(|p| ("project", p));
        for (key, value) in params.iter().copied().chain(project) {
            query.push(if query.is_empty() { '?' } else { '&' });
            query.push_str(key);
            query.push('=');
            query.push_str(&encode_query_value(value));
        }
        format!("{path}{query}")
    }

    async fn raw(
        &self,
        method: Method,
        path_query: &str,
        body: Body,
        headers: &[(&str, String)],
    ) -> Result<(StatusCode, hyper::HeaderMap, Vec<u8>), Error> {
        let uri: hyper::Uri = Uri::new(&self.socket_path, path_query).into();
        debug!(method = %method, path = path_query, "incus API request");

        let mut request = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }
        let request = request
            .body(body)
            .map_err(|e| Error::Transport(e.to_string()))?;

        let response = self.client.request(request).await?;
        let status = response.status();
        let header_map = response.headers().clone();
        let bytes = hyper::body::to_bytes(response.into_body()).await?;
        Ok((status, header_map, bytes.to_vec()))
    }

    /// Perform a request and unwrap the response envelope.
    async fn rest(
        &self,
        method: Method,
        path_query: &str,
        body: Option<&impl serde::Serialize>,
        headers: &[(&str, String)],
    ) -> Result<serde_json::Value, Error> {
        let body = match body {
            Some(value) => Body::from(serde_json::to_vec(value)?),
            None => Body::empty(),
        };
        let (status, _, bytes) = self.raw(method, path_query, body, headers).await?;
        parse_envelope(status, &bytes)
    }

    /// Perform a request whose envelope carries a background operation.
    async fn rest_operation(
        &self,
        method: Method,
        path_query: &str,
        body: Option<&impl serde::Serialize>,
        headers: &[(&str, String)],
    ) -> Result<Operation, Error> {
        let metadata = self.rest(method, path_query, body, headers).await?;
        Ok(serde_json::from_value(metadata)?)
    }
}

fn parse_envelope(status: StatusCode, bytes: &[u8]) -> Result<serde_json::Value, Error> {
    if status == StatusCode::NOT_FOUND {
        return Err(Error::NotFound);
    }

    let envelope: ResponseEnvelope = serde_json::from_slice(bytes).map_err(|e| {
        Error::Protocol(format!("unparseable host response (status {status}): {e}"))
    })?;

    if envelope.response_type == "error" || envelope.error_code >= 400 {
        if envelope.error_code == 404 {
            return Err(Error::NotFound);
        }
        return Err(Error::Api {
            status: envelope.error_code,
            message: envelope.error,
        });
    }

    Ok(envelope.metadata)
}

/// Map a completed operation to a result, surfacing host-side failure.
fn check_operation(op: Operation) -> Result<Operation, Error> {
    if op.status_code >= 400 {
        if op.err.contains("not found") {
            return Err(Error::NotFound);
        }
        return Err(Error::Api {
            status: op.status_code,
            message: op.err,
        });
    }
    Ok(op)
}

fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[async_trait::async_trait]
impl InstanceServer for IncusClient {
    async fn list_instances(&self) -> Result<Vec<Instance>, Error> {
        let path = self.path_with("/1.0/instances", &[("recursion", "1")]);
        let metadata = self.rest(Method::GET, &path, None::<&()>, &[]).await?;
        Ok(serde_json::from_value(metadata)?)
    }

    async fn list_instances_full(&self) -> Result<Vec<InstanceFull>, Error> {
        let path = self.path_with("/1.0/instances", &[("recursion", "2")]);
        let metadata = self.rest(Method::GET, &path, None::<&()>, &[]).await?;
        Ok(serde_json::from_value(metadata)?)
    }

    async fn get_instance(&self, name: &str) -> Result<(Instance, String), Error> {
        let path = self.path_with(&format!("/1.0/instances/{name}"), &[]);
        let (status, headers, bytes) = self.raw(Method::GET, &path, Body::empty(), &[]).await?;
        let metadata = parse_envelope(status, &bytes)?;
        let etag = headers
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Ok((serde_json::from_value(metadata)?, etag))
    }

    async fn create_instance(&self, req: &InstancesPost) -> Result<Operation, Error> {
        let path = self.path_with("/1.0/instances", &[]);
        self.rest_operation(Method::POST, &path, Some(req), &[]).await
    }

    async fn create_instance_file(
        &self,
        instance: &str,
        path: &str,
        content: &[u8],
        args: &FileArgs,
    ) -> Result<(), Error> {
        let url = self.path_with(
            &format!("/1.0/instances/{instance}/files"),
            &[("path", path)],
        );
        let headers = [
            ("X-Incus-type", "file".to_string()),
            ("X-Incus-uid", args.uid.to_string()),
            ("X-Incus-gid", args.gid.to_string()),
            ("X-Incus-mode", format!("{:04o}", args.mode)),
            ("X-Incus-write-mode", args.write_mode.clone()),
        ];
        let (status, _, bytes) = self
            .raw(Method::POST, &url, Body::from(content.to_vec()), &headers)
            .await?;
        parse_envelope(status, &bytes).map(|_| ())
    }

    async fn read_instance_file(&self, instance: &str, path: &str) -> Result<Vec<u8>, Error> {
        let url = self.path_with(
            &format!("/1.0/instances/{instance}/files"),
            &[("path", path)],
        );
        let (status, _, bytes) = self.raw(Method::GET, &url, Body::empty(), &[]).await?;
        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound);
        }
        if !status.is_success() {
            // Errors come back as a JSON envelope even on the files endpoint.
            return parse_envelope(status, &bytes).map(|_| Vec::new());
        }
        Ok(bytes)
    }

    async fn exec_instance(&self, instance: &str, req: &ExecPost) -> Result<Operation, Error> {
        let path = self.path_with(&format!("/1.0/instances/{instance}/exec"), &[]);
        self.rest_operation(Method::POST, &path, Some(req), &[]).await
    }

    async fn update_instance_state(
        &self,
        instance: &str,
        req: &InstanceStatePut,
        etag: &str,
    ) -> Result<Operation, Error> {
        let path = self.path_with(&format!("/1.0/instances/{instance}/state"), &[]);
        let mut headers = Vec::new();
        if !etag.is_empty() {
            headers.push(("If-Match", etag.to_string()));
        }
        self.rest_operation(Method::PUT, &path, Some(req), &headers)
            .await
    }

    async fn delete_instance(&self, instance: &str) -> Result<Operation, Error> {
        let path = self.path_with(&format!("/1.0/instances/{instance}"), &[]);
        self.rest_operation(Method::DELETE, &path, None::<&()>, &[])
            .await
    }

    async fn wait_operation(&self, id: &str) -> Result<Operation, Error> {
        let path = self.path_with(&format!("/1.0/operations/{id}/wait"), &[]);
        let op = self
            .rest_operation(Method::GET, &path, None::<&()>, &[])
            .await?;
        check_operation(op)
    }

    async fn get_operation(&self, id: &str) -> Result<Operation, Error> {
        let path = self.path_with(&format!("/1.0/operations/{id}"), &[]);
        self.rest_operation(Method::GET, &path, None::<&()>, &[])
            .await
    }

    async fn events(&self) -> Result<EventStream, Error> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let url = format!("ws://incus{}", self.path_with("/1.0/events", &[]));
        let (ws, _) = tokio_tungstenite::client_async(url, stream)
            .await
            .map_err(|e| Error::Transport(format!("event stream handshake: {e}")))?;

        let (_, mut read) = ws.split();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                let payload = match message {
                    Ok(Message::Text(text)) => text.into_bytes(),
                    Ok(Message::Binary(bytes)) => bytes,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(err = %e, "event stream read failed");
                        break;
                    }
                };
                match serde_json::from_slice::<Event>(&payload) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(err = %e, "dropping unparseable host event"),
                }
            }
        });

        Ok(EventStream::new(rx))
    }

    async fn create_image(&self, req: &ImagesPost) -> Result<Operation, Error> {
        let path = self.path_with("/1.0/images", &[]);
        self.rest_operation(Method::POST, &path, Some(req), &[]).await
    }

    async fn get_image_alias(&self, name: &str) -> Result<ImageAliasesEntry, Error> {
        let path = self.path_with(&format!("/1.0/images/aliases/{name}"), &[]);
        let metadata = self.rest(Method::GET, &path, None::<&()>, &[]).await?;
        Ok(serde_json::from_value(metadata)?)
    }

    async fn delete_image_alias(&self, name: &str) -> Result<(), Error> {
        let path = self.path_with(&format!("/1.0/images/aliases/{name}"), &[]);
        self.rest(Method::DELETE, &path, None::<&()>, &[])
            .await
            .map(|_| ())
    }

    async fn create_image_alias(&self, req: &ImageAliasesPost) -> Result<(), Error> {
        let path = self.path_with("/1.0/images/aliases", &[]);
        self.rest(Method::POST, &path, Some(req), &[])
            .await
            .map(|_| ())
    }

    fn with_project(&self, project: &str) -> Arc<dyn InstanceServer> {
        let mut scoped = self.clone();
        scoped.project = Some(project.to_string());
        Arc::new(scoped)
    }
}
