//! HTTP plumbing and unary daemon operations

use std::convert::Infallible;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use hyperlocal::UnixConnector;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use super::exec::ExecOutput;
use super::socket::resolve_socket_path;
use super::types::{
    ContainerInspect, ContainerSpec, ContainerStatus, CreateContainerRequest, ErrorBody,
    IdResponse,
};
use super::{ContainerRuntime, DockerError, DockerResult, STREAM_TIMEOUT_SECS, UNARY_TIMEOUT_SECS};

pub(crate) type Body = BoxBody<Bytes, Infallible>;

/// Protocol client for the container daemon's local socket.
#[derive(Clone)]
pub struct DockerClient {
    client: Client<UnixConnector, Body>,
    socket: PathBuf,
}

impl DockerClient {
    /// Connect using the process-wide resolved socket path.
    pub fn new() -> DockerResult<Self> {
        Ok(Self::with_socket(resolve_socket_path()?))
    }

    /// Connect to an explicit socket path.
    pub fn with_socket(socket: PathBuf) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(UnixConnector);
        Self { client, socket }
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket
    }

    pub(crate) fn uri(&self, path_and_query: &str) -> hyper::Uri {
        hyperlocal::Uri::new(&self.socket, path_and_query).into()
    }

    pub(crate) fn full_body(bytes: Vec<u8>) -> Body {
        BoxBody::new(Full::new(Bytes::from(bytes)))
    }

    pub(crate) fn empty_body() -> Body {
        BoxBody::new(Empty::new())
    }

    /// Body with no declared length so hyper sends it chunked.
    fn chunked_body(bytes: Vec<u8>) -> Body {
        let stream = futures_util::stream::iter(vec![Ok::<_, Infallible>(Frame::data(
            Bytes::from(bytes),
        ))]);
        BoxBody::new(StreamBody::new(stream))
    }

    /// Issue a request, waiting up to the unary deadline for response
    /// headers.
    pub(crate) async fn send(
        &self,
        request: Request<Body>,
        path: &str,
    ) -> DockerResult<Response<Incoming>> {
        match tokio::time::timeout(
            Duration::from_secs(UNARY_TIMEOUT_SECS),
            self.client.request(request),
        )
        .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(DockerError::transport(path, e)),
            Err(_) => Err(DockerError::Timeout {
                path: path.to_string(),
                seconds: UNARY_TIMEOUT_SECS,
            }),
        }
    }

    /// Issue a streaming upload (build context), waiting up to the
    /// streaming deadline for response headers.
    pub(crate) async fn send_streaming(
        &self,
        method: Method,
        path: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> DockerResult<Response<Incoming>> {
        let request = Request::builder()
            .method(method)
            .uri(self.uri(path))
            .header(CONTENT_TYPE, content_type)
            .body(Self::chunked_body(body))
            .map_err(|e| DockerError::transport(path, e))?;

        match tokio::time::timeout(
            Duration::from_secs(STREAM_TIMEOUT_SECS),
            self.client.request(request),
        )
        .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(DockerError::transport(path, e)),
            Err(_) => Err(DockerError::Timeout {
                path: path.to_string(),
                seconds: STREAM_TIMEOUT_SECS,
            }),
        }
    }

    pub(crate) async fn collect_body(&self, body: Incoming, path: &str) -> DockerResult<Bytes> {
        match tokio::time::timeout(Duration::from_secs(UNARY_TIMEOUT_SECS), body.collect()).await {
            Ok(Ok(collected)) => Ok(collected.to_bytes()),
            Ok(Err(e)) => Err(DockerError::transport(path, e)),
            Err(_) => Err(DockerError::Timeout {
                path: path.to_string(),
                seconds: UNARY_TIMEOUT_SECS,
            }),
        }
    }

    /// One-shot request returning status and body bytes.
    pub(crate) async fn unary(
        &self,
        method: Method,
        path: &str,
        json: Option<serde_json::Value>,
    ) -> DockerResult<(StatusCode, Bytes)> {
        let mut builder = Request::builder().method(method).uri(self.uri(path));
        let body = match json {
            Some(value) => {
                builder = builder.header(CONTENT_TYPE, "application/json");
                let bytes = serde_json::to_vec(&value)
                    .map_err(|e| DockerError::Protocol(e.to_string()))?;
                Self::full_body(bytes)
            }
            None => Self::empty_body(),
        };
        let request = builder
            .body(body)
            .map_err(|e| DockerError::transport(path, e))?;

        let response = self.send(request, path).await?;
        let status = response.status();
        let bytes = self.collect_body(response.into_body(), path).await?;
        Ok((status, bytes))
    }

    /// Decode the daemon's JSON `message` field into an API error.
    pub(crate) fn api_error(&self, path: &str, status: StatusCode, bytes: &Bytes) -> DockerError {
        let message = serde_json::from_slice::<ErrorBody>(bytes)
            .map(|b| b.message)
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| String::from_utf8_lossy(bytes).trim().to_string());
        DockerError::Api {
            status: status.as_u16(),
            path: path.to_string(),
            message,
        }
    }

    pub(crate) fn ok_or_api_error(
        &self,
        path: &str,
        status: StatusCode,
        bytes: Bytes,
    ) -> DockerResult<Bytes> {
        if status.as_u16() >= 400 {
            return Err(self.api_error(path, status, &bytes));
        }
        Ok(bytes)
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn ping(&self) -> DockerResult<()> {
        let (status, bytes) = self.unary(Method::GET, "/_ping", None).await?;
        self.ok_or_api_error("/_ping", status, bytes)?;
        Ok(())
    }

    async fn build_image(
        &self,
        tag: &str,
        recipe: &str,
        progress: UnboundedSender<String>,
    ) -> DockerResult<String> {
        self.build_image_inner(tag, recipe, progress).await
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> DockerResult<String> {
        let name = format!(
            "uc-workspace-{}",
            &uuid::Uuid::new_v4().to_string()[..8]
        );
        let create_path = format!("/containers/create?name={}", name);
        let body = serde_json::to_value(CreateContainerRequest::from_spec(spec))
            .map_err(|e| DockerError::Protocol(e.to_string()))?;
        let (status, bytes) = self.unary(Method::POST, &create_path, Some(body)).await?;
        let bytes = self.ok_or_api_error(&create_path, status, bytes)?;
        let created: IdResponse = serde_json::from_slice(&bytes)
            .map_err(|e| DockerError::Protocol(format!("create response: {}", e)))?;

        for warning in &created.warnings {
            warn!("Daemon warning creating container: {}", warning);
        }

        let start_path = format!("/containers/{}/start", created.id);
        let (status, bytes) = self.unary(Method::POST, &start_path, None).await?;
        // 304 means already started.
        if status != StatusCode::NOT_MODIFIED {
            self.ok_or_api_error(&start_path, status, bytes)?;
        }

        debug!("Started container {}", created.id);
        Ok(created.id)
    }

    async fn inspect(&self, container_id: &str) -> DockerResult<Option<ContainerStatus>> {
        let path = format!("/containers/{}/json", container_id);
        let (status, bytes) = self.unary(Method::GET, &path, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bytes = self.ok_or_api_error(&path, status, bytes)?;
        let inspect: ContainerInspect = serde_json::from_slice(&bytes)
            .map_err(|e| DockerError::Protocol(format!("inspect response: {}", e)))?;
        Ok(Some(ContainerStatus {
            id: inspect.id,
            running: inspect.state.map(|s| s.running).unwrap_or(false),
        }))
    }

    async fn exec_streaming(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        output: UnboundedSender<ExecOutput>,
    ) -> DockerResult<i64> {
        self.exec_streaming_inner(container_id, cmd, output).await
    }

    async fn stop_and_remove(&self, container_id: &str) -> DockerResult<()> {
        let stop_path = format!("/containers/{}/stop?t=10", container_id);
        let (status, bytes) = self.unary(Method::POST, &stop_path, None).await?;
        // Not running (304) and already gone (404) are both fine here.
        if status != StatusCode::NOT_MODIFIED && status != StatusCode::NOT_FOUND {
            self.ok_or_api_error(&stop_path, status, bytes)?;
        }

        self.force_remove(container_id).await
    }

    async fn force_remove(&self, container_id: &str) -> DockerResult<()> {
        let path = format!("/containers/{}?force=true", container_id);
        let (status, bytes) = self.unary(Method::DELETE, &path, None).await?;
        if status != StatusCode::NOT_FOUND {
            self.ok_or_api_error(&path, status, bytes)?;
        }
        debug!("Removed container {}", container_id);
        Ok(())
    }
}
