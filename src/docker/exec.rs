//! Exec streaming: HTTP upgrade and multiplexed frame decoding
//!
//! After the upgrade the byte stream carries frames of the form
//! `[type:1][reserved:3][size:4 BE][payload:size]`. The decoder keeps all
//! payload bytes in byte buffers; nothing on this path goes through a
//! string until the runner's line buffering.

use bytes::{Buf, Bytes, BytesMut};
use futures_util::StreamExt;
use hyper::header::{CONNECTION, CONTENT_TYPE, UPGRADE};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::codec::{Decoder, FramedRead};
use tracing::debug;

use super::client::DockerClient;
use super::types::{CreateExecRequest, ExecInspect, IdResponse, StartExecRequest};
use super::{DockerError, DockerResult, STREAM_TIMEOUT_SECS};

/// Which demultiplexed stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn from_header_byte(byte: u8) -> Self {
        // 0 = stdin echo, 1 = stdout, 2 = stderr; anything unknown is
        // treated as stdout.
        if byte == 2 {
            StreamKind::Stderr
        } else {
            StreamKind::Stdout
        }
    }
}

/// One decoded frame of container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxFrame {
    pub stream: StreamKind,
    pub data: Bytes,
}

/// Output chunk type forwarded to the runner.
pub type ExecOutput = MuxFrame;

const HEADER_LEN: usize = 8;

/// Decoder for the daemon's stdout/stderr multiplexing.
#[derive(Debug, Default)]
pub struct MuxCodec;

impl Decoder for MuxCodec {
    type Item = MuxFrame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<MuxFrame>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let kind = StreamKind::from_header_byte(src[0]);
        let size = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;

        if src.len() < HEADER_LEN + size {
            src.reserve(HEADER_LEN + size - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let data = src.split_to(size).freeze();
        Ok(Some(MuxFrame { stream: kind, data }))
    }

    /// A short read at end of stream flushes the partial payload to the
    /// best-guess sink: the header's stream type when the header arrived
    /// in full, stdout otherwise.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<MuxFrame>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }

        let frame = if src.len() > HEADER_LEN {
            let kind = StreamKind::from_header_byte(src[0]);
            src.advance(HEADER_LEN);
            MuxFrame {
                stream: kind,
                data: src.split().freeze(),
            }
        } else {
            MuxFrame {
                stream: StreamKind::Stdout,
                data: src.split().freeze(),
            }
        };
        Ok(Some(frame))
    }
}

impl DockerClient {
    /// Create an exec, start it over an upgraded connection, stream the
    /// demultiplexed frames to `output`, and fetch the exit code.
    pub(crate) async fn exec_streaming_inner(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        output: UnboundedSender<ExecOutput>,
    ) -> DockerResult<i64> {
        let create_path = format!("/containers/{}/exec", container_id);
        let create = CreateExecRequest {
            attach_stdout: true,
            attach_stderr: true,
            tty: false,
            cmd: cmd.iter().map(String::as_str).collect(),
            user: None,
            env: Vec::new(),
            working_dir: None,
        };
        let body = serde_json::to_value(&create)
            .map_err(|e| DockerError::Protocol(e.to_string()))?;

        let (status, bytes) = self.unary(Method::POST, &create_path, Some(body)).await?;
        if status == StatusCode::NOT_FOUND {
            return Err(DockerError::ContainerNotFound(container_id.to_string()));
        }
        let bytes = self.ok_or_api_error(&create_path, status, bytes)?;
        let exec: IdResponse = serde_json::from_slice(&bytes)
            .map_err(|e| DockerError::Protocol(format!("exec create response: {}", e)))?;

        let start_path = format!("/exec/{}/start", exec.id);
        let start = StartExecRequest {
            detach: false,
            tty: false,
        };
        let start_body = serde_json::to_vec(&start)
            .map_err(|e| DockerError::Protocol(e.to_string()))?;

        let request = Request::builder()
            .method(Method::POST)
            .uri(self.uri(&start_path))
            .header(CONTENT_TYPE, "application/json")
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "tcp")
            .body(Self::full_body(start_body))
            .map_err(|e| DockerError::transport(&start_path, e))?;

        let response = self.send(request, &start_path).await?;
        let status = response.status();
        if status != StatusCode::SWITCHING_PROTOCOLS && status != StatusCode::OK {
            let bytes = self.collect_body(response.into_body(), &start_path).await?;
            return Err(self.api_error(&start_path, status, &bytes));
        }

        let upgraded = hyper::upgrade::on(response)
            .await
            .map_err(|e| DockerError::transport(&start_path, e))?;

        debug!("Attached to exec {} on container {}", exec.id, container_id);

        let mut frames = FramedRead::new(TokioIo::new(upgraded), MuxCodec);
        loop {
            let next = tokio::time::timeout(
                std::time::Duration::from_secs(STREAM_TIMEOUT_SECS),
                frames.next(),
            )
            .await
            .map_err(|_| DockerError::Timeout {
                path: start_path.clone(),
                seconds: STREAM_TIMEOUT_SECS,
            })?;

            match next {
                Some(Ok(frame)) => {
                    // Receiver gone means the runner is shutting down; stop
                    // draining.
                    if output.send(frame).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => return Err(DockerError::transport(&start_path, e)),
                None => break,
            }
        }
        drop(frames);

        let inspect_path = format!("/exec/{}/json", exec.id);
        let (status, bytes) = self.unary(Method::GET, &inspect_path, None).await?;
        let bytes = self.ok_or_api_error(&inspect_path, status, bytes)?;
        let inspect: ExecInspect = serde_json::from_slice(&bytes)
            .map_err(|e| DockerError::Protocol(format!("exec inspect response: {}", e)))?;

        Ok(inspect.exit_code.unwrap_or(-1))
    }
}
