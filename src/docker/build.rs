//! Image build support: recipe tarball and NDJSON progress parsing

use std::collections::VecDeque;

use bytes::{Buf, BytesMut};
use http_body_util::BodyExt;
use hyper::Method;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use super::client::DockerClient;
use super::{DockerError, DockerResult, BUILD_PROGRESS_TAIL, STREAM_TIMEOUT_SECS};

/// One decoded line of the daemon's build output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    /// Human-readable progress text (`stream` key).
    Progress(String),
    /// Fatal build error (`errorDetail` key).
    Error(String),
    /// Image id (`aux.ID` or a successful-build marker).
    ImageId(String),
}

/// Incremental parser for the NDJSON build stream.
///
/// Chunks arrive on arbitrary boundaries; the buffer retains the trailing
/// incomplete line between pushes.
#[derive(Debug, Default)]
pub struct BuildProgressParser {
    buf: BytesMut,
}

impl BuildProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning the events decoded from every complete line.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<BuildEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            let line = String::from_utf8_lossy(&line[..pos]);
            Self::parse_line(line.trim_end_matches('\r'), &mut events);
        }

        events
    }

    /// Flush the trailing partial line at end of stream.
    pub fn finish(&mut self) -> Vec<BuildEvent> {
        let mut events = Vec::new();
        if !self.buf.is_empty() {
            let rest = self.buf.split();
            let line = String::from_utf8_lossy(&rest);
            Self::parse_line(line.trim(), &mut events);
        }
        events
    }

    fn parse_line(line: &str, events: &mut Vec<BuildEvent>) {
        if line.is_empty() {
            return;
        }
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(value) => value,
            // Not JSON: surface it as progress rather than dropping it.
            Err(_) => {
                events.push(BuildEvent::Progress(line.to_string()));
                return;
            }
        };

        if let Some(detail) = value.get("errorDetail") {
            let message = detail
                .get("message")
                .and_then(|m| m.as_str())
                .or_else(|| value.get("error").and_then(|e| e.as_str()))
                .unwrap_or("unknown build error");
            events.push(BuildEvent::Error(message.to_string()));
            return;
        }

        if let Some(id) = value
            .get("aux")
            .and_then(|aux| aux.get("ID"))
            .and_then(|id| id.as_str())
        {
            events.push(BuildEvent::ImageId(id.to_string()));
            return;
        }

        if let Some(text) = value.get("stream").and_then(|s| s.as_str()) {
            let trimmed = text.trim_end();
            if !trimmed.is_empty() {
                events.push(BuildEvent::Progress(trimmed.to_string()));
            }
            if let Some(id) = trimmed.strip_prefix("Successfully built ") {
                events.push(BuildEvent::ImageId(id.trim().to_string()));
            }
        }
    }
}

/// Wrap the recipe text as a single-entry uncompressed tar named
/// `Dockerfile`, the build context the daemon expects.
pub(crate) fn recipe_tarball(recipe: &str) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let data = recipe.as_bytes();

    let mut header = tar::Header::new_gnu();
    header.set_path("Dockerfile")?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();

    builder.append(&header, data)?;
    builder.into_inner()
}

impl DockerClient {
    /// POST /build with the recipe as a chunked tar stream, forwarding
    /// progress lines and returning the image id.
    pub(crate) async fn build_image_inner(
        &self,
        tag: &str,
        recipe: &str,
        progress: UnboundedSender<String>,
    ) -> DockerResult<String> {
        let path = format!("/build?t={}&dockerfile=Dockerfile", tag);
        let tarball = recipe_tarball(recipe)
            .map_err(|e| DockerError::Protocol(format!("failed to build tar context: {}", e)))?;

        let response = self
            .send_streaming(Method::POST, &path, "application/x-tar", tarball)
            .await?;

        let status = response.status();
        let mut body = response.into_body();

        if status.as_u16() >= 400 {
            let bytes = self.collect_body(body, &path).await?;
            return Err(self.api_error(&path, status, &bytes));
        }

        let mut parser = BuildProgressParser::new();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(BUILD_PROGRESS_TAIL);
        let mut image_id: Option<String> = None;

        loop {
            let frame = tokio::time::timeout(
                std::time::Duration::from_secs(STREAM_TIMEOUT_SECS),
                body.frame(),
            )
            .await
            .map_err(|_| DockerError::Timeout {
                path: path.clone(),
                seconds: STREAM_TIMEOUT_SECS,
            })?;

            let events = match frame {
                Some(Ok(frame)) => match frame.data_ref() {
                    Some(data) => parser.push(data.chunk()),
                    None => continue,
                },
                Some(Err(e)) => return Err(DockerError::transport(&path, e)),
                None => {
                    let events = parser.finish();
                    let done = self.apply_build_events(events, &progress, &mut tail, &mut image_id);
                    if let Some(message) = done {
                        return Err(DockerError::BuildFailed {
                            message,
                            progress: tail.into_iter().collect(),
                        });
                    }
                    break;
                }
            };

            if let Some(message) = self.apply_build_events(events, &progress, &mut tail, &mut image_id)
            {
                return Err(DockerError::BuildFailed {
                    message,
                    progress: tail.into_iter().collect(),
                });
            }
        }

        match image_id {
            Some(id) => {
                debug!("Built image {} for tag {}", id, tag);
                Ok(id)
            }
            None => Err(DockerError::BuildFailed {
                message: "build stream ended without an image id".to_string(),
                progress: tail.into_iter().collect(),
            }),
        }
    }

    /// Dispatch decoded events; returns the error message if the build
    /// failed. An `errorDetail` line is fatal regardless of earlier
    /// progress.
    fn apply_build_events(
        &self,
        events: Vec<BuildEvent>,
        progress: &UnboundedSender<String>,
        tail: &mut VecDeque<String>,
        image_id: &mut Option<String>,
    ) -> Option<String> {
        for event in events {
            match event {
                BuildEvent::Progress(line) => {
                    if tail.len() == BUILD_PROGRESS_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line.clone());
                    let _ = progress.send(line);
                }
                BuildEvent::ImageId(id) => *image_id = Some(id),
                BuildEvent::Error(message) => return Some(message),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_lines() {
        let mut parser = BuildProgressParser::new();
        let events = parser.push(b"{\"stream\":\"Step 1/5 : FROM node:20-bookworm\\n\"}\n");
        assert_eq!(
            events,
            vec![BuildEvent::Progress("Step 1/5 : FROM node:20-bookworm".to_string())]
        );
    }

    #[test]
    fn test_chunk_boundary_inside_line() {
        let mut parser = BuildProgressParser::new();
        assert!(parser.push(b"{\"stream\":\"Step 1").is_empty());
        let events = parser.push(b"/5 : FROM ubuntu\\n\"}\n{\"stream\":\"Step 2");
        assert_eq!(
            events,
            vec![BuildEvent::Progress("Step 1/5 : FROM ubuntu".to_string())]
        );
        let events = parser.push(b"\"}\n");
        assert_eq!(events, vec![BuildEvent::Progress("Step 2".to_string())]);
    }

    #[test]
    fn test_error_detail_is_fatal_over_stream() {
        let mut parser = BuildProgressParser::new();
        let events = parser.push(
            b"{\"stream\":\"ok so far\\n\"}\n{\"errorDetail\":{\"message\":\"manifest for ghost:1 not found\"},\"error\":\"manifest for ghost:1 not found\"}\n",
        );
        assert_eq!(
            events,
            vec![
                BuildEvent::Progress("ok so far".to_string()),
                BuildEvent::Error("manifest for ghost:1 not found".to_string()),
            ]
        );
    }

    #[test]
    fn test_aux_id_carries_image() {
        let mut parser = BuildProgressParser::new();
        let events = parser.push(b"{\"aux\":{\"ID\":\"sha256:deadbeef\"}}\n");
        assert_eq!(events, vec![BuildEvent::ImageId("sha256:deadbeef".to_string())]);
    }

    #[test]
    fn test_successfully_built_marker() {
        let mut parser = BuildProgressParser::new();
        let events = parser.push(b"{\"stream\":\"Successfully built abc123def\\n\"}\n");
        assert_eq!(
            events,
            vec![
                BuildEvent::Progress("Successfully built abc123def".to_string()),
                BuildEvent::ImageId("abc123def".to_string()),
            ]
        );
    }

    #[test]
    fn test_finish_flushes_partial_line() {
        let mut parser = BuildProgressParser::new();
        assert!(parser.push(b"{\"aux\":{\"ID\":\"sha256:feed\"}}").is_empty());
        let events = parser.finish();
        assert_eq!(events, vec![BuildEvent::ImageId("sha256:feed".to_string())]);
    }

    #[test]
    fn test_recipe_tarball_single_entry() {
        let tarball = recipe_tarball("FROM ubuntu:24.04\n").unwrap();
        let mut archive = tar::Archive::new(&tarball[..]);
        let mut entries = archive.entries().unwrap();

        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str(), Some("Dockerfile"));
        let mut content = String::new();
        std::io::Read::read_to_string(&mut entry, &mut content).unwrap();
        assert_eq!(content, "FROM ubuntu:24.04\n");

        assert!(entries.next().is_none());
    }
}
