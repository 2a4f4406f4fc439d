//! Docker Engine API client over the daemon's Unix socket.
//!
//! Only the exec endpoints are spoken here. Requests are raw HTTP/1.1 on a
//! fresh `UnixStream` each; `exec start` upgrades the connection and the
//! socket itself becomes the session's stream.

use std::path::{Path, PathBuf};

use hgr_types::{HangarError, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

use super::runtime::{ExecSpec, ExecState, ExecStream};

const API_PREFIX: &str = "/v1.41";

/// Status line and headers of an HTTP response.
#[derive(Debug)]
struct ResponseHead {
    status: u16,
    headers: Vec<(String, String)>,
}

impl ResponseHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    fn content_length(&self) -> Option<usize> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }
}

#[derive(Debug)]
struct Response {
    status: u16,
    body: Vec<u8>,
}

impl Response {
    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The `message` field of a Docker error body, or the raw body.
    fn message(&self) -> String {
        serde_json::from_slice::<Value>(&self.body)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| String::from_utf8_lossy(&self.body).trim().to_string())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExecCreated {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExecInspect {
    running: bool,
    exit_code: Option<i64>,
}

/// Client for the Docker Engine API.
#[derive(Debug, Clone)]
pub struct EngineClient {
    socket_path: PathBuf,
}

impl EngineClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn create_exec(&self, container: &str, spec: &ExecSpec) -> Result<String> {
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let body = json!({
            "AttachStdin": spec.attach_stdin,
            "AttachStdout": true,
            "AttachStderr": true,
            "Tty": spec.tty,
            "Env": env,
            "Cmd": spec.cmd,
            "WorkingDir": spec.working_dir,
        });
        let path = format!("{API_PREFIX}/containers/{container}/exec");
        let resp = self.request("POST", &path, Some(&body)).await?;
        match resp.status {
            404 => Err(HangarError::NotFound(format!(
                "container {container}: {}",
                resp.message()
            ))),
            _ if resp.is_success() => {
                let created: ExecCreated = serde_json::from_slice(&resp.body)?;
                debug!(container, exec_id = %created.id, "Exec created");
                Ok(created.id)
            }
            status => Err(HangarError::Container(format!(
                "exec create failed with status {status}: {}",
                resp.message()
            ))),
        }
    }

    /// Start an exec session and take over the connection.
    pub async fn start_exec(&self, exec_id: &str, tty: bool) -> Result<ExecStream> {
        let body = json!({ "Detach": false, "Tty": tty });
        let path = format!("{API_PREFIX}/exec/{exec_id}/start");
        let mut reader = self
            .send("POST", &path, Some(&body), &["Connection: Upgrade", "Upgrade: tcp"])
            .await?;
        let head = read_head(&mut reader).await?;

        match head.status {
            // 200 means the daemon did not switch protocols but still streams
            // on this connection.
            101 | 200 => {
                debug!(exec_id, status = head.status, "Exec attached");
                Ok(Box::new(reader))
            }
            404 => Err(HangarError::NotFound(format!("exec {exec_id}"))),
            status => {
                let body = read_body(&mut reader, &head).await.unwrap_or_default();
                let resp = Response { status, body };
                Err(HangarError::Container(format!(
                    "exec start failed with status {status}: {}",
                    resp.message()
                )))
            }
        }
    }

    pub async fn resize_exec(&self, exec_id: &str, height: u16, width: u16) -> Result<()> {
        let path = format!("{API_PREFIX}/exec/{exec_id}/resize?h={height}&w={width}");
        let resp = self.request("POST", &path, None).await?;
        match resp.status {
            404 => Err(HangarError::NotFound(format!("exec {exec_id}"))),
            _ if resp.is_success() => Ok(()),
            status => Err(HangarError::Container(format!(
                "exec resize failed with status {status}: {}",
                resp.message()
            ))),
        }
    }

    pub async fn inspect_exec(&self, exec_id: &str) -> Result<ExecState> {
        let path = format!("{API_PREFIX}/exec/{exec_id}/json");
        let resp = self.request("GET", &path, None).await?;
        match resp.status {
            404 => Err(HangarError::NotFound(format!("exec {exec_id}"))),
            _ if resp.is_success() => {
                let inspect: ExecInspect = serde_json::from_slice(&resp.body)?;
                Ok(ExecState {
                    running: inspect.running,
                    exit_code: inspect.exit_code,
                })
            }
            status => Err(HangarError::Container(format!(
                "exec inspect failed with status {status}: {}",
                resp.message()
            ))),
        }
    }

    async fn request(&self, method: &str, path: &str, body: Option<&Value>) -> Result<Response> {
        let mut reader = self.send(method, path, body, &["Connection: close"]).await?;
        let head = read_head(&mut reader).await?;
        let body = read_body(&mut reader, &head).await?;
        Ok(Response {
            status: head.status,
            body,
        })
    }

    async fn send(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
        extra_headers: &[&str],
    ) -> Result<BufReader<UnixStream>> {
        let body = match body {
            Some(v) => serde_json::to_vec(v)?,
            None => Vec::new(),
        };

        let mut request = format!("{method} {path} HTTP/1.1\r\nHost: docker\r\n");
        if !body.is_empty() {
            request.push_str("Content-Type: application/json\r\n");
        }
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
        for header in extra_headers {
            request.push_str(header);
            request.push_str("\r\n");
        }
        request.push_str("\r\n");

        let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            HangarError::Transport(format!(
                "Failed to connect to Docker socket at {}: {e}",
                self.socket_path.display()
            ))
        })?;
        stream.write_all(request.as_bytes()).await?;
        stream.write_all(&body).await?;
        stream.flush().await?;

        Ok(BufReader::new(stream))
    }
}

async fn read_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<ResponseHead> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(HangarError::Transport("Empty response from Docker".to_string()));
    }
    let status = line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| HangarError::Transport(format!("Malformed status line: {}", line.trim())))?;

    let mut headers = Vec::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err(HangarError::Transport("Response ended inside headers".to_string()));
        }
        let trimmed = line.trim_end_matches(&['\r', '\n'][..]);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(ResponseHead { status, headers })
}

async fn read_body<R: AsyncBufRead + Unpin>(reader: &mut R, head: &ResponseHead) -> Result<Vec<u8>> {
    if head.status == 204 || head.status == 304 {
        return Ok(Vec::new());
    }

    let mut body = Vec::new();
    if head.is_chunked() {
        let mut line = String::new();
        loop {
            line.clear();
            reader.read_line(&mut line).await?;
            let size_field = line.trim().split(';').next().unwrap_or("");
            let size = usize::from_str_radix(size_field, 16).map_err(|_| {
                HangarError::Transport(format!("Bad chunk size: {:?}", line.trim()))
            })?;
            if size == 0 {
                // Trailers until the blank line.
                loop {
                    line.clear();
                    if reader.read_line(&mut line).await? == 0 || line.trim().is_empty() {
                        break;
                    }
                }
                break;
            }
            let start = body.len();
            body.resize(start + size, 0);
            reader.read_exact(&mut body[start..]).await?;
            line.clear();
            reader.read_line(&mut line).await?;
        }
    } else if let Some(len) = head.content_length() {
        body.resize(len, 0);
        reader.read_exact(&mut body).await?;
    } else {
        reader.read_to_end(&mut body).await?;
    }
    Ok(body)
}
