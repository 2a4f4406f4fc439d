//! HTTP client for the control plane.

use std::time::Duration;

use async_trait::async_trait;
use hgr_config::Config;
use hgr_types::{Arch, Assignment, CompletionReport, HangarError, Os, Result, WorkRequest};
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Where new work comes from.
#[async_trait]
pub trait WorkSource: Send + Sync {
    /// Ask for one workload fitting `request`; `None` when nothing matches.
    async fn request_work(&self, request: &WorkRequest) -> Result<Option<Assignment>>;

    /// Download the gzip+tar archive of a workload.
    async fn fetch_archive(&self, id: Uuid) -> Result<Vec<u8>>;
}

/// Where run outcomes go.
#[async_trait]
pub trait CompletionUploader: Send + Sync {
    async fn upload_completion(&self, report: &CompletionReport) -> Result<()>;
}

/// A workload to submit, minus its archive.
#[derive(Debug, Clone)]
pub struct Submission {
    pub entry: String,
    pub allow_shared: bool,
    /// Milliseconds.
    pub ttl: u64,
    pub cores: u32,
    pub memory: u64,
    pub arch: Arch,
    pub os: Os,
    pub vcs_uri: String,
}

impl Submission {
    fn into_form(self, archive: Vec<u8>) -> Result<Form> {
        let archive = Part::bytes(archive)
            .file_name("archive.tar.gz")
            .mime_str("application/gzip")
            .map_err(|e| HangarError::Transport(format!("Bad archive part: {e}")))?;
        Ok(Form::new()
            .text("entry", self.entry)
            .text("allow_shared", self.allow_shared.to_string())
            .text("ttl", self.ttl.to_string())
            .text("cores", self.cores.to_string())
            .text("memory", self.memory.to_string())
            .text("arch", self.arch.to_string())
            .text("os", self.os.to_string())
            .text("vcs_uri", self.vcs_uri)
            .part("archive", archive))
    }
}

#[derive(Deserialize)]
struct Enqueued {
    id: Uuid,
}

pub struct ControlPlane {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ControlPlane {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| HangarError::Transport(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.control_plane_url, config.control_plane_token.clone())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> Result<Response> {
        self.authed(builder)
            .send()
            .await
            .map_err(|e| HangarError::Transport(format!("{what}: {e}")))
    }

    /// Upload a new workload and return its id.
    pub async fn enqueue(&self, submission: Submission, archive: Vec<u8>) -> Result<Uuid> {
        let size = archive.len();
        let form = submission.into_form(archive)?;
        let resp = self
            .send(
                self.client.post(self.url("/v1/workloads")).multipart(form),
                "Enqueue",
            )
            .await?;
        let resp = check_status(resp, "Enqueue").await?;
        let enqueued: Enqueued = resp
            .json()
            .await
            .map_err(|e| HangarError::Transport(format!("Enqueue response: {e}")))?;
        info!(id = %enqueued.id, bytes = size, "Workload submitted");
        Ok(enqueued.id)
    }
}

#[async_trait]
impl WorkSource for ControlPlane {
    async fn request_work(&self, request: &WorkRequest) -> Result<Option<Assignment>> {
        let resp = self
            .send(
                self.client
                    .post(self.url("/v1/workloads/dequeue"))
                    .json(request),
                "Dequeue",
            )
            .await?;
        if resp.status() == StatusCode::NO_CONTENT {
            debug!("No matching work");
            return Ok(None);
        }
        let resp = check_status(resp, "Dequeue").await?;
        let assignment: Assignment = resp
            .json()
            .await
            .map_err(|e| HangarError::Transport(format!("Dequeue response: {e}")))?;
        Ok(Some(assignment))
    }

    async fn fetch_archive(&self, id: Uuid) -> Result<Vec<u8>> {
        let what = format!("Archive {id}");
        let resp = self
            .send(
                self.client.get(self.url(&format!("/v1/workloads/{id}/archive"))),
                &what,
            )
            .await?;
        let resp = check_status(resp, &what).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| HangarError::Transport(format!("{what}: {e}")))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl CompletionUploader for ControlPlane {
    async fn upload_completion(&self, report: &CompletionReport) -> Result<()> {
        let logs = Part::bytes(report.logs.clone())
            .file_name("logs.txt")
            .mime_str("text/plain")
            .map_err(|e| HangarError::Transport(format!("Bad logs part: {e}")))?;
        let analytics = Part::bytes(report.analytics.clone())
            .file_name("analytics.db")
            .mime_str("application/octet-stream")
            .map_err(|e| HangarError::Transport(format!("Bad analytics part: {e}")))?;
        let form = Form::new()
            .text("duration", report.duration_ms().to_string())
            .text("successful", report.successful.to_string())
            .part("logs", logs)
            .part("analytics", analytics);

        let what = format!("Completion {}", report.workload_id);
        let url = self.url(&format!("/v1/workloads/{}/completion", report.workload_id));
        let resp = self
            .send(self.client.post(url).multipart(form), &what)
            .await?;
        check_status(resp, &what).await?;
        Ok(())
    }
}

async fn check_status(resp: Response, what: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let err = format!("{what} failed with status {status}: {}", body.trim());
    if status == StatusCode::NOT_FOUND {
        Err(HangarError::NotFound(err))
    } else {
        Err(HangarError::Transport(err))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    use super::*;

    /// Answer one HTTP request with `status` and `body`; return the raw request.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut request = String::new();
            let mut len = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                if let Some(v) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    len = v.trim().parse().unwrap();
                }
                request.push_str(&line);
                if line == "\r\n" {
                    break;
                }
            }
            let mut body_buf = vec![0u8; len];
            reader.read_exact(&mut body_buf).await.unwrap();
            request.push_str(&String::from_utf8_lossy(&body_buf));

            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            reader.get_mut().write_all(response.as_bytes()).await.unwrap();
            reader.get_mut().shutdown().await.unwrap();
            request
        });
        (format!("http://{addr}"), handle)
    }

    fn request() -> WorkRequest {
        WorkRequest {
            os: Os::Linux,
            arch: Arch::Amd64,
            cores: 4,
            memory: 8 << 30,
        }
    }

    #[tokio::test]
    async fn no_content_means_no_work() {
        let (url, server) = serve_once("204 No Content", "").await;
        let cp = ControlPlane::new(&url, Some("secret".into())).unwrap();
        assert!(cp.request_work(&request()).await.unwrap().is_none());

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /v1/workloads/dequeue"));
        assert!(raw.to_ascii_lowercase().contains("authorization: bearer secret"));
        assert!(raw.contains(r#""arch":"amd64""#));
    }

    #[tokio::test]
    async fn assignment_is_parsed() {
        let body = r#"{"workload":{"id":"00000000-0000-0000-0000-000000000001","entry":"main.wasm","ttl":3600000,"cores":1,"memory":536870912,"arch":"amd64","os":"linux"},"token":"tok"}"#;
        let (url, _server) = serve_once("200 OK", body).await;
        let cp = ControlPlane::new(&url, None).unwrap();
        let assignment = cp.request_work(&request()).await.unwrap().unwrap();
        assert_eq!(assignment.workload.entry, "main.wasm");
        assert_eq!(assignment.token, "tok");
    }

    #[tokio::test]
    async fn completion_is_multipart() {
        let (url, server) = serve_once("200 OK", "{}").await;
        let cp = ControlPlane::new(&url, None).unwrap();
        let report = CompletionReport {
            workload_id: Uuid::nil(),
            duration: Duration::from_millis(1500),
            successful: false,
            cause: Some("exit 2".into()),
            logs: b"hello".to_vec(),
            analytics: vec![1, 2, 3],
        };
        cp.upload_completion(&report).await.unwrap();

        let raw = server.await.unwrap();
        assert!(raw.starts_with(&format!("POST /v1/workloads/{}/completion", Uuid::nil())));
        assert!(raw.contains("multipart/form-data"));
        assert!(raw.contains(r#"name="duration""#));
        assert!(raw.contains("1500"));
        assert!(raw.contains(r#"name="successful""#));
        assert!(raw.contains("false"));
        assert!(raw.contains(r#"name="logs""#));
        assert!(raw.contains(r#"name="analytics""#));
    }

    #[tokio::test]
    async fn enqueue_returns_id_and_sends_fields() {
        let (url, server) =
            serve_once("201 Created", r#"{"id":"00000000-0000-0000-0000-000000000002"}"#).await;
        let cp = ControlPlane::new(&url, None).unwrap();
        let id = cp
            .enqueue(
                Submission {
                    entry: "main.wasm".into(),
                    allow_shared: true,
                    ttl: 60_000,
                    cores: 1,
                    memory: 1 << 29,
                    arch: Arch::Arm64,
                    os: Os::Linux,
                    vcs_uri: "https://git.example/repo".into(),
                },
                b"tgz".to_vec(),
            )
            .await
            .unwrap();
        assert_eq!(id.as_u128(), 2);

        let raw = server.await.unwrap();
        for field in ["entry", "allow_shared", "ttl", "cores", "memory", "arch", "os", "vcs_uri", "archive"] {
            assert!(raw.contains(&format!(r#"name="{field}""#)), "missing {field}");
        }
        assert!(raw.contains("arm64"));
    }

    #[tokio::test]
    async fn server_error_is_transport_error() {
        let (url, _server) = serve_once("500 Internal Server Error", "boom").await;
        let cp = ControlPlane::new(&url, None).unwrap();
        let err = cp.fetch_archive(Uuid::nil()).await.unwrap_err();
        assert!(matches!(err, HangarError::Transport(m) if m.contains("500")));
    }
}
