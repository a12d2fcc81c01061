use super::upload::{progress_stream, ProgressReporter};
use super::{Backend, BackendFuture};
use crate::error::BackendError;
use crate::model::{AccountSecret, ClientConfig, FileHandle, RunConfig, ServerMessage};
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Response, Url};
use tracing::{debug, info};

const UPLOAD_PATH: &str = "/upload";
const ROSTER_PATH: &str = "/mnemonics";
const SET_CONFIG_PATH: &str = "/set-config";
const EXECUTE_PATH: &str = "/execute";

/// reqwest-backed client for the batch backend.
#[derive(Clone)]
pub struct HttpBackend {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpBackend {
    pub fn new(cfg: &ClientConfig) -> Result<Self, BackendError> {
        let base_url = Url::parse(&cfg.base_url).map_err(|e| BackendError::InvalidUrl {
            url: cfg.base_url.clone(),
            reason: e.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(BackendError::InvalidUrl {
                url: cfg.base_url.clone(),
                reason: "not a base url".into(),
            });
        }

        let mut builder = reqwest::Client::builder().user_agent(cfg.user_agent.clone());
        if let Some(timeout) = cfg.http_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|source| BackendError::Transport {
                path: "client",
                source,
            })?;

        Ok(Self { http, base_url })
    }

    /// Resolve an API path against the base URL, keeping any path prefix it carries.
    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        let prefix = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{prefix}{path}"));
        url
    }

    async fn upload_file(
        &self,
        file: FileHandle,
        progress: ProgressReporter,
    ) -> Result<ServerMessage, BackendError> {
        let data = tokio::fs::read(&file.path)
            .await
            .map_err(|source| BackendError::ReadFile {
                path: file.path.display().to_string(),
                source,
            })?;
        let total = data.len() as u64;
        info!(file = %file.name, bytes = total, "uploading mnemonic spreadsheet");

        let body = reqwest::Body::wrap_stream(progress_stream(Bytes::from(data), progress));
        let part = Part::stream_with_length(body, total).file_name(file.name.clone());
        let form = Form::new().part("file", part);

        let resp = self
            .http
            .post(self.endpoint(UPLOAD_PATH))
            .multipart(form)
            .send()
            .await
            .map_err(|source| BackendError::Transport {
                path: UPLOAD_PATH,
                source,
            })?;
        read_text(UPLOAD_PATH, resp).await
    }

    async fn get_roster(&self) -> Result<Vec<AccountSecret>, BackendError> {
        let resp = self
            .http
            .get(self.endpoint(ROSTER_PATH))
            .send()
            .await
            .map_err(|source| BackendError::Transport {
                path: ROSTER_PATH,
                source,
            })?;
        let resp = check_status(ROSTER_PATH, resp).await?;
        let body = resp.bytes().await.map_err(|source| BackendError::Transport {
            path: ROSTER_PATH,
            source,
        })?;
        let roster: Vec<AccountSecret> =
            serde_json::from_slice(&body).map_err(|source| BackendError::Decode {
                path: ROSTER_PATH,
                source,
            })?;
        debug!(entries = roster.len(), "roster fetched");
        Ok(roster)
    }

    async fn post_config(&self, config: RunConfig) -> Result<ServerMessage, BackendError> {
        info!(
            batch_size = config.batch_size,
            max_transaction_count = config.max_transaction_count,
            max_failure_count = config.max_failure_count,
            "submitting run config"
        );
        let resp = self
            .http
            .post(self.endpoint(SET_CONFIG_PATH))
            .json(&config)
            .send()
            .await
            .map_err(|source| BackendError::Transport {
                path: SET_CONFIG_PATH,
                source,
            })?;
        read_text(SET_CONFIG_PATH, resp).await
    }

    async fn get_execute(&self) -> Result<ServerMessage, BackendError> {
        let resp = self
            .http
            .get(self.endpoint(EXECUTE_PATH))
            .send()
            .await
            .map_err(|source| BackendError::Transport {
                path: EXECUTE_PATH,
                source,
            })?;
        read_text(EXECUTE_PATH, resp).await
    }
}

impl Backend for HttpBackend {
    fn upload(
        &self,
        file: FileHandle,
        progress: ProgressReporter,
    ) -> BackendFuture<'_, ServerMessage> {
        Box::pin(self.upload_file(file, progress))
    }

    fn fetch_roster(&self) -> BackendFuture<'_, Vec<AccountSecret>> {
        Box::pin(self.get_roster())
    }

    fn submit_config(&self, config: RunConfig) -> BackendFuture<'_, ServerMessage> {
        Box::pin(self.post_config(config))
    }

    fn trigger_execution(&self) -> BackendFuture<'_, ServerMessage> {
        Box::pin(self.get_execute())
    }
}

async fn check_status(path: &'static str, resp: Response) -> Result<Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    // Best effort: the body usually carries the backend's reason.
    let body = resp.text().await.unwrap_or_default();
    Err(BackendError::Status {
        path,
        status: status.as_u16(),
        body: body.trim().to_string(),
    })
}

async fn read_text(path: &'static str, resp: Response) -> Result<ServerMessage, BackendError> {
    let resp = check_status(path, resp).await?;
    resp.text()
        .await
        .map_err(|source| BackendError::Transport { path, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    fn backend(base: &str) -> HttpBackend {
        HttpBackend::new(&ClientConfig {
            base_url: base.into(),
            ..ClientConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn endpoints_resolve_against_base_url() {
        let b = backend("http://localhost:3000");
        assert_eq!(
            b.endpoint(UPLOAD_PATH).as_str(),
            "http://localhost:3000/upload"
        );
        assert_eq!(
            b.endpoint(SET_CONFIG_PATH).as_str(),
            "http://localhost:3000/set-config"
        );
    }

    #[test]
    fn endpoints_keep_base_path_prefix() {
        let b = backend("https://batch.example.com/api/");
        assert_eq!(
            b.endpoint(ROSTER_PATH).as_str(),
            "https://batch.example.com/api/mnemonics"
        );
    }

    #[test]
    fn rejects_unparseable_base_url() {
        let err = HttpBackend::new(&ClientConfig {
            base_url: "localhost:3000 nope".into(),
            ..ClientConfig::default()
        })
        .err()
        .unwrap();
        assert!(matches!(err, BackendError::InvalidUrl { .. }));
    }

    /// Answer one request with `status` and `body`. The task yields the raw request bytes.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let request = read_request(&mut sock).await;
            let reply = format!(
                "HTTP/1.1 {status}\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            sock.write_all(reply.as_bytes()).await.unwrap();
            let _ = sock.shutdown().await;
            request
        });
        (base, handle)
    }

    async fn read_request(sock: &mut TcpStream) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        while !request_complete(&buf) {
            let n = sock.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        buf
    }

    fn request_complete(buf: &[u8]) -> bool {
        let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
        let body = &buf[head_end + 4..];
        let content_length = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok());
        match content_length {
            Some(len) => body.len() >= len,
            None if head.contains("transfer-encoding: chunked") => body.ends_with(b"0\r\n\r\n"),
            None => true,
        }
    }

    fn request_body(raw: &[u8]) -> String {
        let text = String::from_utf8_lossy(raw);
        text.split_once("\r\n\r\n")
            .map(|(_, body)| body.to_string())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn upload_sends_file_field_and_maps_error_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.xlsx");
        std::fs::write(&path, "mnemonic sheet bytes").unwrap();

        let (base, server) = serve_once("500 Internal Server Error", "bad sheet\n").await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let err = backend(&base)
            .upload(FileHandle::from_path(&path), ProgressReporter::new(4, tx))
            .await
            .unwrap_err();

        match err {
            BackendError::Status { path, status, body } => {
                assert_eq!(path, UPLOAD_PATH);
                assert_eq!(status, 500);
                assert_eq!(body, "bad sheet");
            }
            other => panic!("expected status error, got {other:?}"),
        }

        let raw = String::from_utf8_lossy(&server.await.unwrap()).into_owned();
        assert!(raw.starts_with("POST /upload HTTP/1.1"));
        assert!(raw.contains(r#"name="file"; filename="accounts.xlsx""#));
        assert!(raw.contains("mnemonic sheet bytes"));

        let mut last = None;
        while let Ok(tick) = rx.try_recv() {
            assert_eq!(tick.attempt, 4);
            last = Some(tick.percent);
        }
        assert_eq!(last, Some(100));
    }

    #[tokio::test]
    async fn upload_returns_server_message() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.xlsx");
        std::fs::write(&path, "x").unwrap();

        let (base, server) = serve_once("200 OK", "File uploaded successfully").await;
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let msg = backend(&base)
            .upload(FileHandle::from_path(&path), ProgressReporter::new(1, tx))
            .await
            .unwrap();
        assert_eq!(msg, "File uploaded successfully");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn set_config_posts_camel_case_json() {
        let (base, server) = serve_once("200 OK", "Config updated").await;
        let zeros = RunConfig {
            batch_size: 0,
            max_transaction_count: 0,
            max_failure_count: 0,
        };
        let msg = backend(&base)
            .submit_config(zeros.with_floors())
            .await
            .unwrap();
        assert_eq!(msg, "Config updated");

        let raw = server.await.unwrap();
        let head = String::from_utf8_lossy(&raw).to_ascii_lowercase();
        assert!(head.starts_with("post /set-config http/1.1"));
        assert!(head.contains("content-type: application/json"));
        assert_eq!(
            request_body(&raw),
            r#"{"batchSize":2,"maxTransactionCount":3,"maxFailureCount":1}"#
        );
    }

    #[tokio::test]
    async fn roster_decodes_string_array() {
        let (base, server) = serve_once("200 OK", r#"["alpha beta","gamma delta"]"#).await;
        let roster = backend(&base).fetch_roster().await.unwrap();
        assert_eq!(roster, ["alpha beta", "gamma delta"]);
        let raw = String::from_utf8_lossy(&server.await.unwrap()).into_owned();
        assert!(raw.starts_with("GET /mnemonics HTTP/1.1"));
    }

    #[tokio::test]
    async fn roster_rejects_non_array_body() {
        let (base, server) = serve_once("200 OK", r#"{"error":"no sheet"}"#).await;
        let err = backend(&base).fetch_roster().await.unwrap_err();
        assert!(matches!(
            err,
            BackendError::Decode {
                path: ROSTER_PATH,
                ..
            }
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn execute_is_a_get_returning_text() {
        let (base, server) = serve_once("200 OK", "Execution started").await;
        let msg = backend(&base).trigger_execution().await.unwrap();
        assert_eq!(msg, "Execution started");
        let raw = String::from_utf8_lossy(&server.await.unwrap()).into_owned();
        assert!(raw.starts_with("GET /execute HTTP/1.1"));
    }

    #[tokio::test]
    async fn missing_file_fails_before_any_request() {
        let b = backend("http://127.0.0.1:9");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let err = b
            .upload(
                FileHandle::from_path("/definitely/not/here.xlsx"),
                ProgressReporter::new(1, tx),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::ReadFile { .. }));
        assert!(rx.try_recv().is_err());
    }
}
