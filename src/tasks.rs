use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use crate::config::TasksConfig;
use crate::error::{TrackerError, TrackerResult};
use crate::types::TaskConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Where task documents are looked up.
pub trait TaskSource: Send + Sync {
    fn fetch_task(&self, task_id: &str) -> BoxFuture<'static, TrackerResult<TaskConfig>>;
}

/// Fixed task table, usually from `[[tasks.static_tasks]]`.
#[derive(Clone, Default)]
pub struct StaticTaskSource {
    tasks: Arc<HashMap<String, TaskConfig>>,
}

impl StaticTaskSource {
    pub fn new(tasks: impl IntoIterator<Item = TaskConfig>) -> Self {
        let tasks = tasks
            .into_iter()
            .map(|task| (task.task_id.clone(), task))
            .collect();
        Self {
            tasks: Arc::new(tasks),
        }
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskConfig> {
        self.tasks.get(task_id)
    }
}

impl TaskSource for StaticTaskSource {
    fn fetch_task(&self, task_id: &str) -> BoxFuture<'static, TrackerResult<TaskConfig>> {
        let found = self
            .get(task_id)
            .cloned()
            .ok_or_else(|| TrackerError::TaskNotFound(task_id.to_string()));
        Box::pin(async move { found })
    }
}

/// Client for the task-configuration service: `GET {base}/tasks/{id}`.
#[derive(Clone)]
pub struct HttpTaskSource {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl HttpTaskSource {
    pub fn new(api_base: &str, token: Option<String>) -> TrackerResult<Self> {
        let mut base = Url::parse(api_base)
            .map_err(|e| TrackerError::Config(format!("invalid tasks.api_base {api_base:?}: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, base, token })
    }

    fn task_url(&self, task_id: &str) -> TrackerResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| TrackerError::Config(format!("tasks.api_base {} cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(["tasks", task_id]);
        Ok(url)
    }
}

impl TaskSource for HttpTaskSource {
    fn fetch_task(&self, task_id: &str) -> BoxFuture<'static, TrackerResult<TaskConfig>> {
        let source = self.clone();
        let task_id = task_id.to_string();
        Box::pin(async move {
            let url = source.task_url(&task_id)?;
            let mut request = source.http.get(url.clone());
            if let Some(token) = &source.token {
                request = request.bearer_auth(token);
            }
            let response = request.send().await?;
            if let Some(err) = status_error(response.status(), &task_id) {
                return Err(err);
            }
            let task: TaskConfig = response.error_for_status()?.json().await?;
            debug!(task_id = %task.task_id, bid_type = ?task.bid_type, %url, "fetched task");
            Ok(task)
        })
    }
}

/// Map the statuses the dashboard must see as typed errors.
fn status_error(status: StatusCode, task_id: &str) -> Option<TrackerError> {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Some(TrackerError::Unauthorized(
            format!("task service rejected credentials ({status})"),
        )),
        StatusCode::NOT_FOUND => Some(TrackerError::TaskNotFound(task_id.to_string())),
        _ => None,
    }
}

/// Static table first, then the task service if one is configured.
pub struct ConfiguredTaskSource {
    fixed: StaticTaskSource,
    remote: Option<HttpTaskSource>,
}

impl ConfiguredTaskSource {
    pub fn from_config(config: &TasksConfig) -> TrackerResult<Self> {
        let remote = config
            .api_base
            .as_deref()
            .map(|base| HttpTaskSource::new(base, config.api_token.clone()))
            .transpose()?;
        Ok(Self {
            fixed: StaticTaskSource::new(config.static_tasks.iter().cloned()),
            remote,
        })
    }
}

impl TaskSource for ConfiguredTaskSource {
    fn fetch_task(&self, task_id: &str) -> BoxFuture<'static, TrackerResult<TaskConfig>> {
        match (self.fixed.get(task_id), &self.remote) {
            (Some(_), _) | (None, None) => self.fixed.fetch_task(task_id),
            (None, Some(remote)) => remote.fetch_task(task_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::types::{BidType, Marketplace};

    /// Minimal task service on a local port. Records the `Authorization`
    /// header of every request.
    async fn task_service() -> (String, Arc<Mutex<Vec<Option<String>>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/api", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let request = String::from_utf8_lossy(&buf).to_string();
                let path = request.split_whitespace().nth(1).unwrap_or("").to_string();
                let auth = request
                    .lines()
                    .filter_map(|l| l.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("authorization"))
                    .map(|(_, value)| value.trim().to_string());
                log.lock().unwrap().push(auth);

                let (status, body) = match path.as_str() {
                    "/api/tasks/T1" => (
                        "200 OK",
                        r#"{"_id":"T1","bidType":"TRAIT","selectedMarketplaces":["blur","opensea"]}"#,
                    ),
                    "/api/tasks/secret" => ("401 Unauthorized", r#"{"error":"unauthorized"}"#),
                    _ => ("404 Not Found", r#"{"error":"not found"}"#),
                };
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (base, seen)
    }

    fn task(task_id: &str) -> TaskConfig {
        TaskConfig {
            task_id: task_id.to_string(),
            bid_type: BidType::Token,
            selected_marketplaces: vec![Marketplace::Blur],
        }
    }

    #[tokio::test]
    async fn static_source_lookup() {
        let source = StaticTaskSource::new([task("T1")]);
        assert_eq!(source.fetch_task("T1").await.unwrap(), task("T1"));
        let err = source.fetch_task("T2").await.unwrap_err();
        assert!(matches!(err, TrackerError::TaskNotFound(id) if id == "T2"));
    }

    #[test]
    fn task_urls() {
        let source = HttpTaskSource::new("https://tasks.example.com/api", None).unwrap();
        assert_eq!(
            source.task_url("T1").unwrap().as_str(),
            "https://tasks.example.com/api/tasks/T1"
        );
        // Ids are percent-encoded as a single path segment.
        assert_eq!(
            source.task_url("a/b c").unwrap().as_str(),
            "https://tasks.example.com/api/tasks/a%2Fb%20c"
        );
        assert!(HttpTaskSource::new("not a url", None).is_err());
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, "T1"),
            Some(TrackerError::Unauthorized(_))
        ));
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, "T1"),
            Some(TrackerError::Unauthorized(_))
        ));
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, "T1"),
            Some(TrackerError::TaskNotFound(_))
        ));
        assert!(status_error(StatusCode::OK, "T1").is_none());
        assert!(status_error(StatusCode::INTERNAL_SERVER_ERROR, "T1").is_none());
    }

    #[tokio::test]
    async fn http_source_fetches_and_maps_statuses() {
        let (base, seen) = task_service().await;
        let source = HttpTaskSource::new(&base, Some("svc-token".into())).unwrap();

        let fetched = source.fetch_task("T1").await.unwrap();
        assert_eq!(
            fetched,
            TaskConfig {
                task_id: "T1".into(),
                bid_type: BidType::Trait,
                selected_marketplaces: vec![Marketplace::Blur, Marketplace::OpenSea],
            }
        );

        let err = source.fetch_task("missing").await.unwrap_err();
        assert!(matches!(err, TrackerError::TaskNotFound(id) if id == "missing"));

        let err = source.fetch_task("secret").await.unwrap_err();
        assert!(matches!(err, TrackerError::Unauthorized(_)));

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|auth| auth.as_deref() == Some("Bearer svc-token")));
    }

    #[tokio::test]
    async fn configured_source_falls_back_to_task_service() {
        let (base, _) = task_service().await;
        let config = TasksConfig {
            api_base: Some(base),
            api_token: None,
            static_tasks: vec![task("T2")],
        };
        let source = ConfiguredTaskSource::from_config(&config).unwrap();
        assert_eq!(source.fetch_task("T2").await.unwrap(), task("T2"));
        assert_eq!(source.fetch_task("T1").await.unwrap().bid_type, BidType::Trait);
        assert!(matches!(
            source.fetch_task("T3").await.unwrap_err(),
            TrackerError::TaskNotFound(_)
        ));
    }

    #[tokio::test]
    async fn configured_source_prefers_static_table() {
        let config = TasksConfig {
            api_base: None,
            api_token: None,
            static_tasks: vec![task("T1")],
        };
        let source = ConfiguredTaskSource::from_config(&config).unwrap();
        assert!(source.remote.is_none());
        assert_eq!(source.fetch_task("T1").await.unwrap().task_id, "T1");
        assert!(source.fetch_task("T9").await.is_err());

        let remote = TasksConfig {
            api_base: Some("http://127.0.0.1:9/".into()),
            ..config
        };
        let source = ConfiguredTaskSource::from_config(&remote).unwrap();
        assert!(source.remote.is_some());
        assert_eq!(source.fetch_task("T1").await.unwrap().task_id, "T1");
    }
}
