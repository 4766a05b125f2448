//! GitHub repository webhook registration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::Credentials;
use crate::error::{ControllerError, ControllerResult};
use crate::hook::WebhookSecret;

/// Path the controller serves webhooks on; also how its hooks are recognised.
pub const HOOK_PATH: &str = "ecs_runner_hook";

const GITHUB_API: &str = "https://api.github.com";
const GITHUB_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Hook {
    pub id: u64,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub events: Vec<String>,
    pub config: HookConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HookConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateHook<'a> {
    name: &'static str,
    active: bool,
    events: [&'static str; 1],
    config: CreateHookConfig<'a>,
}

#[derive(Debug, Serialize)]
struct CreateHookConfig<'a> {
    url: &'a str,
    content_type: &'static str,
    secret: &'a str,
}

/// Points the repository's `workflow_job` webhook at this controller.
#[derive(Debug)]
pub struct WebhookRegistrar {
    http: reqwest::Client,
    api_base: String,
    owner: String,
    repo: String,
    token: String,
    secret: WebhookSecret,
}

impl WebhookRegistrar {
    pub fn new(credentials: &Credentials) -> ControllerResult<Self> {
        Self::with_api_base(credentials, GITHUB_API)
    }

    pub fn with_api_base(credentials: &Credentials, api_base: &str) -> ControllerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(GITHUB_TIMEOUT)
            .user_agent(concat!("fleet-controller/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            owner: credentials.owner.clone(),
            repo: credentials.repo.clone(),
            token: credentials.github_pat.clone(),
            secret: WebhookSecret::generate(),
        })
    }

    /// Key GitHub signs deliveries to the hooks this registrar creates with.
    pub fn secret(&self) -> &WebhookSecret {
        &self.secret
    }

    fn hooks_url(&self) -> String {
        format!("{}/repos/{}/{}/hooks", self.api_base, self.owner, self.repo)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
    }

    pub async fn list_hooks(&self) -> ControllerResult<Vec<Hook>> {
        let response = self.request(reqwest::Method::GET, &self.hooks_url()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ControllerError::Github(format!("list hooks: {status}")));
        }
        Ok(response.json().await?)
    }

    pub async fn delete_hook(&self, id: u64) -> ControllerResult<()> {
        let url = format!("{}/{id}", self.hooks_url());
        let response = self.request(reqwest::Method::DELETE, &url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ControllerError::Github(format!("delete hook {id}: {status}")));
        }
        Ok(())
    }

    pub async fn create_hook(&self, url: &str) -> ControllerResult<Hook> {
        let body = CreateHook {
            name: "web",
            active: true,
            events: ["workflow_job"],
            config: CreateHookConfig {
                url,
                content_type: "json",
                secret: self.secret.as_str(),
            },
        };
        let response = self
            .request(reqwest::Method::POST, &self.hooks_url())
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ControllerError::Github(format!("create hook: {status}: {text}")));
        }
        Ok(response.json().await?)
    }

    /// Replace any existing controller hook with one targeting
    /// `http://{public_address}/ecs_runner_hook`.
    pub async fn ensure_webhook(&self, public_address: &str) -> ControllerResult<Hook> {
        let target = format!("http://{public_address}/{HOOK_PATH}");

        for hook in self.list_hooks().await? {
            let stale = hook
                .config
                .url
                .as_deref()
                .is_some_and(|u| u.contains(HOOK_PATH));
            if stale {
                debug!(id = hook.id, url = ?hook.config.url, "deleting previous runner webhook");
                self.delete_hook(hook.id).await?;
            }
        }

        let hook = self.create_hook(&target).await?;
        info!(id = hook.id, url = %target, repo = %format!("{}/{}", self.owner, self.repo), "webhook registered");
        Ok(hook)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{delete, get};
    use axum::{Json, Router};
    use tokio::sync::Mutex;

    #[derive(Clone, Default)]
    struct FakeGithub {
        hooks: Arc<Mutex<Vec<Hook>>>,
        deleted: Arc<Mutex<Vec<u64>>>,
        created: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers.get("authorization").and_then(|v| v.to_str().ok()) == Some("Bearer ghp_test")
    }

    async fn list(
        State(gh): State<FakeGithub>,
        headers: HeaderMap,
    ) -> Result<Json<Vec<Hook>>, StatusCode> {
        if !authorized(&headers) {
            return Err(StatusCode::UNAUTHORIZED);
        }
        Ok(Json(gh.hooks.lock().await.clone()))
    }

    async fn create(
        State(gh): State<FakeGithub>,
        Json(body): Json<serde_json::Value>,
    ) -> (StatusCode, Json<Hook>) {
        gh.created.lock().await.push(body.clone());
        let hook = Hook {
            id: 99,
            active: true,
            events: vec!["workflow_job".to_string()],
            config: HookConfig {
                url: body["config"]["url"].as_str().map(str::to_string),
                ..HookConfig::default()
            },
        };
        (StatusCode::CREATED, Json(hook))
    }

    async fn remove(
        State(gh): State<FakeGithub>,
        Path((_owner, _repo, id)): Path<(String, String, u64)>,
    ) -> StatusCode {
        gh.deleted.lock().await.push(id);
        StatusCode::NO_CONTENT
    }

    async fn spawn(gh: FakeGithub) -> String {
        let app = Router::new()
            .route("/repos/{owner}/{repo}/hooks", get(list).post(create))
            .route("/repos/{owner}/{repo}/hooks/{id}", delete(remove))
            .with_state(gh);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn hook(id: u64, url: &str) -> Hook {
        Hook {
            id,
            active: true,
            events: vec![],
            config: HookConfig {
                url: Some(url.to_string()),
                ..HookConfig::default()
            },
        }
    }

    fn creds(pat: &str) -> Credentials {
        Credentials::new("octo/widgets", pat, "key", "http://backend").unwrap()
    }

    #[tokio::test]
    async fn replaces_stale_hooks_and_creates_new_one() {
        let gh = FakeGithub::default();
        gh.hooks.lock().await.extend([
            hook(1, "http://1.2.3.4/ecs_runner_hook"),
            hook(2, "https://ci.example.com/other"),
            hook(3, "http://5.6.7.8/ecs_runner_hook"),
        ]);
        let base = spawn(gh.clone()).await;

        let registrar = WebhookRegistrar::with_api_base(&creds("ghp_test"), &base).unwrap();
        let created = registrar.ensure_webhook("9.9.9.9").await.unwrap();

        assert_eq!(created.id, 99);
        assert_eq!(created.config.url.as_deref(), Some("http://9.9.9.9/ecs_runner_hook"));
        assert_eq!(*gh.deleted.lock().await, vec![1, 3]);

        let bodies = gh.created.lock().await;
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["events"][0], "workflow_job");
        assert_eq!(bodies[0]["config"]["content_type"], "json");
        assert_eq!(bodies[0]["config"]["secret"], registrar.secret().as_str());
        assert_eq!(registrar.secret().as_str().len(), 32);
    }

    #[tokio::test]
    async fn creates_hook_when_none_exist() {
        let gh = FakeGithub::default();
        let base = spawn(gh.clone()).await;
        let registrar = WebhookRegistrar::with_api_base(&creds("ghp_test"), &base).unwrap();

        registrar.ensure_webhook("9.9.9.9:8080").await.unwrap();
        assert!(gh.deleted.lock().await.is_empty());
        assert_eq!(gh.created.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn bad_token_is_github_error() {
        let base = spawn(FakeGithub::default()).await;
        let registrar = WebhookRegistrar::with_api_base(&creds("ghp_wrong"), &base).unwrap();
        let err = registrar.ensure_webhook("9.9.9.9").await.unwrap_err();
        assert!(matches!(err, ControllerError::Github(ref m) if m.contains("401")));
    }
}
