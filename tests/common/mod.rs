#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use axum::response::Response;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use workbench::auth::TokenGenerator;
use workbench::config::ServerConfig;
use workbench::error::Result;
use workbench::oauth::{IdentityProvider, ProviderRegistry};
use workbench::server::{AppState, create_router};
use workbench::store::{SqliteStore, Store};
use workbench::types::{OAuthIdentity, OAuthProvider};

pub const FRONTEND_URL: &str = "http://frontend.test";
pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

/// Identity provider that treats the authorization code as the account name.
pub struct FakeProvider;

#[async_trait]
impl IdentityProvider for FakeProvider {
    fn authorization_url(&self, state: &str) -> String {
        format!("https://accounts.example.test/authorize?state={state}")
    }

    async fn exchange_code(&self, code: &str) -> Result<OAuthIdentity> {
        Ok(OAuthIdentity {
            provider: OAuthProvider::Google,
            provider_user_id: format!("google-{code}"),
            email: format!("{code}@example.com"),
            display_name: Some(code.to_string()),
            avatar_url: None,
        })
    }
}

pub struct TestApp {
    pub temp_dir: TempDir,
    pub store: Arc<SqliteStore>,
    pub router: Router,
    pub admin_token: String,
}

/// Ids and credentials of a user provisioned through the admin API.
pub struct TestUser {
    pub id: String,
    pub email: String,
    pub workspace_id: String,
    pub project_id: String,
    pub token: String,
}

impl TestApp {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("create temp dir");
        let config = ServerConfig {
            data_dir: temp_dir.path().to_path_buf(),
            frontend_url: format!("{FRONTEND_URL}/"),
            stripe_webhook_secret: Some(WEBHOOK_SECRET.to_string()),
            ..ServerConfig::default()
        };

        let store = Arc::new(SqliteStore::new(config.db_path()).expect("open store"));
        store.initialize().expect("initialize store");

        let (admin_token, _) = TokenGenerator::new()
            .issue(store.as_ref(), true, None, None)
            .expect("issue admin token");

        let mut providers: ProviderRegistry = HashMap::new();
        providers.insert(OAuthProvider::Google, Arc::new(FakeProvider));

        let state = AppState::new(store.clone(), &config)
            .expect("build state")
            .with_providers(providers);

        Self {
            temp_dir,
            store,
            router: create_router(Arc::new(state)),
            admin_token,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible")
    }

    /// Sends a JSON request and returns the status with the parsed body
    /// (`Value::Null` for empty bodies).
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("build request");

        let response = self.send(request).await;
        let status = response.status();
        (status, json_body(response).await)
    }

    pub async fn get(&self, uri: &str, token: &str) -> (StatusCode, Value) {
        self.request(Method::GET, uri, Some(token), None).await
    }

    pub async fn post(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::POST, uri, Some(token), Some(body))
            .await
    }

    pub async fn delete(&self, uri: &str, token: &str) -> (StatusCode, Value) {
        self.request(Method::DELETE, uri, Some(token), None).await
    }

    pub async fn upload(
        &self,
        project_id: &str,
        path: &str,
        token: &str,
        content: &'static [u8],
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::PUT)
            .uri(format!("/api/v1/projects/{project_id}/files/{path}"))
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::from(content))
            .expect("build upload");
        let response = self.send(request).await;
        let status = response.status();
        (status, json_body(response).await)
    }

    /// Provisions a user through the admin API and issues them a token.
    pub async fn provision_user(&self, email: &str) -> TestUser {
        let (status, body) = self
            .post(
                "/api/v1/admin/users",
                &self.admin_token,
                serde_json::json!({ "email": email }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "provision {email}: {body}");

        let id = body["data"]["user"]["id"].as_str().expect("user id").to_string();
        let workspace_id = body["data"]["workspace"]["id"]
            .as_str()
            .expect("workspace id")
            .to_string();
        let project_id = body["data"]["project"]["id"]
            .as_str()
            .expect("project id")
            .to_string();

        let (status, body) = self
            .post(
                &format!("/api/v1/admin/users/{id}/tokens"),
                &self.admin_token,
                serde_json::json!({}),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "issue token: {body}");
        let token = body["data"]["token"].as_str().expect("token").to_string();

        TestUser {
            id,
            email: email.to_lowercase(),
            workspace_id,
            project_id,
            token,
        }
    }

    pub fn storage_used(&self, workspace_id: &str) -> i64 {
        self.store
            .get_workspace(workspace_id)
            .expect("get workspace")
            .expect("workspace exists")
            .storage_used_bytes
    }
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body")
        .to_vec()
}

pub async fn json_body(response: Response) -> Value {
    let bytes = body_bytes(response).await;
    if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("parse JSON body")
    }
}

pub fn location(response: &Response) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .expect("location header")
        .to_str()
        .expect("ascii location")
        .to_string()
}
