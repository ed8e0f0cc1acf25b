use async_trait::async_trait;
use reqwest::{header::AUTHORIZATION, Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{ChatId, ConversationSummary},
    protocol::{DataEnvelope, LoginRequest, LoginResponse, MessagePage, RefreshResponse},
};
use tracing::{debug, info, warn};

use crate::{
    credential::Credential,
    error::{ClientError, ClientResult},
    refresh::{RefreshCoordinator, TokenRefresher},
};

pub fn build_http_client() -> ClientResult<Client> {
    Client::builder()
        .cookie_store(true)
        .build()
        .map_err(|err| ClientError::network(format!("failed to build http client: {err}")))
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<serde_json::Value>,
    public: bool,
    exempt: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            public: false,
            exempt: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> ClientResult<Self> {
        let body = serde_json::to_value(body)
            .map_err(|err| ClientError::protocol(format!("failed to encode request: {err}")))?;
        self.body = Some(body);
        Ok(self)
    }

    pub fn public(mut self) -> Self {
        self.public = true;
        self
    }

    pub fn exempt(mut self) -> Self {
        self.exempt = true;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    refresh_path: String,
    coordinator: RefreshCoordinator,
}

impl ApiClient {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        refresh_path: impl Into<String>,
        coordinator: RefreshCoordinator,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            refresh_path: refresh_path.into(),
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn is_refresh_endpoint(&self, path: &str) -> bool {
        path.trim_end_matches('/') == self.refresh_path.trim_end_matches('/')
    }

    async fn dispatch(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
    ) -> ClientResult<reqwest::Response> {
        let mut builder = self
            .http
            .request(request.method.clone(), self.url(&request.path));
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.send().await.map_err(ClientError::from)
    }

    pub async fn send(&self, request: ApiRequest) -> ClientResult<reqwest::Response> {
        let unmodified = request.public || request.exempt;
        let mut token = if unmodified {
            None
        } else {
            self.coordinator.store().token()
        };
        let mut retried = false;

        loop {
            let response = self.dispatch(&request, token.as_deref()).await?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED
                && !retried
                && !unmodified
                && !self.is_refresh_endpoint(&request.path)
            {
                retried = true;
                debug!(path = %request.path, "http: 401; refreshing token and replaying once");
                let rejected = token.take().unwrap_or_default();
                token = Some(self.coordinator.refresh_after_rejection(&rejected).await?);
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let err = ClientError::from_status(status, &body);
                if retried && err.is_auth() {
                    warn!(path = %request.path, "http: still unauthorized after refresh");
                }
                return Err(err);
            }
            return Ok(response);
        }
    }

    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> ClientResult<T> {
        let response = self.send(request).await?;
        let body = response.bytes().await.map_err(ClientError::from)?;
        serde_json::from_slice(&body)
            .map_err(|err| ClientError::protocol(format!("invalid response body: {err}")))
    }

    pub async fn send_data<T: DeserializeOwned>(&self, request: ApiRequest) -> ClientResult<T> {
        let envelope: DataEnvelope<T> = self.send_json(request).await?;
        Ok(envelope.data)
    }

    pub async fn login(&self, user_name: &str, password: &str) -> ClientResult<Credential> {
        let request = ApiRequest::post("/auth/login").public().json(&LoginRequest {
            user_name: user_name.to_string(),
            password: password.to_string(),
        })?;
        let response: LoginResponse = self.send_data(request).await?;
        let credential = Credential::new(response.token, response.user_id, response.user_name);
        self.coordinator.login(credential.clone()).await;
        Ok(credential)
    }

    pub async fn logout(&self) {
        if let Err(err) = self.send(ApiRequest::post("/auth/logout").exempt()).await {
            warn!("http: server logout failed: {err}");
        }
        self.coordinator.logout().await;
    }

    pub async fn list_conversations(&self) -> ClientResult<Vec<ConversationSummary>> {
        self.send_data(ApiRequest::get("/chats")).await
    }

    pub async fn fetch_messages(
        &self,
        chat_id: ChatId,
        page: u32,
        size: u32,
    ) -> ClientResult<MessagePage> {
        self.send_data(
            ApiRequest::get(format!("/chats/{chat_id}/messages"))
                .query("page", page)
                .query("size", size),
        )
        .await
    }
}

pub struct HttpTokenRefresher {
    http: Client,
    url: String,
}

impl HttpTokenRefresher {
    pub fn new(http: Client, base_url: &str, refresh_path: &str) -> Self {
        Self {
            http,
            url: format!("{}{}", base_url.trim_end_matches('/'), refresh_path),
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self) -> ClientResult<String> {
        let response = self.http.post(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::from_status(status, &body));
        }
        let envelope: DataEnvelope<RefreshResponse> = response.json().await?;
        if envelope.data.token.is_empty() {
            return Err(ClientError::protocol("refresh response carried an empty token"));
        }
        info!("http: refresh endpoint issued a new token");
        Ok(envelope.data.token)
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
