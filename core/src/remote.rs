use crate::conversation::Turn;
use crate::identity::ClientIdentity;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use url::Url;

pub const IDENTITY_HEADER: &str = "X-Client-Identity";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("request to {endpoint} failed: {detail}")]
    Transport { endpoint: String, detail: String },
    #[error("{endpoint} answered {status}: {message}")]
    Status {
        endpoint: String,
        status: u16,
        message: String,
    },
    #[error("malformed response from {endpoint}: {detail}")]
    Malformed { endpoint: String, detail: String },
    #[error("invalid service url: {0}")]
    InvalidUrl(String),
}

/// Body of `POST /chat`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatRequest {
    pub message: String,
    pub history: Vec<Turn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Success body of `POST /chat`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatReply {
    pub response: String,
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
struct AuthCheckBody {
    is_authenticated: bool,
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    auth_url: String,
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    status: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(alias = "detail")]
    error: serde_json::Value,
}

/// The assistant service as seen by this client. Every call is tagged with
/// the installation's identity.
#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn check_auth(&self, identity: &ClientIdentity) -> Result<bool, ProtocolError>;
    async fn login_url(&self, identity: &ClientIdentity) -> Result<Url, ProtocolError>;
    async fn logout(&self, identity: &ClientIdentity) -> Result<(), ProtocolError>;
    async fn chat(
        &self,
        identity: &ClientIdentity,
        request: &ChatRequest,
    ) -> Result<ChatReply, ProtocolError>;
    async fn clear_session(
        &self,
        identity: &ClientIdentity,
        session_id: &str,
    ) -> Result<(), ProtocolError>;
    async fn health(&self) -> Result<String, ProtocolError>;
}

/// JSON-over-HTTP implementation backed by `reqwest`.
#[derive(Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: Url,
}

impl HttpRemote {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, ProtocolError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ProtocolError::Transport {
                endpoint: base_url.to_string(),
                detail: err.to_string(),
            })?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, mut base_url: Url) -> Self {
        // `Url::join` drops the last segment unless the path ends in a slash.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, ProtocolError> {
        self.base_url
            .join(path)
            .map_err(|err| ProtocolError::InvalidUrl(err.to_string()))
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        identity: Option<&ClientIdentity>,
        body: Option<&ChatRequest>,
    ) -> Result<Response, ProtocolError> {
        let endpoint = url.path().to_string();
        let mut request = self.client.request(method, url);
        if let Some(identity) = identity {
            request = request.header(IDENTITY_HEADER, identity.as_str());
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|err| ProtocolError::Transport {
            endpoint: endpoint.clone(),
            detail: err.to_string(),
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| match body.error {
                serde_json::Value::String(message) => message,
                other => other.to_string(),
            })
            .unwrap_or(text);
        tracing::debug!(%endpoint, status = status.as_u16(), %message, "remote returned failure status");
        Err(ProtocolError::Status {
            endpoint,
            status: status.as_u16(),
            message,
        })
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ProtocolError> {
    let endpoint = response.url().path().to_string();
    let bytes = response
        .bytes()
        .await
        .map_err(|err| ProtocolError::Transport {
            endpoint: endpoint.clone(),
            detail: err.to_string(),
        })?;
    serde_json::from_slice(&bytes).map_err(|err| ProtocolError::Malformed {
        endpoint,
        detail: err.to_string(),
    })
}

#[async_trait]
impl RemoteService for HttpRemote {
    async fn check_auth(&self, identity: &ClientIdentity) -> Result<bool, ProtocolError> {
        let url = self.endpoint("auth/check")?;
        let response = self.send(Method::GET, url, Some(identity), None).await?;
        let body: AuthCheckBody = decode(response).await?;
        Ok(body.is_authenticated)
    }

    async fn login_url(&self, identity: &ClientIdentity) -> Result<Url, ProtocolError> {
        let url = self.endpoint("auth/login")?;
        let response = self.send(Method::GET, url, Some(identity), None).await?;
        let body: LoginBody = decode(response).await?;
        Url::parse(&body.auth_url).map_err(|err| ProtocolError::Malformed {
            endpoint: "/auth/login".to_string(),
            detail: format!("auth_url is not a url: {err}"),
        })
    }

    async fn logout(&self, identity: &ClientIdentity) -> Result<(), ProtocolError> {
        let url = self.endpoint("auth/logout")?;
        self.send(Method::POST, url, Some(identity), None).await?;
        Ok(())
    }

    async fn chat(
        &self,
        identity: &ClientIdentity,
        request: &ChatRequest,
    ) -> Result<ChatReply, ProtocolError> {
        let url = self.endpoint("chat")?;
        let response = self
            .send(Method::POST, url, Some(identity), Some(request))
            .await?;
        decode(response).await
    }

    async fn clear_session(
        &self,
        identity: &ClientIdentity,
        session_id: &str,
    ) -> Result<(), ProtocolError> {
        let mut url = self.endpoint("clear_session")?;
        url.query_pairs_mut().append_pair("session_id", session_id);
        self.send(Method::POST, url, Some(identity), None).await?;
        Ok(())
    }

    async fn health(&self) -> Result<String, ProtocolError> {
        let url = self.endpoint("health")?;
        let response = self.send(Method::GET, url, None, None).await?;
        let body: HealthBody = decode(response).await?;
        Ok(body.status)
    }
}

/// A call observed by [`MockRemote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    CheckAuth(ClientIdentity),
    LoginUrl(ClientIdentity),
    Logout(ClientIdentity),
    Chat(ClientIdentity, ChatRequest),
    ClearSession(ClientIdentity, String),
    Health,
}

#[derive(Default)]
struct MockScript {
    chat: VecDeque<Result<ChatReply, ProtocolError>>,
    auth_checks: VecDeque<Result<bool, ProtocolError>>,
    login_urls: VecDeque<Result<Url, ProtocolError>>,
    logouts: VecDeque<Result<(), ProtocolError>>,
    calls: Vec<RecordedCall>,
    chat_delay: Option<Duration>,
    auth_check_delay: Option<Duration>,
}

/// Scripted in-process service. Queued results are consumed in order; once
/// a queue is empty the mock falls back to a benign default (an echo reply,
/// unauthenticated, a fixed login url, a successful logout).
#[derive(Default)]
pub struct MockRemote {
    script: Mutex<MockScript>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_chat(&self, result: Result<ChatReply, ProtocolError>) {
        self.script.lock().chat.push_back(result);
    }

    pub fn push_reply(&self, response: impl Into<String>, session_id: impl Into<String>) {
        self.push_chat(Ok(ChatReply {
            response: response.into(),
            session_id: session_id.into(),
        }));
    }

    pub fn push_auth_check(&self, result: Result<bool, ProtocolError>) {
        self.script.lock().auth_checks.push_back(result);
    }

    pub fn push_login_url(&self, result: Result<Url, ProtocolError>) {
        self.script.lock().login_urls.push_back(result);
    }

    pub fn push_logout(&self, result: Result<(), ProtocolError>) {
        self.script.lock().logouts.push_back(result);
    }

    /// Delays every chat reply, keeping the exchange observable as pending.
    pub fn set_chat_delay(&self, delay: Duration) {
        self.script.lock().chat_delay = Some(delay);
    }

    /// Delays every auth check, keeping a status re-check observable.
    pub fn set_auth_check_delay(&self, delay: Duration) {
        self.script.lock().auth_check_delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.script.lock().calls.clone()
    }

    pub fn chat_requests(&self) -> Vec<ChatRequest> {
        self.script
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                RecordedCall::Chat(_, request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn auth_check_count(&self) -> usize {
        self.script
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, RecordedCall::CheckAuth(_)))
            .count()
    }

    pub fn transport_failure(endpoint: &str) -> ProtocolError {
        ProtocolError::Transport {
            endpoint: endpoint.to_string(),
            detail: "connection refused".to_string(),
        }
    }

    fn record(&self, call: RecordedCall) {
        self.script.lock().calls.push(call);
    }
}

#[async_trait]
impl RemoteService for MockRemote {
    async fn check_auth(&self, identity: &ClientIdentity) -> Result<bool, ProtocolError> {
        self.record(RecordedCall::CheckAuth(identity.clone()));
        let (next, delay) = {
            let mut script = self.script.lock();
            (script.auth_checks.pop_front(), script.auth_check_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        next.unwrap_or(Ok(false))
    }

    async fn login_url(&self, identity: &ClientIdentity) -> Result<Url, ProtocolError> {
        self.record(RecordedCall::LoginUrl(identity.clone()));
        let next = self.script.lock().login_urls.pop_front();
        match next {
            Some(result) => result,
            None => Url::parse("https://accounts.example.com/oauth/authorize")
                .map_err(|err| ProtocolError::InvalidUrl(err.to_string())),
        }
    }

    async fn logout(&self, identity: &ClientIdentity) -> Result<(), ProtocolError> {
        self.record(RecordedCall::Logout(identity.clone()));
        let next = self.script.lock().logouts.pop_front();
        next.unwrap_or(Ok(()))
    }

    async fn chat(
        &self,
        identity: &ClientIdentity,
        request: &ChatRequest,
    ) -> Result<ChatReply, ProtocolError> {
        self.record(RecordedCall::Chat(identity.clone(), request.clone()));
        let (next, delay) = {
            let mut script = self.script.lock();
            (script.chat.pop_front(), script.chat_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        next.unwrap_or_else(|| {
            Ok(ChatReply {
                response: format!("[mock] received '{}'", request.message),
                session_id: request
                    .session_id
                    .clone()
                    .unwrap_or_else(|| "mock-session".to_string()),
            })
        })
    }

    async fn clear_session(
        &self,
        identity: &ClientIdentity,
        session_id: &str,
    ) -> Result<(), ProtocolError> {
        self.record(RecordedCall::ClearSession(
            identity.clone(),
            session_id.to_string(),
        ));
        Ok(())
    }

    async fn health(&self) -> Result<String, ProtocolError> {
        self.record(RecordedCall::Health);
        Ok("healthy".to_string())
    }
}
