//! HTTP transport for the session backend

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ClientError, Result};
use crate::session::{
    CreateSessionRequest, CreateSessionResponse, InferenceSession, ReleaseSessionRequest,
    SessionBackend,
};

/// JSON error body returned by the server
#[derive(Debug, serde::Deserialize)]
struct ErrorBody {
    error: String,
}

/// [`SessionBackend`] implementation talking to a swarm server over HTTP
pub struct HttpSessionBackend {
    /// Server base URL
    server_url: String,
    /// HTTP client
    http: reqwest::blocking::Client,
}

impl HttpSessionBackend {
    /// Create a backend for the given server base URL
    pub fn new(server_url: &str) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            server_url: server_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn post<Req: Serialize, Resp: DeserializeOwned>(&self, path: &str, request: &Req) -> Result<Resp> {
        let url = format!("{}{}", self.server_url, path);
        let resp = self.http.post(&url).json(request).send()?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|b| b.error)
                .unwrap_or(body);
            return Err(ClientError::Server { status, message });
        }

        Ok(resp.json()?)
    }
}

impl SessionBackend for HttpSessionBackend {
    fn create_session(&self, max_length: usize) -> Result<InferenceSession> {
        let response: CreateSessionResponse =
            self.post("/v1/session/new", &CreateSessionRequest { max_length })?;
        Ok(InferenceSession::new(response.session_id, response.max_length))
    }

    fn release_session(&self, session: &InferenceSession) -> Result<()> {
        let url = format!("{}/v1/session/release", self.server_url);
        let resp = self
            .http
            .post(&url)
            .json(&ReleaseSessionRequest {
                session_id: session.id(),
            })
            .send()?;

        if !resp.status().is_success() {
            return Err(ClientError::Server {
                status: resp.status().as_u16(),
                message: resp.text().unwrap_or_default(),
            });
        }
        Ok(())
    }
}
