//! HTTP side of the portal: auth-token exchange for conference bots and the
//! livestream viewer API. One shared `reqwest` client serves every session.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use serde_json::Value;

/// Base URLs of the portal under test.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub ws: String,
    pub http: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            ws: "ws://portal-sfu-dev.internal:11905".to_owned(),
            http: "http://portal-sfu-dev.internal:11905".to_owned(),
        }
    }
}

pub fn new_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("http client construction cannot fail with these options")
}

/// Fetch the join token for one emulated user.
pub async fn fetch_auth_token(
    client: &reqwest::Client,
    http_base: &str,
    user_id: &str,
) -> anyhow::Result<String> {
    let url = format!("{http_base}/auth-token?uid={user_id}");
    let body: Value = client
        .get(&url)
        .send()
        .await
        .context("auth request failed")?
        .json()
        .await
        .context("auth response is not json")?;

    body.get("data")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .with_context(|| format!("auth response carries no token: {body}"))
}

/// Client for the livestream portal API. Cheap to clone; the bearer token
/// obtained from `sign` is shared between clones.
#[derive(Clone)]
pub struct LiveApi {
    client: reqwest::Client,
    base: String,
    bearer: Arc<Mutex<Option<String>>>,
}

impl LiveApi {
    pub fn new(client: reqwest::Client, http_base: impl Into<String>) -> Self {
        Self {
            client,
            base: http_base.into(),
            bearer: Arc::new(Mutex::new(None)),
        }
    }

    pub fn has_session(&self) -> bool {
        self.bearer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Obtain the API token. `Ok(false)` means the portal refused (viewer
    /// goes to its auth-failed state); transport errors bubble up.
    pub async fn sign(&self) -> anyhow::Result<bool> {
        let body: Value = self
            .client
            .get(format!("{}/stats/sign", self.base))
            .send()
            .await
            .context("sign request failed")?
            .json()
            .await
            .context("sign response is not json")?;

        if !body.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(false);
        }

        let token = body
            .get("token")
            .and_then(Value::as_str)
            .context("sign response carries no token")?;
        *self.bearer.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.to_owned());
        Ok(true)
    }

    pub async fn watch(&self, streamer_id: &str) -> anyhow::Result<Value> {
        self.post(&format!("live/{streamer_id}/watch"), Value::Object(Default::default()))
            .await
    }

    pub async fn consume(&self, streamer_id: &str, rtp_capabilities: Value) -> anyhow::Result<Value> {
        self.post(
            &format!("live/{streamer_id}/consume"),
            serde_json::json!({"rtpCapabilities": rtp_capabilities}),
        )
        .await
    }

    pub async fn connect_transport(
        &self,
        streamer_id: &str,
        dtls_parameters: &Value,
    ) -> anyhow::Result<()> {
        self.post(
            &format!("live/{streamer_id}/connectTransport"),
            serde_json::json!({"dtlsParameters": dtls_parameters}),
        )
        .await?;
        Ok(())
    }

    pub async fn resume(&self, streamer_id: &str) -> anyhow::Result<()> {
        self.post(&format!("live/{streamer_id}/resume"), Value::Object(Default::default()))
            .await?;
        Ok(())
    }

    /// Keepalive; errors are the caller's to ignore.
    pub async fn ping(&self) -> anyhow::Result<()> {
        let request = self.client.get(format!("{}/live/ping", self.base));
        let request = self.authorize(request);
        request.send().await.context("ping failed")?;
        Ok(())
    }

    async fn post(&self, path: &str, body: Value) -> anyhow::Result<Value> {
        let request = self.client.post(format!("{}/{path}", self.base)).json(&body);
        let request = self.authorize(request);
        request
            .send()
            .await
            .with_context(|| format!("{path} request failed"))?
            .json()
            .await
            .with_context(|| format!("{path} response is not json"))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let bearer = self
            .bearer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match bearer {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}
