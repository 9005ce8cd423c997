//! Remote Call Adapter: turns an [`Action`] into a request/response exchange
//! with the named action server.
//!
//! # Routes on an action server
//!
//! ```text
//! POST /action/{server}/{operation}   body: Action        → Action
//! POST /control/estop                 body: {"engage": b} → bool
//! POST /control/clear_error                               → bool
//! POST /control/subscribe             body: {"url": u}    → bool
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::TransportError;
use crate::model::Action;

#[async_trait]
pub trait ActionTransport: Send + Sync {
    /// Deliver `action` to its server and return the server's amended copy.
    async fn dispatch(&self, action: &Action) -> Result<Action, TransportError>;

    /// Engage (`true`) or release (`false`) the emergency stop on `server`.
    async fn estop(&self, server: &str, engage: bool) -> Result<(), TransportError>;

    /// Drop every errored instance on `server`.
    async fn clear_error(&self, server: &str) -> Result<(), TransportError>;

    /// Ask `server` to push its status deltas to `callback_url`.
    async fn subscribe(&self, server: &str, callback_url: &str) -> Result<(), TransportError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EstopRequest {
    pub engage: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub url: String,
}

/// [`ActionTransport`] over HTTP/JSON.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    servers: BTreeMap<String, String>,
}

impl HttpTransport {
    /// `servers` maps server names to base URLs such as `http://127.0.0.1:8003`.
    pub fn new(servers: BTreeMap<String, String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { client, servers }
    }

    pub fn servers(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    fn url(&self, server: &str, path: &str) -> Result<String, TransportError> {
        let base = self
            .servers
            .get(server)
            .ok_or_else(|| TransportError::UnknownServer(server.to_string()))?;
        Ok(format!("{}/{}", base.trim_end_matches('/'), path))
    }

    async fn post<B, R>(&self, url: String, body: &B) -> Result<R, TransportError>
    where
        B: Serialize + ?Sized + Sync,
        R: for<'de> Deserialize<'de>,
    {
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::Request {
                url: url.clone(),
                message: e.to_string(),
            })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                url,
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<R>().await.map_err(|e| TransportError::Decode {
            url,
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl ActionTransport for HttpTransport {
    async fn dispatch(&self, action: &Action) -> Result<Action, TransportError> {
        let url = self.url(
            &action.server,
            &format!("action/{}/{}", action.server, action.operation),
        )?;
        self.post(url, action).await
    }

    async fn estop(&self, server: &str, engage: bool) -> Result<(), TransportError> {
        let url = self.url(server, "control/estop")?;
        let _: bool = self.post(url, &EstopRequest { engage }).await?;
        Ok(())
    }

    async fn clear_error(&self, server: &str) -> Result<(), TransportError> {
        let url = self.url(server, "control/clear_error")?;
        let _: bool = self.post(url, &json!({})).await?;
        Ok(())
    }

    async fn subscribe(&self, server: &str, callback_url: &str) -> Result<(), TransportError> {
        let url = self.url(server, "control/subscribe")?;
        let _: bool = self
            .post(
                url,
                &SubscribeRequest {
                    url: callback_url.to_string(),
                },
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn transport(base: &str) -> HttpTransport {
        let mut servers = BTreeMap::new();
        servers.insert("pstat".to_string(), base.to_string());
        HttpTransport::new(servers)
    }

    #[tokio::test]
    async fn dispatch_posts_action_and_reads_response() {
        let mut server = mockito::Server::new_async().await;
        let mut amended = Action::new("pstat", "run_cv");
        amended.process_params.insert("ocv".into(), json!(0.4));
        let mock = server
            .mock("POST", "/action/pstat/run_cv")
            .match_body(Matcher::PartialJson(json!({"server": "pstat", "operation": "run_cv"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(serde_json::to_string(&amended).unwrap())
            .create_async()
            .await;

        let t = transport(&server.url());
        let response = t.dispatch(&Action::new("pstat", "run_cv")).await.unwrap();
        assert_eq!(response.process_params["ocv"], json!(0.4));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn http_error_status_is_a_transport_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/action/pstat/run_cv")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;
        let t = transport(&server.url());
        let err = t.dispatch(&Action::new("pstat", "run_cv")).await.unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn unknown_server_fails_before_any_request() {
        let t = transport("http://127.0.0.1:9");
        let err = t.dispatch(&Action::new("motion", "move")).await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownServer(name) if name == "motion"));
    }

    #[tokio::test]
    async fn estop_posts_engage_flag() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/control/estop")
            .match_body(Matcher::Json(json!({"engage": true})))
            .with_status(200)
            .with_body("true")
            .create_async()
            .await;
        transport(&server.url()).estop("pstat", true).await.unwrap();
        mock.assert_async().await;
    }
}
