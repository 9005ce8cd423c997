//! Delivery of status messages to attached subscribers over HTTP.
//!
//! One consumer task per server reads the status queue and posts each message
//! to every subscriber in turn, so a subscriber sees messages in production
//! order. A push that keeps failing is retried a fixed number of times and
//! then abandoned. The subscriber stays attached.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::LabConfig;
use crate::pubsub::Subscription;
use crate::status::StatusMessage;

#[derive(Debug, Clone, Copy)]
pub struct PushPolicy {
    pub retry_limit: u32,
    pub retry_delay: Duration,
}

impl PushPolicy {
    pub fn from_config(config: &LabConfig) -> Self {
        Self {
            retry_limit: config.push_retry_limit,
            retry_delay: config.push_retry_delay(),
        }
    }
}

impl Default for PushPolicy {
    fn default() -> Self {
        Self {
            retry_limit: 5,
            retry_delay: Duration::from_millis(200),
        }
    }
}

pub struct StatusPusher {
    subscribers: Arc<Mutex<BTreeSet<String>>>,
    task: JoinHandle<()>,
}

impl StatusPusher {
    pub fn spawn(messages: Subscription<StatusMessage>, policy: PushPolicy) -> Self {
        let subscribers = Arc::new(Mutex::new(BTreeSet::new()));
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        let task = tokio::spawn(deliver(messages, Arc::clone(&subscribers), client, policy));
        Self { subscribers, task }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add `url` to the push list. Returns `false` if it was already there.
    pub fn attach(&self, url: &str) -> bool {
        self.lock().insert(url.to_string())
    }

    pub fn subscribers(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }
}

impl Drop for StatusPusher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn deliver(
    mut messages: Subscription<StatusMessage>,
    subscribers: Arc<Mutex<BTreeSet<String>>>,
    client: reqwest::Client,
    policy: PushPolicy,
) {
    while let Some(msg) = messages.recv().await {
        let targets: Vec<String> = subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();
        for url in targets {
            push_with_retry(&client, &url, &msg, policy).await;
        }
    }
    debug!("status queue closed, pusher exiting");
}

/// Returns whether the subscriber acknowledged the message.
async fn push_with_retry(
    client: &reqwest::Client,
    url: &str,
    msg: &StatusMessage,
    policy: PushPolicy,
) -> bool {
    for attempt in 1..=policy.retry_limit {
        match client.post(url).json(msg).send().await {
            Ok(resp) if resp.status().is_success() => {
                if resp.json::<bool>().await.unwrap_or(false) {
                    return true;
                }
                debug!(url, attempt, "subscriber did not acknowledge status push");
            }
            Ok(resp) => {
                debug!(url, attempt, status = resp.status().as_u16(), "status push rejected");
            }
            Err(e) => {
                debug!(url, attempt, error = %e, "status push failed");
            }
        }
        if attempt < policy.retry_limit {
            tokio::time::sleep(policy.retry_delay).await;
        }
    }
    warn!(
        url,
        server = %msg.server,
        attempts = policy.retry_limit,
        "giving up on status push"
    );
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::PubSub;
    use crate::status::StatusDelta;
    use mockito::Matcher;
    use serde_json::json;

    fn msg() -> StatusMessage {
        StatusMessage {
            server: "pstat".into(),
            status: StatusDelta::new(),
        }
    }

    fn fast(limit: u32) -> PushPolicy {
        PushPolicy {
            retry_limit: limit,
            retry_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn acknowledged_push_is_sent_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/update_status")
            .match_body(Matcher::PartialJson(json!({"server": "pstat"})))
            .with_status(200)
            .with_body("true")
            .expect(1)
            .create_async()
            .await;
        let client = reqwest::Client::new();
        let url = format!("{}/update_status", server.url());
        assert!(push_with_retry(&client, &url, &msg(), fast(3)).await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn failing_push_is_abandoned_after_limit() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/update_status")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;
        let client = reqwest::Client::new();
        let url = format!("{}/update_status", server.url());
        assert!(!push_with_retry(&client, &url, &msg(), fast(3)).await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn pusher_forwards_queue_to_subscribers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/update_status")
            .with_status(200)
            .with_body("true")
            .expect(2)
            .create_async()
            .await;
        let queue = PubSub::new();
        let pusher = StatusPusher::spawn(queue.subscribe(), fast(2));
        let url = format!("{}/update_status", server.url());
        assert!(pusher.attach(&url));
        assert!(!pusher.attach(&url));

        queue.publish(msg());
        queue.publish(msg());
        for _ in 0..200 {
            if mock.matched_async().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        mock.assert_async().await;
        assert_eq!(pusher.subscribers(), vec![url]);
    }
}
