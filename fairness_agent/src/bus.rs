//! The opaque RPC transport, concretized as HTTP: `cast` is a
//! fire-and-forget POST. Grounded on `lnvps_health`'s axum server (see
//! `agent.rs`'s router) paired with `reqwest` as the client, the same
//! pairing used elsewhere in this workspace for outbound HTTP
//! integrations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// `receive_host_supply`'s cast payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveHostSupplyPayload {
    pub json_supply: String,
}

/// `set_metric`'s call payload and reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetMetricPayload {
    pub metric_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetMetricReply {
    pub status: String,
}

/// Opaque topic-addressed transport: `cast` is one-way and never
/// surfaces a transport failure to the caller.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn cast_receive_host_supply(&self, host: &str, base_url: &str, json_supply: String);
    async fn cast_receive_heavinesses(
        &self,
        host: &str,
        base_url: &str,
        result: crate::metrics::MetricResult,
    );
}

pub struct HttpMessageBus {
    client: reqwest::Client,
}

impl HttpMessageBus {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");
        Self { client }
    }

    async fn post(&self, url: &str, body: impl Serialize) {
        match self.client.post(url).json(&body).send().await {
            Ok(resp) if !resp.status().is_success() => {
                log::warn!("cast to {url} returned status {}", resp.status());
            }
            Err(e) => {
                log::warn!("cast to {url} failed, will retry next tick: {e}");
            }
            _ => {}
        }
    }
}

#[async_trait]
impl MessageBus for HttpMessageBus {
    async fn cast_receive_host_supply(&self, host: &str, base_url: &str, json_supply: String) {
        let url = format!("{}/rpc/receive_host_supply", base_url.trim_end_matches('/'));
        log::debug!("casting receive_host_supply to {host}");
        self.post(&url, ReceiveHostSupplyPayload { json_supply }).await;
    }

    async fn cast_receive_heavinesses(
        &self,
        host: &str,
        base_url: &str,
        result: crate::metrics::MetricResult,
    ) {
        let url = format!("{}/rpc/receive_heavinesses", base_url.trim_end_matches('/'));
        log::debug!("casting receive_heavinesses to {host}");
        self.post(&url, result).await;
    }
}
