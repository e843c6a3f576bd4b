//! Settlement backend client for batch-auction orders

use crate::config::OrderApiConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::state::TransactionStatus;

use async_trait::async_trait;
use ethers::types::H256;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Order status as reported by the settlement backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteOrderStatus {
    Open,
    Expired,
    Error,
    Cancelled,
    Filled,
    #[serde(alias = "insufficient_funds")]
    InsufficientFunds,
    Unverified,
}

impl From<RemoteOrderStatus> for TransactionStatus {
    fn from(status: RemoteOrderStatus) -> Self {
        match status {
            RemoteOrderStatus::Cancelled => TransactionStatus::Canceled,
            RemoteOrderStatus::Error => TransactionStatus::Failed,
            RemoteOrderStatus::Expired => TransactionStatus::Expired,
            RemoteOrderStatus::Filled => TransactionStatus::Success,
            RemoteOrderStatus::InsufficientFunds => TransactionStatus::InsufficientFunds,
            RemoteOrderStatus::Open => TransactionStatus::Pending,
            RemoteOrderStatus::Unverified => TransactionStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteOrder {
    #[serde(alias = "orderId")]
    pub order_hash: String,
    pub order_status: RemoteOrderStatus,
    /// Fill transaction, once settled on chain
    #[serde(default)]
    pub tx_hash: Option<H256>,
}

/// Entries stay raw so one malformed order cannot sink the whole batch
#[derive(Debug, Deserialize)]
struct OrdersResponse {
    #[serde(default)]
    orders: Vec<serde_json::Value>,
}

impl OrdersResponse {
    fn into_orders(self) -> Vec<RemoteOrder> {
        self.orders
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<RemoteOrder>(entry.clone()) {
                Ok(order) => Some(order),
                Err(e) => {
                    warn!("Skipping unreadable order entry {}: {}", entry, e);
                    None
                }
            })
            .collect()
    }
}

/// Batched order status lookup
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderApi: Send + Sync {
    /// Orders the backend knows about; unknown hashes are simply absent
    async fn fetch_orders(&self, order_hashes: &[String]) -> OrchestratorResult<Vec<RemoteOrder>>;
}

/// `GET {base_url}/orders?orderHashes=a,b,c`
pub struct HttpOrderApi {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpOrderApi {
    pub fn new(config: &OrderApiConfig) -> OrchestratorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| OrchestratorError::Config(format!("Invalid order API client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl OrderApi for HttpOrderApi {
    async fn fetch_orders(&self, order_hashes: &[String]) -> OrchestratorResult<Vec<RemoteOrder>> {
        let mut request = self
            .client
            .get(format!("{}/orders", self.base_url))
            .query(&[("orderHashes", order_hashes.join(","))]);
        if let Some(ref key) = self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| OrchestratorError::OrderApi(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OrchestratorError::OrderApi(format!(
                "Order lookup returned {}",
                status
            )));
        }

        let body: OrdersResponse = response
            .json()
            .await
            .map_err(|e| OrchestratorError::OrderApi(format!("Invalid order response: {}", e)))?;

        let orders = body.into_orders();
        debug!("Fetched {} of {} orders", orders.len(), order_hashes.len());
        Ok(orders)
    }
}
