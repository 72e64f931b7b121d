//! 投递通道：「发送载荷，拿到状态码 + 响应体」

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// 外部执行端的响应
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl TransportResponse {
    pub fn new(status: u16, body: serde_json::Value) -> Self {
        Self { status, body }
    }

    /// 状态码 >= 400 视为投递失败
    pub fn is_failure(&self) -> bool {
        self.status >= 400
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Delivery timed out after {0}ms")]
    Timeout(u64),

    #[error("Delivery transport error: {0}")]
    Connect(String),
}

/// 投递通道
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn deliver(
        &self,
        endpoint: &str,
        payload: &serde_json::Value,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError>;
}

/// 基于 reqwest 的 HTTP POST 投递
#[derive(Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeliveryTransport for HttpTransport {
    async fn deliver(
        &self,
        endpoint: &str,
        payload: &serde_json::Value,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        let mut request = self.client.post(endpoint).json(payload).timeout(timeout);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(timeout.as_millis() as u64)
            } else {
                TransportError::Connect(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        // 执行端可能回纯文本
        let body = serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));
        Ok(TransportResponse { status, body })
    }
}
