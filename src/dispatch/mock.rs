//! Mock 投递通道（用于测试）
//!
//! 按队列返回预置结果，队列空时回 200；记录每次投递的端点、载荷与头。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::transport::{DeliveryTransport, TransportError, TransportResponse};

/// 一次被记录的投递
#[derive(Debug, Clone)]
pub struct RecordedDelivery {
    pub endpoint: String,
    pub payload: serde_json::Value,
    pub headers: Vec<(String, String)>,
}

impl RecordedDelivery {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Default)]
pub struct MockTransport {
    responses: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    deliveries: Mutex<Vec<RecordedDelivery>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: Result<TransportResponse, TransportError>) {
        if let Ok(mut q) = self.responses.lock() {
            q.push_back(response);
        }
    }

    pub fn push_status(&self, status: u16) {
        self.push_response(Ok(TransportResponse::new(
            status,
            serde_json::json!({ "status": status }),
        )));
    }

    pub fn deliveries(&self) -> Vec<RecordedDelivery> {
        self.deliveries.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DeliveryTransport for MockTransport {
    async fn deliver(
        &self,
        endpoint: &str,
        payload: &serde_json::Value,
        headers: &[(String, String)],
        _timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        if let Ok(mut d) = self.deliveries.lock() {
            d.push(RecordedDelivery {
                endpoint: endpoint.to_string(),
                payload: payload.clone(),
                headers: headers.to_vec(),
            });
        }
        self.responses
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| Ok(TransportResponse::new(200, serde_json::json!({ "received": true }))))
    }
}
