//! Proxy sink: hands routed records to the browser fan-out proxy.
//!
//! Infallible by contract: zero recipients is a successful write.

use async_trait::async_trait;
use marketflow_core::MarketData;
use marketflow_flow::{FlowResult, Sink, SinkHealth};
use marketflow_proxy::WebSocketProxy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

pub struct ProxySink {
    id: String,
    proxy: Arc<WebSocketProxy>,
    recipients_total: AtomicU64,
}

impl ProxySink {
    pub fn new(id: impl Into<String>, proxy: Arc<WebSocketProxy>) -> Self {
        Self {
            id: id.into(),
            proxy,
            recipients_total: AtomicU64::new(0),
        }
    }

    /// Total recipients across all forwards.
    pub fn recipients_total(&self) -> u64 {
        self.recipients_total.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Sink for ProxySink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn write(&self, batch: &[MarketData]) -> FlowResult<()> {
        for data in batch {
            let recipients = self.proxy.forward_message(data, None);
            self.recipients_total
                .fetch_add(recipients as u64, Ordering::Relaxed);
            trace!(sink = %self.id, recipients, "Forwarded to proxy");
        }
        Ok(())
    }

    fn health(&self) -> SinkHealth {
        SinkHealth::healthy()
    }

    async fn close(&self) -> FlowResult<()> {
        Ok(())
    }
}
