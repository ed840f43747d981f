//! Inbound event loop: the transport feeds a single queue, each event is
//! checked against the allowlist and handed to the orchestrator in its own
//! task.

use crate::config::SecurityConfig;
use crate::orchestrator::SessionOrchestrator;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vn_channels::InboundEvent;

pub struct Gateway {
    security: SecurityConfig,
    orchestrator: Arc<SessionOrchestrator>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundEvent>>,
}

impl Gateway {
    pub fn new(
        security: SecurityConfig,
        orchestrator: Arc<SessionOrchestrator>,
        inbound_rx: mpsc::Receiver<InboundEvent>,
    ) -> Self {
        Self {
            security,
            orchestrator,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        }
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run_loop(shutdown).await {
                tracing::error!(%e, "gateway loop exited");
            }
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(&self, shutdown: CancellationToken) -> Result<()> {
        let mut rx = self.inbound_rx.lock().await;
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("gateway shutting down");
                    return Ok(());
                }
                event = rx.recv() => event,
            };
            let Some(event) = event else {
                tracing::warn!("inbound queue closed");
                return Ok(());
            };
            self.dispatch(event);
        }
    }

    fn dispatch(&self, event: InboundEvent) -> Option<JoinHandle<()>> {
        if !self.security.is_allowed(event.sender_id().as_str()) {
            tracing::info!(sender = %event.sender_id(), kind = event.kind_name(), "sender not allowed; dropping event");
            return None;
        }
        let orchestrator = self.orchestrator.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = orchestrator.handle(event).await {
                tracing::warn!(%e, "event handler failed");
            }
        }))
    }
}
