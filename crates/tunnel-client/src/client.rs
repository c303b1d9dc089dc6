//! The client's public operations: run the connect loop in the background
//! and stop it again.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::connect;

pub struct TunnelClient {
    config: Arc<ClientConfig>,
    tls_config: Arc<rustls::ClientConfig>,
    shutdown: Arc<Notify>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TunnelClient {
    pub fn new(config: ClientConfig, tls_config: Arc<rustls::ClientConfig>) -> Self {
        TunnelClient {
            config: Arc::new(config),
            tls_config,
            shutdown: Arc::new(Notify::new()),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Start the connect loop in the background. Calling this more than
    /// once without an intervening [`TunnelClient::stop`] replaces the
    /// previous background task.
    pub async fn start(&self) {
        let config = self.config.clone();
        let tls_config = self.tls_config.clone();
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = connect::run(config, tls_config, shutdown).await {
                tracing::error!(error = %e, "connect loop exited with an error");
            }
        });

        *self.task.lock().await = Some(handle);
    }

    /// Signal the connect loop to stop and wait for it to exit.
    pub async fn stop(&self) {
        self.shutdown.notify_waiters();
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TunnelClient {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
        if let Ok(mut guard) = self.task.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}
