use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::KairoResult;

use super::traits::ServicePlugin;
use super::types::{PluginContext, ServiceHealth};

struct ServiceLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Starts, drives and stops service plugins. Each running service with a
/// cycle interval owns one background loop bound to a cancellation token.
pub struct ServiceManager {
    loops: Mutex<HashMap<String, ServiceLoop>>,
    health_timeout: Duration,
    stop_timeout: Duration,
}

impl ServiceManager {
    pub fn new(health_timeout: Duration, stop_timeout: Duration) -> Self {
        Self {
            loops: Mutex::new(HashMap::new()),
            health_timeout,
            stop_timeout,
        }
    }

    pub async fn start(
        &self,
        plugin_id: &str,
        service: Arc<dyn ServicePlugin>,
        ctx: &PluginContext,
    ) -> KairoResult<()> {
        // A restart replaces any loop left over from a previous activation.
        self.cancel_loop(plugin_id).await;

        service.start_service(ctx).await?;

        if let Some(every) = service.cycle_interval() {
            let token = CancellationToken::new();
            let handle = tokio::spawn(run_cycles(
                plugin_id.to_string(),
                service,
                every,
                token.clone(),
            ));
            self.loops
                .lock()
                .await
                .insert(plugin_id.to_string(), ServiceLoop { token, handle });
            info!(plugin_id = %plugin_id, interval_ms = every.as_millis() as u64, "Service started with cycle loop");
        } else {
            info!(plugin_id = %plugin_id, "Service started");
        }

        Ok(())
    }

    /// Stops the cycle loop (if any) and then the service itself.
    pub async fn stop(&self, plugin_id: &str, service: Arc<dyn ServicePlugin>) -> KairoResult<()> {
        self.cancel_loop(plugin_id).await;
        service.stop_service().await?;
        info!(plugin_id = %plugin_id, "Service stopped");
        Ok(())
    }

    pub async fn is_running(&self, plugin_id: &str) -> bool {
        self.loops
            .lock()
            .await
            .get(plugin_id)
            .map(|l| !l.handle.is_finished())
            .unwrap_or(false)
    }

    pub async fn running_loops(&self) -> usize {
        self.loops.lock().await.len()
    }

    /// Runs every health check concurrently, each bounded by the configured
    /// timeout. Failures of any kind are reported as unhealthy.
    pub async fn check_all(
        &self,
        services: Vec<(String, Arc<dyn ServicePlugin>)>,
    ) -> Vec<ServiceHealth> {
        let limit = self.health_timeout;

        let checks = services.into_iter().map(|(plugin_id, service)| async move {
            let check = tokio::spawn(async move { service.health_check().await });
            let abort = check.abort_handle();
            let outcome = timeout(limit, check).await;
            if outcome.is_err() {
                abort.abort();
            }

            let (healthy, message) = match outcome {
                Ok(Ok(Ok(status))) => (status.healthy, status.message),
                Ok(Ok(Err(e))) => (false, Some(e.to_string())),
                Ok(Err(join_err)) => (false, Some(format!("health check panicked: {}", join_err))),
                Err(_) => (
                    false,
                    Some(format!("health check timed out after {} ms", limit.as_millis())),
                ),
            };

            if !healthy {
                warn!(plugin_id = %plugin_id, message = ?message, "Service unhealthy");
            }

            ServiceHealth {
                plugin_id,
                healthy,
                message,
            }
        });

        join_all(checks).await
    }

    pub async fn shutdown(&self) {
        let loops: Vec<(String, ServiceLoop)> = self.loops.lock().await.drain().collect();
        for (plugin_id, service_loop) in loops {
            self.join_loop(&plugin_id, service_loop).await;
        }
    }

    async fn cancel_loop(&self, plugin_id: &str) {
        let existing = self.loops.lock().await.remove(plugin_id);
        if let Some(service_loop) = existing {
            self.join_loop(plugin_id, service_loop).await;
        }
    }

    async fn join_loop(&self, plugin_id: &str, service_loop: ServiceLoop) {
        service_loop.token.cancel();
        let ServiceLoop { handle, .. } = service_loop;
        let abort = handle.abort_handle();

        match timeout(self.stop_timeout, handle).await {
            Ok(Ok(())) => debug!(plugin_id = %plugin_id, "Service loop joined"),
            Ok(Err(e)) if e.is_panic() => {
                error!(plugin_id = %plugin_id, "Service loop panicked: {}", e)
            }
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(plugin_id = %plugin_id, "Service loop did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

async fn run_cycles(
    plugin_id: String,
    service: Arc<dyn ServicePlugin>,
    every: Duration,
    token: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = service.run_cycle().await {
                    error!(plugin_id = %plugin_id, "Service cycle failed: {}", e);
                }
            }
            _ = token.cancelled() => {
                debug!(plugin_id = %plugin_id, "Service loop shutting down");
                break;
            }
        }
    }
}
