//! Heartbeat keeper
//!
//! While a session is alive it refreshes the heartbeat annotation on every
//! object it owns. Once the process is gone the annotation ages and the
//! objects become eligible for cleanup.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::meta::ANNOTATION_HEARTBEAT;
use crate::k8s::{ClusterApi, ObjectKind};

const MIN_INTERVAL: Duration = Duration::from_secs(1);

pub struct HeartbeatKeeper {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
    targets: Vec<(ObjectKind, String)>,
    interval: Duration,
}

impl HeartbeatKeeper {
    /// Intervals below one second are raised to one second
    pub fn new(cluster: Arc<dyn ClusterApi>, namespace: &str, interval: Duration) -> Self {
        Self {
            cluster,
            namespace: namespace.to_string(),
            targets: Vec::new(),
            interval: interval.max(MIN_INTERVAL),
        }
    }

    pub fn watch(mut self, kind: ObjectKind, name: &str) -> Self {
        self.targets.push((kind, name.to_string()));
        self
    }

    /// Refresh every target once. Returns how many refreshes failed.
    pub async fn beat(&self, now: i64) -> usize {
        let stamp = now.to_string();
        let refreshes = self.targets.iter().map(|(kind, name)| {
            let stamp = &stamp;
            async move {
                let result = self
                    .cluster
                    .annotate(*kind, name, &self.namespace, ANNOTATION_HEARTBEAT, stamp)
                    .await;
                if let Err(e) = &result {
                    warn!(%kind, name = %name, error = %e, "Failed to refresh heartbeat");
                }
                result.is_err()
            }
        });
        join_all(refreshes)
            .await
            .into_iter()
            .filter(|failed| *failed)
            .count()
    }

    /// Spawn the refresh loop; it stops when `token` is cancelled
    pub fn spawn(self, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // The objects were stamped at creation; skip the immediate tick.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("heartbeat loop cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.beat(chrono::Utc::now().timestamp()).await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::k8s::MockClusterApi;
    use mockall::predicate::{always, eq};

    #[tokio::test]
    async fn test_beat_refreshes_every_target() {
        let mut mock = MockClusterApi::new();
        mock.expect_annotate()
            .with(
                eq(ObjectKind::Pod),
                eq("shadow"),
                eq("default"),
                eq(ANNOTATION_HEARTBEAT),
                eq("42"),
            )
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));
        mock.expect_annotate()
            .with(eq(ObjectKind::ConfigMap), always(), always(), always(), always())
            .times(1)
            .returning(|_, _, _, _, _| Err(AppError::internal("conflict")));

        let keeper = HeartbeatKeeper::new(Arc::new(mock), "default", Duration::from_secs(60))
            .watch(ObjectKind::Pod, "shadow")
            .watch(ObjectKind::ConfigMap, "shadow-key");
        assert_eq!(keeper.beat(42).await, 1);
    }

    #[tokio::test]
    async fn test_zero_interval_is_raised() {
        let keeper = HeartbeatKeeper::new(
            Arc::new(MockClusterApi::new()),
            "default",
            Duration::ZERO,
        );
        assert_eq!(keeper.interval, MIN_INTERVAL);

        let token = CancellationToken::new();
        let handle = keeper.spawn(token.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn test_loop_stops_on_cancel() {
        let keeper = HeartbeatKeeper::new(
            Arc::new(MockClusterApi::new()),
            "default",
            Duration::from_secs(3600),
        );
        let token = CancellationToken::new();
        let handle = keeper.spawn(token.clone());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
