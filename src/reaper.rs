use std::sync::Arc;
use std::time::Duration;

use crate::engine::{Engine, now_ms};

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// Background task that drops idempotency records past their TTL.
pub async fn run_idempotency_sweeper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let purged = sweep_idempotency(&engine);
        if purged > 0 {
            tracing::debug!("purged {purged} expired idempotency records");
        }
    }
}

async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("compaction failed after {appends} appends: {e}");
            false
        }
    }
}

fn sweep_idempotency(engine: &Engine) -> usize {
    let purged = engine.idempotency.purge_expired(now_ms());
    metrics::gauge!(crate::observability::IDEMPOTENCY_RECORDS).set(engine.idempotency.len() as f64);
    purged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("artisched_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compactor_waits_for_threshold() {
        let path = test_wal_path("compact_threshold.wal");
        let engine = Arc::new(
            Engine::new(path, Arc::new(NotifyHub::new()), EngineConfig::default()).unwrap(),
        );
        let tenant = Ulid::new();
        for _ in 0..3 {
            engine.register_customer(Ulid::new(), tenant).await.unwrap();
        }

        assert!(!compact_if_due(&engine, 10).await);
        assert_eq!(engine.wal_appends_since_compact().await, 3);

        assert!(compact_if_due(&engine, 3).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }

    #[tokio::test]
    async fn sweeper_drops_expired_records() {
        let path = test_wal_path("sweeper.wal");
        let config = EngineConfig {
            idempotency_ttl_ms: 1,
            ..EngineConfig::default()
        };
        let engine = Arc::new(Engine::new(path, Arc::new(NotifyHub::new()), config).unwrap());

        let tenant = Ulid::new();
        let booking = Ulid::new();
        let guarded = engine
            .idempotency
            .execute(tenant, "k1", "fp", now_ms(), |_stamp| async move {
                Ok(booking)
            })
            .await
            .unwrap();
        assert_eq!(guarded.booking_id, booking);
        assert_eq!(engine.idempotency.len(), 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(sweep_idempotency(&engine), 1);
        assert!(engine.idempotency.is_empty());
        assert!(engine.idempotency.record(tenant, "k1", now_ms()).is_none());
    }
}
