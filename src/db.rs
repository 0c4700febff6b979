#![forbid(unsafe_code)]

// Database connection and the box-join audit trail.
// Audit writes happen on a background task so a slow database never
// holds up a room.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Queue depth for pending audit rows.
const AUDIT_QUEUE_CAPACITY: usize = 1024;

pub async fn connect(database_url: Option<&str>) -> anyhow::Result<Option<PgPool>> {
    let url = match database_url {
        Some(url) => url,
        None => {
            info!("DATABASE_URL not set, box joins will not be audited");
            return Ok(None);
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(3))
        .connect(url)
        .await?;

    info!("Connected to PostgreSQL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await?;

    info!("Database migrations applied");

    Ok(Some(pool))
}

/// One accepted box join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoxJoinRecord {
    pub room_id: String,
    pub box_id: u8,
    pub user_id: String,
    pub connection_id: String,
    pub joined_at: DateTime<Utc>,
}

/// Destination for audit rows
#[async_trait]
pub trait AuditSink: Send + Sync + 'static {
    async fn record_join(&self, record: &BoxJoinRecord) -> anyhow::Result<()>;
}

pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn record_join(&self, record: &BoxJoinRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO box_joins (room_id, box_id, user_id, connection_id, joined_at)
             VALUES ($1, $2, $3, $4, $5)"
        )
        .bind(&record.room_id)
        .bind(i16::from(record.box_id))
        .bind(&record.user_id)
        .bind(&record.connection_id)
        .bind(record.joined_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Handle used by the registry to enqueue audit rows without awaiting.
#[derive(Clone, Default)]
pub struct AuditLog {
    tx: Option<mpsc::Sender<BoxJoinRecord>>,
}

impl AuditLog {
    /// An audit log that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Spawns the writer task draining into `sink`.
    pub fn spawn(sink: Arc<dyn AuditSink>) -> Self {
        let (tx, mut rx) = mpsc::channel::<BoxJoinRecord>(AUDIT_QUEUE_CAPACITY);
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(e) = sink.record_join(&record).await {
                    warn!(
                        "Failed to audit join of box {} in room {} by {}: {}",
                        record.box_id, record.room_id, record.user_id, e
                    );
                }
            }
            debug!("Audit writer finished");
        });
        Self { tx: Some(tx) }
    }

    pub fn record(&self, record: BoxJoinRecord) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                warn!("Audit queue full, dropping join record for room {}", record.room_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Audit writer gone, dropping join record");
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryAuditSink;
    use super::*;

    fn record(room: &str) -> BoxJoinRecord {
        BoxJoinRecord {
            room_id: room.to_string(),
            box_id: 2,
            user_id: "u1".to_string(),
            connection_id: "c1".to_string(),
            joined_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_records_reach_sink() {
        let sink = Arc::new(MemoryAuditSink::default());
        let log = AuditLog::spawn(sink.clone());
        log.record(record("stream-1"));
        log.record(record("stream-2"));

        for _ in 0..50 {
            if sink.records.lock().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let records = sink.records.lock().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].room_id, "stream-1");
        assert_eq!(records[1].room_id, "stream-2");
    }

    #[test]
    fn test_disabled_log_discards() {
        let log = AuditLog::disabled();
        log.record(record("stream-1"));
    }
}
