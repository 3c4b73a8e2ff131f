//! Work queue on a plain table: `FOR UPDATE SKIP LOCKED` hands each visible row to exactly one
//! receiver, which hides it for the visibility timeout until it is deleted by receipt.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use tokio::time::{Instant, sleep};
use uuid::Uuid;

use crate::application::ports::{QueueError, QueueMessage, ReceivedMessage, WorkQueue};

const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(sqlx::FromRow)]
struct DeliveryRow {
    id: Uuid,
    body: String,
    receive_count: i32,
    receipt: Uuid,
}

impl From<DeliveryRow> for ReceivedMessage {
    fn from(row: DeliveryRow) -> Self {
        Self {
            message_id: row.id.to_string(),
            receipt_handle: row.receipt.to_string(),
            body: row.body,
            receive_count: u32::try_from(row.receive_count).unwrap_or(u32::MAX),
        }
    }
}

#[derive(Clone)]
pub struct PostgresWorkQueue {
    pool: PgPool,
    visibility_timeout: Duration,
}

impl PostgresWorkQueue {
    pub fn new(pool: PgPool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
        }
    }

    async fn receive_visible(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, QueueError> {
        let rows = sqlx::query_as::<_, DeliveryRow>(
            "WITH next AS ( \
                 SELECT id FROM work_queue \
                  WHERE visible_at <= now() \
                  ORDER BY enqueued_at ASC \
                  LIMIT $1 \
                  FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE work_queue q \
                SET visible_at = now() + make_interval(secs => $2), \
                    receive_count = q.receive_count + 1, \
                    receipt = gen_random_uuid() \
               FROM next \
              WHERE q.id = next.id \
             RETURNING q.id, q.body, q.receive_count, q.receipt",
        )
        .bind(i64::try_from(max_messages.max(1)).unwrap_or(i64::MAX))
        .bind(self.visibility_timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        Ok(rows.into_iter().map(ReceivedMessage::from).collect())
    }
}

fn backend(err: sqlx::Error) -> QueueError {
    QueueError::Backend(err.to_string())
}

#[async_trait]
impl WorkQueue for PostgresWorkQueue {
    async fn send(&self, message: &QueueMessage) -> Result<String, QueueError> {
        let body = serde_json::to_string(message)?;
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO work_queue (id, body) VALUES ($1, $2)")
            .bind(id)
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(id.to_string())
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let batch = self.receive_visible(max_messages).await?;
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }
            sleep(RECEIVE_POLL_INTERVAL).await;
        }
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let receipt = Uuid::parse_str(receipt_handle)
            .map_err(|err| QueueError::Backend(format!("malformed receipt handle: {err}")))?;
        sqlx::query("DELETE FROM work_queue WHERE receipt = $1")
            .bind(receipt)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}
