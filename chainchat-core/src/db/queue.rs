//! Durable outbound queue
//!
//! Every status change is a compare-and-set on the row's current status
//! (`UPDATE ... WHERE id = ? AND status = ?`), so two writers can never both
//! move the same entry and a disallowed transition is reported instead of
//! silently applied.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{CoreError, CoreResult};
use crate::models::{Message, MessageStatus, QueueEntry};

const ENTRY_COLUMNS: &str = "id, sender, recipient, ciphertext, timestamp, status, \
                             attempt_count, next_retry_at, last_error, ledger_index, ledger_timestamp";

/// SQLite-backed store for outbound messages
#[derive(Clone)]
pub struct QueueStore {
    db: SqlitePool,
}

impl QueueStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Persist a new outbound message as `pending`
    ///
    /// Durable when this returns. Plaintext is never written.
    pub async fn enqueue(&self, message: &Message) -> CoreResult<QueueEntry> {
        let now = now_ms();

        sqlx::query(
            r#"
            INSERT INTO outbound_queue
                (id, sender, recipient, ciphertext, timestamp, status, attempt_count, updated_at)
            VALUES (?, ?, ?, ?, ?, 'pending', 0, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.sender)
        .bind(&message.recipient)
        .bind(&message.ciphertext)
        .bind(message.timestamp)
        .bind(now)
        .execute(&self.db)
        .await?;

        tracing::debug!("Enqueued message {} for {}", message.id, message.recipient);

        Ok(QueueEntry {
            message: Message {
                status: MessageStatus::Pending,
                last_error: None,
                ..message.clone()
            },
            attempt_count: 0,
            next_retry_at: None,
            last_error: None,
            ledger_index: None,
            ledger_timestamp: None,
        })
    }

    /// Get one entry
    pub async fn get(&self, id: &str) -> CoreResult<Option<QueueEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM outbound_queue WHERE id = ?",
            ENTRY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        row.map(|r| entry_from_row(&r)).transpose()
    }

    /// Entries the sync engine still has to deliver (`pending` and
    /// `submitting`), oldest first
    pub async fn list_pending(&self) -> CoreResult<Vec<QueueEntry>> {
        self.list_where("status IN ('pending', 'submitting')").await
    }

    /// Entries that exhausted their retry budget
    pub async fn list_failed(&self) -> CoreResult<Vec<QueueEntry>> {
        self.list_where("status = 'failed'").await
    }

    /// Entries confirmed on the ledger but not yet removed
    pub async fn list_confirmed(&self) -> CoreResult<Vec<QueueEntry>> {
        self.list_where("status = 'confirmed'").await
    }

    /// Undelivered entries for one recipient, oldest first
    pub async fn list_for_recipient(&self, recipient: &str) -> CoreResult<Vec<QueueEntry>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM outbound_queue
            WHERE recipient = ? AND status IN ('pending', 'submitting', 'failed')
            ORDER BY timestamp ASC, id ASC
            "#,
            ENTRY_COLUMNS
        ))
        .bind(recipient)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    /// `pending -> submitting`
    pub async fn mark_submitting(&self, id: &str) -> CoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbound_queue SET status = 'submitting', updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(now_ms())
        .bind(id)
        .execute(&self.db)
        .await?;

        self.check_transition(id, result.rows_affected(), MessageStatus::Submitting)
            .await
    }

    /// `submitting -> confirmed`, recording the ledger position
    pub async fn mark_confirmed(&self, id: &str, ledger_index: u64, ledger_timestamp: i64) -> CoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbound_queue
            SET status = 'confirmed', ledger_index = ?, ledger_timestamp = ?,
                next_retry_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'submitting'
            "#,
        )
        .bind(ledger_index as i64)
        .bind(ledger_timestamp)
        .bind(now_ms())
        .bind(id)
        .execute(&self.db)
        .await?;

        self.check_transition(id, result.rows_affected(), MessageStatus::Confirmed)
            .await
    }

    /// `submitting -> pending` after a retryable failure
    ///
    /// Increments the attempt count and records when the next attempt may run.
    pub async fn schedule_retry(&self, id: &str, error: &str, next_retry_at: i64) -> CoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbound_queue
            SET status = 'pending', attempt_count = attempt_count + 1,
                next_retry_at = ?, last_error = ?, updated_at = ?
            WHERE id = ? AND status = 'submitting'
            "#,
        )
        .bind(next_retry_at)
        .bind(error)
        .bind(now_ms())
        .bind(id)
        .execute(&self.db)
        .await?;

        self.check_transition(id, result.rows_affected(), MessageStatus::Pending)
            .await
    }

    /// `submitting -> failed` once the retry budget is exhausted
    pub async fn mark_failed(&self, id: &str, error: &str) -> CoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbound_queue
            SET status = 'failed', attempt_count = attempt_count + 1,
                next_retry_at = NULL, last_error = ?, updated_at = ?
            WHERE id = ? AND status = 'submitting'
            "#,
        )
        .bind(error)
        .bind(now_ms())
        .bind(id)
        .execute(&self.db)
        .await?;

        self.check_transition(id, result.rows_affected(), MessageStatus::Failed)
            .await
    }

    /// `failed -> pending` on explicit user retry, with a fresh retry budget
    ///
    /// `last_error` is kept: the last attempt may have reached the ledger.
    pub async fn reset_failed(&self, id: &str) -> CoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbound_queue
            SET status = 'pending', attempt_count = 0, next_retry_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'failed'
            "#,
        )
        .bind(now_ms())
        .bind(id)
        .execute(&self.db)
        .await?;

        self.check_transition(id, result.rows_affected(), MessageStatus::Pending)
            .await
    }

    /// Delete a confirmed entry
    pub async fn remove(&self, id: &str) -> CoreResult<()> {
        let result = sqlx::query("DELETE FROM outbound_queue WHERE id = ? AND status = 'confirmed'")
            .bind(id)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return match self.status_of(id).await? {
                None => Err(CoreError::NotFound(id.to_string())),
                Some(from) => Err(CoreError::InvalidTransition {
                    id: id.to_string(),
                    from,
                    to: MessageStatus::Confirmed,
                }),
            };
        }
        Ok(())
    }

    async fn list_where(&self, condition: &str) -> CoreResult<Vec<QueueEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM outbound_queue WHERE {} ORDER BY timestamp ASC, id ASC",
            ENTRY_COLUMNS, condition
        ))
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn status_of(&self, id: &str) -> CoreResult<Option<MessageStatus>> {
        let status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM outbound_queue WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.db)
                .await?;

        status.map(|(s,)| s.parse()).transpose()
    }

    /// Turn a zero-row compare-and-set into the matching error
    async fn check_transition(&self, id: &str, rows: u64, to: MessageStatus) -> CoreResult<()> {
        if rows > 0 {
            return Ok(());
        }

        match self.status_of(id).await? {
            None => Err(CoreError::NotFound(id.to_string())),
            Some(from) => {
                tracing::error!("Rejected queue transition for {}: {} -> {}", id, from, to);
                Err(CoreError::InvalidTransition {
                    id: id.to_string(),
                    from,
                    to,
                })
            }
        }
    }
}

fn entry_from_row(row: &SqliteRow) -> CoreResult<QueueEntry> {
    let status: String = row.try_get("status")?;
    let last_error: Option<String> = row.try_get("last_error")?;
    let attempt_count: i64 = row.try_get("attempt_count")?;
    let ledger_index: Option<i64> = row.try_get("ledger_index")?;

    Ok(QueueEntry {
        message: Message {
            id: row.try_get("id")?,
            sender: row.try_get("sender")?,
            recipient: row.try_get("recipient")?,
            plaintext: None,
            ciphertext: row.try_get("ciphertext")?,
            timestamp: row.try_get("timestamp")?,
            status: status.parse()?,
            last_error: last_error.clone(),
        },
        attempt_count: attempt_count.max(0) as u32,
        next_retry_at: row.try_get("next_retry_at")?,
        last_error,
        ledger_index: ledger_index.map(|i| i.max(0) as u64),
        ledger_timestamp: row.try_get("ledger_timestamp")?,
    })
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn message(id: &str, recipient: &str, timestamp: i64) -> Message {
        Message {
            id: id.to_string(),
            sender: "alice".to_string(),
            recipient: recipient.to_string(),
            plaintext: Some("never stored".to_string()),
            ciphertext: format!("cipher-{}", id),
            timestamp,
            status: MessageStatus::Pending,
            last_error: None,
        }
    }

    async fn store() -> QueueStore {
        QueueStore::new(db::open_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_enqueue_and_list_in_timestamp_order() {
        let queue = store().await;
        queue.enqueue(&message("b", "bob", 20)).await.unwrap();
        queue.enqueue(&message("a", "bob", 10)).await.unwrap();
        queue.enqueue(&message("c", "carol", 15)).await.unwrap();

        let ids: Vec<_> = queue
            .list_pending()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.message.id)
            .collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
    }

    #[tokio::test]
    async fn test_plaintext_is_not_persisted() {
        let queue = store().await;
        queue.enqueue(&message("a", "bob", 10)).await.unwrap();

        let entry = queue.get("a").await.unwrap().unwrap();
        assert!(entry.message.plaintext.is_none());
        assert_eq!(entry.message.ciphertext, "cipher-a");
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let queue = store().await;
        queue.enqueue(&message("a", "bob", 10)).await.unwrap();

        queue.mark_submitting("a").await.unwrap();
        queue.schedule_retry("a", "ledger busy", 5_000).await.unwrap();

        let entry = queue.get("a").await.unwrap().unwrap();
        assert_eq!(entry.status(), MessageStatus::Pending);
        assert_eq!(entry.attempt_count, 1);
        assert_eq!(entry.next_retry_at, Some(5_000));
        assert_eq!(entry.last_error.as_deref(), Some("ledger busy"));

        queue.mark_submitting("a").await.unwrap();
        queue.mark_confirmed("a", 7, 9_000).await.unwrap();
        let confirmed = queue.list_confirmed().await.unwrap();
        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].ledger_index, Some(7));
        assert_eq!(confirmed[0].ledger_timestamp, Some(9_000));
        assert!(queue.list_pending().await.unwrap().is_empty());

        queue.remove("a").await.unwrap();
        assert!(queue.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disallowed_transitions_are_rejected() {
        let queue = store().await;
        queue.enqueue(&message("a", "bob", 10)).await.unwrap();

        let err = queue.mark_confirmed("a", 1, 1).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidTransition {
                from: MessageStatus::Pending,
                to: MessageStatus::Confirmed,
                ..
            }
        ));

        assert!(matches!(
            queue.remove("a").await,
            Err(CoreError::InvalidTransition { .. })
        ));
        assert!(matches!(
            queue.reset_failed("a").await,
            Err(CoreError::InvalidTransition { .. })
        ));

        queue.mark_submitting("a").await.unwrap();
        // A second writer loses the compare-and-set
        assert!(matches!(
            queue.mark_submitting("a").await,
            Err(CoreError::InvalidTransition {
                from: MessageStatus::Submitting,
                ..
            })
        ));

        assert!(matches!(
            queue.mark_submitting("missing").await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_and_user_retry() {
        let queue = store().await;
        queue.enqueue(&message("a", "bob", 10)).await.unwrap();
        queue.mark_submitting("a").await.unwrap();
        queue.mark_failed("a", "rejected").await.unwrap();

        let failed = queue.list_failed().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].message.last_error.as_deref(), Some("rejected"));
        assert_eq!(queue.list_for_recipient("bob").await.unwrap().len(), 1);

        queue.reset_failed("a").await.unwrap();
        let entry = queue.get("a").await.unwrap().unwrap();
        assert_eq!(entry.status(), MessageStatus::Pending);
        assert_eq!(entry.attempt_count, 0);
        assert!(entry.is_in_doubt());
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let queue = store().await;
        queue.enqueue(&message("a", "bob", 10)).await.unwrap();
        assert!(matches!(
            queue.enqueue(&message("a", "bob", 11)).await,
            Err(CoreError::Persistence(_))
        ));
    }

    #[tokio::test]
    async fn test_entries_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let path = path.to_str().unwrap();

        {
            let pool = db::open(path).await.unwrap();
            let queue = QueueStore::new(pool.clone());
            queue.enqueue(&message("a", "bob", 10)).await.unwrap();
            queue.enqueue(&message("b", "bob", 20)).await.unwrap();
            queue.mark_submitting("a").await.unwrap();
            pool.close().await;
        }

        let queue = QueueStore::new(db::open(path).await.unwrap());
        let pending = queue.list_pending().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].status(), MessageStatus::Submitting);
        assert!(pending[0].is_in_doubt());
        assert_eq!(pending[1].status(), MessageStatus::Pending);
    }
}
