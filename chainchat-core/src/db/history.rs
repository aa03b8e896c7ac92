//! Confirmed history cache and conversation cursors
//!
//! `ledger_messages` holds ciphertext of messages known to be on the ledger,
//! so the read model can be rebuilt offline. Cursors bookmark how far each
//! conversation's ledger history has been merged.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::CoreResult;
use crate::models::ConversationCursor;

/// A confirmed message as cached locally (ciphertext only)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedRecord {
    pub id: String,
    pub counterpart: String,
    pub sender: String,
    pub recipient: String,
    pub ciphertext: String,
    /// Client timestamp from the sealed body
    pub sent_at: i64,
    pub ledger_index: u64,
    pub ledger_timestamp: i64,
}

/// SQLite-backed cursor and history store
#[derive(Clone)]
pub struct HistoryStore {
    db: SqlitePool,
}

impl HistoryStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Current cursor for a conversation (zero if never refreshed)
    pub async fn cursor(&self, counterpart: &str) -> CoreResult<ConversationCursor> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT last_index, last_timestamp FROM conversation_cursors WHERE counterpart = ?",
        )
        .bind(counterpart)
        .fetch_optional(&self.db)
        .await?;

        Ok(row
            .map(|(index, timestamp)| ConversationCursor {
                last_index: index.max(0) as u64,
                last_timestamp: timestamp,
            })
            .unwrap_or_default())
    }

    /// Move the cursor forward; a lower index leaves it untouched
    ///
    /// Returns the stored cursor after the update.
    pub async fn advance_cursor(
        &self,
        counterpart: &str,
        to: ConversationCursor,
    ) -> CoreResult<ConversationCursor> {
        sqlx::query(
            r#"
            INSERT INTO conversation_cursors (counterpart, last_index, last_timestamp, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(counterpart) DO UPDATE SET
                last_timestamp = CASE
                    WHEN excluded.last_index > last_index
                    THEN MAX(last_timestamp, excluded.last_timestamp)
                    ELSE last_timestamp
                END,
                last_index = MAX(last_index, excluded.last_index),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(counterpart)
        .bind(to.last_index as i64)
        .bind(to.last_timestamp)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.db)
        .await?;

        self.cursor(counterpart).await
    }

    /// Cache a confirmed message
    ///
    /// Returns `false` if a message with this id is already cached.
    pub async fn insert_confirmed(&self, record: &ConfirmedRecord) -> CoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO ledger_messages
                (id, counterpart, sender, recipient, ciphertext, sent_at, ledger_index, ledger_timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&record.id)
        .bind(&record.counterpart)
        .bind(&record.sender)
        .bind(&record.recipient)
        .bind(&record.ciphertext)
        .bind(record.sent_at)
        .bind(record.ledger_index as i64)
        .bind(record.ledger_timestamp)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// All cached confirmed messages of a conversation, oldest first
    pub async fn load_conversation(&self, counterpart: &str) -> CoreResult<Vec<ConfirmedRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, counterpart, sender, recipient, ciphertext, sent_at, ledger_index, ledger_timestamp
            FROM ledger_messages
            WHERE counterpart = ?
            ORDER BY sent_at ASC, id ASC
            "#,
        )
        .bind(counterpart)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    /// Cached confirmed message by id
    pub async fn get(&self, id: &str) -> CoreResult<Option<ConfirmedRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, counterpart, sender, recipient, ciphertext, sent_at, ledger_index, ledger_timestamp
            FROM ledger_messages
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }
}

fn record_from_row(row: &SqliteRow) -> CoreResult<ConfirmedRecord> {
    let ledger_index: i64 = row.try_get("ledger_index")?;
    Ok(ConfirmedRecord {
        id: row.try_get("id")?,
        counterpart: row.try_get("counterpart")?,
        sender: row.try_get("sender")?,
        recipient: row.try_get("recipient")?,
        ciphertext: row.try_get("ciphertext")?,
        sent_at: row.try_get("sent_at")?,
        ledger_index: ledger_index.max(0) as u64,
        ledger_timestamp: row.try_get("ledger_timestamp")?,
    })
}
