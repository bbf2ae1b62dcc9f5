//! Database operations for the records table.

use approver_engine::{IdentitySnapshot, Priority, Record, RecordBody};
use sqlx::{PgConnection, PgPool, Row};

/// A stored record row from the database.
#[derive(Debug)]
pub struct StoredRecord {
    pub device_id: String,
    pub sequence: i64,
    #[allow(dead_code)]
    pub app_id: String,
    pub priority: String,
    pub identity: serde_json::Value,
    pub body: serde_json::Value,
    pub created_at: i64,
    #[allow(dead_code)]
    pub received_at: chrono::DateTime<chrono::Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredRecord {
            device_id: row.try_get("device_id")?,
            sequence: row.try_get("sequence")?,
            app_id: row.try_get("app_id")?,
            priority: row.try_get("priority")?,
            identity: row.try_get("identity")?,
            body: row.try_get("body")?,
            created_at: row.try_get("created_at")?,
            received_at: row.try_get("received_at")?,
        })
    }
}

impl StoredRecord {
    /// Convert database row back to an engine Record.
    pub fn to_record(&self) -> Result<Record, serde_json::Error> {
        let priority: Priority =
            serde_json::from_value(serde_json::Value::String(self.priority.clone()))?;
        let identity: IdentitySnapshot = serde_json::from_value(self.identity.clone())?;
        let body: RecordBody = serde_json::from_value(self.body.clone())?;

        Ok(Record {
            sequence: self.sequence as u64,
            created_at: self.created_at as u64,
            priority,
            identity,
            body,
        })
    }
}

/// Serialized columns of a record about to be stored.
#[derive(Debug)]
pub struct NewRecord {
    pub sequence: i64,
    pub app_id: String,
    pub kind: &'static str,
    pub priority: String,
    pub identity: serde_json::Value,
    pub body: serde_json::Value,
    pub created_at: i64,
}

impl NewRecord {
    /// Prepare a record for storage. Fails if a number does not fit a BIGINT.
    pub fn from_record(record: &Record) -> Result<Self, String> {
        let sequence = i64::try_from(record.sequence)
            .map_err(|_| format!("sequence {} out of range", record.sequence))?;
        let created_at = i64::try_from(record.created_at)
            .map_err(|_| format!("createdAt {} out of range", record.created_at))?;
        let priority = match record.priority {
            Priority::Normal => "normal",
            Priority::Immediate => "immediate",
        };
        let identity = serde_json::to_value(&record.identity).map_err(|e| e.to_string())?;
        let body = serde_json::to_value(&record.body).map_err(|e| e.to_string())?;

        Ok(Self {
            sequence,
            app_id: record.identity.app_id.clone(),
            kind: record.body.kind(),
            priority: priority.to_string(),
            identity,
            body,
            created_at,
        })
    }
}

/// Insert a record unless `(device_id, sequence)` is already stored.
///
/// Returns `true` if the row was new.
pub async fn insert_record(
    conn: &mut PgConnection,
    device_id: &str,
    record: &NewRecord,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO records (
            device_id, sequence, app_id, kind, priority, identity, body, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (device_id, sequence) DO NOTHING
        "#,
    )
    .bind(device_id)
    .bind(record.sequence)
    .bind(&record.app_id)
    .bind(record.kind)
    .bind(&record.priority)
    .bind(&record.identity)
    .bind(&record.body)
    .bind(record.created_at)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Get a device's records after a sequence, oldest first.
pub async fn get_records_since(
    pool: &PgPool,
    app_id: &str,
    device_id: &str,
    since: i64,
    limit: i64,
) -> Result<Vec<StoredRecord>, sqlx::Error> {
    sqlx::query_as::<_, StoredRecord>(
        r#"
        SELECT device_id, sequence, app_id, priority, identity, body,
               created_at, received_at
        FROM records
        WHERE app_id = $1 AND device_id = $2 AND sequence > $3
        ORDER BY sequence ASC
        LIMIT $4
        "#,
    )
    .bind(app_id)
    .bind(device_id)
    .bind(since)
    .bind(limit)
    .fetch_all(pool)
    .await
}
