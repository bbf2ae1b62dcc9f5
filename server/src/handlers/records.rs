//! Records handler - serves stored records of a device.

use crate::db;
use crate::error::Result;
use approver_engine::{Record, Sequence};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

/// Query parameters for reading records.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordsQuery {
    /// Return records after this sequence (exclusive)
    pub since: Option<i64>,
    /// Maximum number of records to return
    pub limit: Option<i64>,
}

/// Response for reading records.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordsResponse {
    pub device_id: String,
    /// Records in sequence order
    pub records: Vec<Record>,
    /// Pass as `since` to fetch the next page
    pub next_since: Sequence,
    /// Whether there are more records to fetch
    pub has_more: bool,
}

/// Default limit for record reads.
const DEFAULT_LIMIT: i64 = 100;

/// Maximum limit for record reads.
const MAX_LIMIT: i64 = 1000;

/// Effective page size for a query.
pub fn page_limit(query: &RecordsQuery) -> i64 {
    query
        .limit
        .map(|l| l.clamp(1, MAX_LIMIT))
        .unwrap_or(DEFAULT_LIMIT)
}

/// Read a page of a device's records.
pub async fn handle_records(
    pool: &PgPool,
    app_id: &str,
    device_id: &str,
    query: RecordsQuery,
) -> Result<RecordsResponse> {
    let limit = page_limit(&query);
    let since = query.since.unwrap_or(0).max(0);

    // Fetch one more than requested to check if there are more
    let stored = db::get_records_since(pool, app_id, device_id, since, limit + 1).await?;

    let has_more = stored.len() as i64 > limit;
    let mut records = Vec::with_capacity(stored.len());
    for row in stored.iter().take(limit as usize) {
        match row.to_record() {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(
                    device_id = %row.device_id,
                    sequence = row.sequence,
                    error = %e,
                    "skipping unreadable stored record"
                );
            }
        }
    }

    let next_since = stored
        .iter()
        .take(limit as usize)
        .map(|r| r.sequence as Sequence)
        .max()
        .unwrap_or(since as Sequence);

    Ok(RecordsResponse {
        device_id: device_id.to_string(),
        records,
        next_since,
        has_more,
    })
}
