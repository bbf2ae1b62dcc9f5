//! Ingest handler - stores batches uploaded by SDKs.

use crate::db;
use crate::error::{AppError, Result};
use approver_engine::{IdentitySnapshot, UploadRequest, UploadResponse};
use sqlx::PgPool;
use std::collections::HashSet;

/// Check that a batch belongs to the authenticated app and is well-formed.
pub fn validate_batch(app_id: &str, request: &UploadRequest) -> Result<()> {
    if request.device_id.trim().is_empty() {
        return Err(AppError::BadRequest("deviceId must not be empty".into()));
    }

    if let Some(identity) = &request.identity {
        check_identity(app_id, &request.device_id, identity)?;
    }

    let mut seen = HashSet::with_capacity(request.records.len());
    for record in &request.records {
        if record.sequence == 0 {
            return Err(AppError::BadRequest("sequence must be positive".into()));
        }
        if !seen.insert(record.sequence) {
            return Err(AppError::BadRequest(format!(
                "duplicate sequence {} in batch",
                record.sequence
            )));
        }
        check_identity(app_id, &request.device_id, &record.identity)?;
    }

    Ok(())
}

fn check_identity(app_id: &str, device_id: &str, identity: &IdentitySnapshot) -> Result<()> {
    if identity.app_id != app_id {
        return Err(AppError::Forbidden(format!(
            "record for app {} uploaded by app {}",
            identity.app_id, app_id
        )));
    }
    if identity.device_id != device_id {
        return Err(AppError::BadRequest(format!(
            "record for device {} in batch of device {}",
            identity.device_id, device_id
        )));
    }
    Ok(())
}

/// Store a batch and acknowledge it.
///
/// Records are inserted idempotently on `(device_id, sequence)`, so a retried
/// batch is acknowledged again without being stored twice.
pub async fn handle_batch(
    pool: &PgPool,
    app_id: &str,
    request: UploadRequest,
) -> Result<UploadResponse> {
    validate_batch(app_id, &request)?;

    let Some(acked_through) = request.records.iter().map(|r| r.sequence).max() else {
        return Ok(UploadResponse { acked_through: 0 });
    };

    let rows = request
        .records
        .iter()
        .map(db::NewRecord::from_record)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(AppError::BadRequest)?;
    let last_sequence = rows.iter().map(|r| r.sequence).max().unwrap_or(0);

    // The newest identity wins: the one sent with the batch, else the one on
    // the latest record
    let identity = request.identity.clone().or_else(|| {
        request
            .records
            .iter()
            .max_by_key(|r| r.sequence)
            .map(|r| r.identity.clone())
    });

    let mut tx = pool.begin().await?;
    let mut inserted = 0;
    for row in &rows {
        if db::insert_record(&mut *tx, &request.device_id, row).await? {
            inserted += 1;
        }
    }
    if let Some(identity) = &identity {
        db::upsert_device(&mut *tx, identity, last_sequence).await?;
    }
    tx.commit().await?;

    tracing::info!(
        %app_id,
        device_id = %request.device_id,
        records = rows.len(),
        inserted,
        duplicates = rows.len() - inserted,
        acked_through,
        "batch stored"
    );

    Ok(UploadResponse { acked_through })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approver_engine::{Attributes, Batch, Record, RecordBody};

    fn record(sequence: u64, app_id: &str, body: RecordBody) -> Record {
        Record::new(
            sequence,
            1000,
            IdentitySnapshot {
                app_id: app_id.into(),
                device_id: "device-1".into(),
                push_token: None,
                user_id: None,
                user_email: None,
            },
            body,
        )
    }

    fn event(sequence: u64) -> Record {
        record(
            sequence,
            "app-1",
            RecordBody::Event {
                name: "open".into(),
                attributes: Attributes::new(),
            },
        )
    }

    fn request(records: Vec<Record>) -> UploadRequest {
        let batch = Batch {
            records,
            attempt: 1,
        };
        UploadRequest::new("device-1", None, &batch, 2000)
    }

    #[test]
    fn valid_batch_passes() {
        assert!(validate_batch("app-1", &request(vec![event(1), event(2)])).is_ok());
        assert!(validate_batch("app-1", &request(vec![])).is_ok());
    }

    #[test]
    fn immediate_records_may_lead() {
        let immediate = record(
            5,
            "app-1",
            RecordBody::UserAttributes {
                attributes: Attributes::new(),
            },
        );
        let batch = request(vec![immediate, event(1), event(2)]);
        assert!(validate_batch("app-1", &batch).is_ok());
    }

    #[test]
    fn foreign_app_rejected() {
        let batch = request(vec![event(1), record(2, "app-2", RecordBody::PushTokenUpdate { token: None })]);
        assert!(matches!(
            validate_batch("app-1", &batch),
            Err(AppError::Forbidden(_))
        ));
    }

    #[test]
    fn malformed_batches_rejected() {
        assert!(matches!(
            validate_batch("app-1", &request(vec![event(0)])),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            validate_batch("app-1", &request(vec![event(2), event(2)])),
            Err(AppError::BadRequest(_))
        ));

        let mut batch = request(vec![event(1)]);
        batch.device_id = "device-2".into();
        assert!(matches!(
            validate_batch("app-1", &batch),
            Err(AppError::BadRequest(_))
        ));
    }
}
