//! Database operations for the devices table.

use approver_engine::IdentitySnapshot;
use sqlx::PgConnection;

/// Record the latest identity of a device and the highest sequence seen.
pub async fn upsert_device(
    conn: &mut PgConnection,
    identity: &IdentitySnapshot,
    last_sequence: i64,
) -> Result<(), sqlx::Error> {
    let push_token = identity
        .push_token
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    sqlx::query(
        r#"
        INSERT INTO devices (
            device_id, app_id, push_token, user_id, user_email, last_sequence
        )
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (device_id) DO UPDATE SET
            app_id = EXCLUDED.app_id,
            push_token = EXCLUDED.push_token,
            user_id = EXCLUDED.user_id,
            user_email = EXCLUDED.user_email,
            last_sequence = GREATEST(devices.last_sequence, EXCLUDED.last_sequence),
            last_seen_at = NOW()
        "#,
    )
    .bind(&identity.device_id)
    .bind(&identity.app_id)
    .bind(push_token)
    .bind(&identity.user_id)
    .bind(&identity.user_email)
    .bind(last_sequence)
    .execute(conn)
    .await?;

    Ok(())
}
