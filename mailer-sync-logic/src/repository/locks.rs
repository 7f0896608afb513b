//! Per-email advisory locking. The lock is transaction-scoped, so holding
//! it for the duration of a record sync serializes concurrent
//! reconciliations of the same email across all processes sharing the
//! database.

use sea_orm::{ConnectionTrait, Statement};
use sha2::{Digest, Sha256};

/// 64-bit advisory key derived from the canonical email.
pub fn record_lock_key(email: &str) -> i64 {
    let digest = Sha256::digest(format!("sync_{email}"));
    i64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// Blocks until the lock for this email is granted; released automatically
/// at transaction end.
pub async fn acquire_record_lock<C>(db: &C, email: &str) -> Result<(), anyhow::Error>
where
    C: ConnectionTrait,
{
    let key = record_lock_key(email);
    db.execute(Statement::from_sql_and_values(
        db.get_database_backend(),
        "SELECT pg_advisory_xact_lock($1)",
        [key.into()],
    ))
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_is_deterministic() {
        assert_eq!(
            record_lock_key("jan@example.com"),
            record_lock_key("jan@example.com")
        );
    }

    #[test]
    fn lock_key_differs_per_email() {
        assert_ne!(
            record_lock_key("jan@example.com"),
            record_lock_key("piet@example.com")
        );
    }
}
