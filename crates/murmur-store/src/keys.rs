use chrono::{DateTime, Utc};
use murmur_shared::{KeyPair, UserId};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;

/// Device-local keypair row.
#[derive(Debug, Clone)]
pub struct StoredKeyPair {
    pub uid: UserId,
    pub keypair: KeyPair,
    pub created_at: DateTime<Utc>,
}

impl Database {
    pub fn save_keypair(&self, uid: &UserId, keypair: &KeyPair, created_at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "INSERT INTO local_keypair (uid, public_key, private_key, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(uid) DO UPDATE SET
                public_key = excluded.public_key,
                private_key = excluded.private_key,
                created_at = excluded.created_at",
            params![
                uid.as_str(),
                keypair.public_key_b64(),
                keypair.secret_b64(),
                created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load_keypair(&self, uid: &UserId) -> Result<Option<StoredKeyPair>> {
        let row = self
            .conn()
            .query_row(
                "SELECT uid, private_key, created_at FROM local_keypair WHERE uid = ?1",
                params![uid.as_str()],
                |row| {
                    let uid: String = row.get(0)?;
                    let private_key: String = row.get(1)?;
                    let created: String = row.get(2)?;
                    Ok((uid, private_key, created))
                },
            )
            .optional()?;

        let Some((uid, private_key, created)) = row else {
            return Ok(None);
        };

        let keypair = KeyPair::from_secret_b64(&private_key)?;
        let created_at = DateTime::parse_from_rfc3339(&created)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
            })?;

        Ok(Some(StoredKeyPair {
            uid: UserId::new(uid),
            keypair,
            created_at,
        }))
    }

    /// Load this device's keypair for `uid`, generating and persisting a new
    /// one on first use.
    pub fn ensure_keypair(&self, uid: &UserId) -> Result<StoredKeyPair> {
        if let Some(stored) = self.load_keypair(uid)? {
            return Ok(stored);
        }

        let keypair = KeyPair::generate();
        let created_at = Utc::now();
        self.save_keypair(uid, &keypair, created_at)?;
        tracing::info!(uid = %uid.short(), "generated new local keypair");

        Ok(StoredKeyPair {
            uid: uid.clone(),
            keypair,
            created_at,
        })
    }

    pub fn delete_keypair(&self, uid: &UserId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM local_keypair WHERE uid = ?1", params![uid.as_str()])?;
        Ok(affected > 0)
    }
}
