//! v001 -- Local keypair table.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- One row per account signed in on this device. The private key never
-- leaves this table.
CREATE TABLE IF NOT EXISTS local_keypair (
    uid          TEXT PRIMARY KEY NOT NULL,
    public_key   TEXT NOT NULL,               -- base64url X25519 public key
    private_key  TEXT NOT NULL,               -- base64url X25519 secret
    created_at   TEXT NOT NULL                -- RFC-3339
);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
