//! Encrypted token storage using SQLite.

use super::{encryption::TokenCipher, CredentialStore, Token};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Token store backed by SQLite, one row per service id.
///
/// # Schema
/// ```sql
/// CREATE TABLE tokens (
///     service_id TEXT PRIMARY KEY,
///     access_token TEXT NOT NULL,       -- Sealed
///     access_token_nonce TEXT NOT NULL,
///     refresh_token TEXT,               -- Sealed (optional)
///     refresh_token_nonce TEXT,
///     raw TEXT NOT NULL,                -- Sealed provider response (JSON)
///     raw_nonce TEXT NOT NULL,
///     expires_at TEXT,                  -- RFC 3339 (optional)
///     updated_at TEXT NOT NULL          -- RFC 3339
/// );
/// ```
///
/// The raw provider response is sealed too since it repeats both tokens.
pub struct SqliteCredentialStore {
    conn: Mutex<Connection>,
    cipher: TokenCipher,
}

impl SqliteCredentialStore {
    /// Creates or opens a store.
    ///
    /// `encryption_key` is a base64-encoded 32-byte master key. Pass
    /// `":memory:"` as the path for a throwaway database.
    pub fn open<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> Result<Self> {
        let cipher =
            TokenCipher::from_base64_key(encryption_key).context("Invalid encryption key")?;

        let conn = Connection::open(db_path).context("Failed to open database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS tokens (
                service_id TEXT PRIMARY KEY,
                access_token TEXT NOT NULL,
                access_token_nonce TEXT NOT NULL,
                refresh_token TEXT,
                refresh_token_nonce TEXT,
                raw TEXT NOT NULL,
                raw_nonce TEXT NOT NULL,
                expires_at TEXT,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create tokens table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn get(&self, id: &str) -> Result<Option<Token>> {
        type Row = (
            String,
            String,
            Option<String>,
            Option<String>,
            String,
            String,
            Option<String>,
        );

        let row: Option<Row> = self
            .conn()?
            .query_row(
                r#"
                SELECT access_token, access_token_nonce,
                       refresh_token, refresh_token_nonce,
                       raw, raw_nonce, expires_at
                FROM tokens
                WHERE service_id = ?1
                "#,
                params![id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query token")?;

        let Some((access, access_nonce, refresh, refresh_nonce, raw, raw_nonce, expires_at)) = row
        else {
            return Ok(None);
        };

        let access_token = self
            .cipher
            .open(&access, &access_nonce)
            .context("Failed to decrypt access token")?;

        let refresh_token = match (refresh, refresh_nonce) {
            (Some(sealed), Some(nonce)) => Some(
                self.cipher
                    .open(&sealed, &nonce)
                    .context("Failed to decrypt refresh token")?,
            ),
            _ => None,
        };

        let raw = self
            .cipher
            .open(&raw, &raw_nonce)
            .context("Failed to decrypt token response")?;
        let raw = serde_json::from_str(&raw).context("Stored token response is not JSON")?;

        let expires_at = expires_at
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|dt| dt.with_timezone(&Utc)))
            .transpose()
            .context("Failed to parse expires_at timestamp")?;

        Ok(Some(Token {
            access_token,
            refresh_token,
            expires_at,
            raw,
        }))
    }

    fn put(&self, id: &str, token: &Token) -> Result<()> {
        let access = self
            .cipher
            .seal(&token.access_token)
            .context("Failed to encrypt access token")?;

        let refresh = token
            .refresh_token
            .as_deref()
            .map(|t| self.cipher.seal(t))
            .transpose()
            .context("Failed to encrypt refresh token")?;

        let raw = self
            .cipher
            .seal(&token.raw.to_string())
            .context("Failed to encrypt token response")?;

        let expires_at = token.expires_at.map(|dt| dt.to_rfc3339());
        let now = Utc::now().to_rfc3339();

        self.conn()?
            .execute(
                r#"
                INSERT INTO tokens (
                    service_id,
                    access_token, access_token_nonce,
                    refresh_token, refresh_token_nonce,
                    raw, raw_nonce,
                    expires_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(service_id) DO UPDATE SET
                    access_token = excluded.access_token,
                    access_token_nonce = excluded.access_token_nonce,
                    refresh_token = excluded.refresh_token,
                    refresh_token_nonce = excluded.refresh_token_nonce,
                    raw = excluded.raw,
                    raw_nonce = excluded.raw_nonce,
                    expires_at = excluded.expires_at,
                    updated_at = excluded.updated_at
                "#,
                params![
                    id,
                    access.ciphertext,
                    access.nonce,
                    refresh.as_ref().map(|s| s.ciphertext.as_str()),
                    refresh.as_ref().map(|s| s.nonce.as_str()),
                    raw.ciphertext,
                    raw.nonce,
                    expires_at,
                    now,
                ],
            )
            .context("Failed to store token")?;

        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let rows_affected = self
            .conn()?
            .execute("DELETE FROM tokens WHERE service_id = ?1", params![id])
            .context("Failed to delete token")?;

        Ok(rows_affected > 0)
    }
}
