use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use base64::Engine;
use rusqlite::{params, Connection};

use crate::trace::Span;

// Best-effort crash-recovery cache for the most recent voice recording. One
// slot only; callers ignore store failures.
#[derive(Debug, Clone)]
pub struct CachedRecording {
    pub created_at_ms: i64,
    pub mime: String,
    pub bytes: Vec<u8>,
}

pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("recordings.sqlite3")
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn conn(data_dir: &Path) -> Result<Connection> {
    std::fs::create_dir_all(data_dir).ok();
    let c = Connection::open(db_path(data_dir)).context("open sqlite failed")?;
    c.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS last_recording (
          slot INTEGER PRIMARY KEY CHECK (slot = 0),
          created_at_ms INTEGER NOT NULL,
          mime TEXT NOT NULL,
          data_b64 TEXT NOT NULL
        );
        "#,
    )
    .context("init sqlite schema failed")?;
    Ok(c)
}

pub fn store(data_dir: &Path, mime: &str, bytes: &[u8]) -> Result<()> {
    let span = Span::start(
        data_dir,
        None,
        "RecordingCache",
        "CACHE.store",
        Some(serde_json::json!({ "mime": mime, "bytes": bytes.len() })),
    );

    let c = match conn(data_dir) {
        Ok(c) => c,
        Err(e) => {
            span.err("db", "E_RECORDING_CACHE_CONN", &e.to_string(), None);
            return Err(e);
        }
    };
    let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
    let r = c.execute(
        r#"
        INSERT OR REPLACE INTO last_recording (slot, created_at_ms, mime, data_b64)
        VALUES (0, ?1, ?2, ?3)
        "#,
        params![now_ms(), mime, b64],
    );
    match r {
        Ok(_) => {
            span.ok(None);
            Ok(())
        }
        Err(e) => {
            span.err("db", "E_RECORDING_CACHE_INSERT", &format!("{e}"), None);
            Err(anyhow::anyhow!(e).context("insert recording cache failed"))
        }
    }
}

pub fn load(data_dir: &Path) -> Result<Option<CachedRecording>> {
    let span = Span::start(data_dir, None, "RecordingCache", "CACHE.load", None);

    let c = match conn(data_dir) {
        Ok(c) => c,
        Err(e) => {
            span.err("db", "E_RECORDING_CACHE_CONN", &e.to_string(), None);
            return Err(e);
        }
    };
    let row = c
        .query_row(
            "SELECT created_at_ms, mime, data_b64 FROM last_recording WHERE slot = 0",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        });
    let row = match row {
        Ok(v) => v,
        Err(e) => {
            span.err("db", "E_RECORDING_CACHE_QUERY", &format!("{e}"), None);
            return Err(anyhow::anyhow!(e).context("query recording cache failed"));
        }
    };
    let Some((created_at_ms, mime, data_b64)) = row else {
        span.ok(Some(serde_json::json!({ "found": false })));
        return Ok(None);
    };

    let bytes = match base64::engine::general_purpose::STANDARD.decode(data_b64.as_bytes()) {
        Ok(v) => v,
        Err(e) => {
            span.err("parse", "E_RECORDING_CACHE_DECODE", &format!("{e}"), None);
            return Err(anyhow::anyhow!(e).context("recording cache base64 decode failed"));
        }
    };
    span.ok(Some(serde_json::json!({ "found": true, "bytes": bytes.len() })));
    Ok(Some(CachedRecording {
        created_at_ms,
        mime,
        bytes,
    }))
}

pub fn clear(data_dir: &Path) -> Result<()> {
    let span = Span::start(data_dir, None, "RecordingCache", "CACHE.clear", None);
    let c = match conn(data_dir) {
        Ok(c) => c,
        Err(e) => {
            span.err("db", "E_RECORDING_CACHE_CONN", &e.to_string(), None);
            return Err(e);
        }
    };
    match c.execute("DELETE FROM last_recording", []) {
        Ok(_) => {
            span.ok(None);
            Ok(())
        }
        Err(e) => {
            span.err("db", "E_RECORDING_CACHE_CLEAR", &format!("{e}"), None);
            Err(anyhow::anyhow!(e).context("clear recording cache failed"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_load_roundtrips_bytes() {
        let td = tempfile::tempdir().expect("tempdir");
        store(td.path(), "audio/mp3", b"fake-mp3-bytes").expect("store");
        let got = load(td.path()).expect("load").expect("cached");
        assert_eq!(got.mime, "audio/mp3");
        assert_eq!(got.bytes, b"fake-mp3-bytes");
        assert!(got.created_at_ms > 0);
    }

    #[test]
    fn store_replaces_previous_recording() {
        let td = tempfile::tempdir().expect("tempdir");
        store(td.path(), "audio/mp3", b"first").expect("store");
        store(td.path(), "audio/wav", b"second").expect("store");
        let got = load(td.path()).expect("load").expect("cached");
        assert_eq!(got.mime, "audio/wav");
        assert_eq!(got.bytes, b"second");
    }

    #[test]
    fn load_on_fresh_dir_returns_none_and_clear_empties() {
        let td = tempfile::tempdir().expect("tempdir");
        assert!(load(td.path()).expect("load").is_none());

        store(td.path(), "audio/mp3", b"x").expect("store");
        clear(td.path()).expect("clear");
        assert!(load(td.path()).expect("load").is_none());
    }
}
