use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use camino::Utf8PathBuf;
use miette::{IntoDiagnostic, Result, WrapErr};
use milter::{Message, Session, SessionSink};
use serde::Serialize;
use tokio::fs;
use tracing::debug;

/// JSON shape written for one session snapshot.
#[derive(Debug, Serialize)]
struct StoredSession {
    id: u64,
    started_at: u64,
    ended_at: Option<u64>,
    hostname: String,
    address: Option<String>,
    helo: Option<String>,
    tls_version: Option<String>,
    tls_cipher: Option<String>,
    sasl_method: Option<String>,
    sasl_username: Option<String>,
    messages: Vec<StoredMessage>,
}

#[derive(Debug, Serialize)]
struct StoredMessage {
    queue_id: String,
    from: String,
    rcpt: Vec<String>,
    headers: Vec<(String, String)>,
    body: String,
    finalized: bool,
}

impl From<&Session> for StoredSession {
    fn from(session: &Session) -> Self {
        StoredSession {
            id: session.id,
            started_at: unix_seconds(session.started_at),
            ended_at: session.ended_at.map(unix_seconds),
            hostname: session.hostname.clone(),
            address: session.address.map(|addr| addr.to_string()),
            helo: session.helo.clone(),
            tls_version: session.tls.as_ref().map(|tls| tls.tls_version.clone()),
            tls_cipher: session.tls.as_ref().map(|tls| tls.cipher.clone()),
            sasl_method: session.sasl.as_ref().map(|sasl| sasl.method.clone()),
            sasl_username: session.sasl.as_ref().map(|sasl| sasl.username.clone()),
            messages: session.messages().iter().map(StoredMessage::from).collect(),
        }
    }
}

impl From<&Message> for StoredMessage {
    fn from(message: &Message) -> Self {
        StoredMessage {
            queue_id: message.queue_id.clone(),
            from: message.from.clone(),
            rcpt: message.rcpt.clone(),
            headers: message
                .headers
                .iter()
                .map(|header| (header.name.clone(), header.value.clone()))
                .collect(),
            body: String::from_utf8_lossy(&message.body()).into_owned(),
            finalized: message.is_finalized(),
        }
    }
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Writes session snapshots as one JSON file per session.
///
/// Snapshots arrive as unordered fire-and-forget tasks, so each write goes to
/// its own temp file before the rename; the session file is always one intact
/// snapshot, whichever write landed last.
pub struct FileSystemSink {
    base_path: Utf8PathBuf,
    write_seq: AtomicU64,
}

impl FileSystemSink {
    pub async fn new(base_path: impl Into<Utf8PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)
            .await
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to create session directory {base_path}"))?;
        Ok(FileSystemSink {
            base_path,
            write_seq: AtomicU64::new(0),
        })
    }

    fn session_path(&self, id: u64) -> Utf8PathBuf {
        self.base_path.join(format!("session-{id}.json"))
    }
}

#[async_trait]
impl SessionSink for FileSystemSink {
    async fn persist(&self, snapshot: Session) -> Result<()> {
        let stored = StoredSession::from(&snapshot);
        let payload = serde_json::to_vec_pretty(&stored).into_diagnostic()?;

        // Write-then-rename keeps readers from seeing a half-written file.
        // The temp name is unique per write; concurrent snapshots of the same
        // session must never share one.
        let path = self.session_path(snapshot.id);
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = self
            .base_path
            .join(format!("session-{}.{}.tmp", snapshot.id, seq));
        fs::write(&tmp, &payload)
            .await
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to write {tmp}"))?;
        fs::rename(&tmp, &path)
            .await
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to move snapshot into {path}"))?;

        debug!(session = snapshot.id, path = %path, "persisted session snapshot");
        Ok(())
    }
}
