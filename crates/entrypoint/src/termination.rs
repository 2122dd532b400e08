//! Termination message file: a JSON array of `{name, value}` records that
//! the platform hands back to the controller when the container ends.

use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::{EntrypointError, EntrypointResult};

pub const TERMINATION_MESSAGE_PATH: &str = "/tmp/termination-log";

/// Largest message the platform keeps.
pub const TERMINATION_MESSAGE_LIMIT: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub name: String,
    pub value: String,
}

/// Entries already in the message file. A missing, empty or unreadable
/// message counts as no entries.
pub async fn read_entries(path: &Path) -> EntrypointResult<Vec<ResultEntry>> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(EntrypointError::io(path)(err)),
    };
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }

    match serde_json::from_str(&raw) {
        Ok(entries) => Ok(entries),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Replacing unreadable termination message");
            Ok(Vec::new())
        }
    }
}

/// Add `value` under `name`, replacing an earlier entry of the same name.
///
/// The message never holds two entries for one name. An appended duplicate
/// would read the same, since the controller keeps the last value per name,
/// but it would spend the 4096 byte budget twice.
pub fn upsert(entries: &mut Vec<ResultEntry>, name: &str, value: String) {
    match entries.iter_mut().find(|entry| entry.name == name) {
        Some(entry) => entry.value = value,
        None => entries.push(ResultEntry {
            name: name.to_string(),
            value,
        }),
    }
}

pub fn encode(entries: &[ResultEntry]) -> EntrypointResult<String> {
    let message = serde_json::to_string(entries)?;
    if message.len() > TERMINATION_MESSAGE_LIMIT {
        return Err(EntrypointError::TerminationMessageTooLarge(message.len()));
    }
    Ok(message)
}

/// Replace the message file with `entries`.
pub async fn write_entries(path: &Path, entries: &[ResultEntry]) -> EntrypointResult<()> {
    let message = encode(entries)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(EntrypointError::io(parent))?;
    }
    let mut file = fs::File::create(path).await.map_err(EntrypointError::io(path))?;
    file.write_all(message.as_bytes())
        .await
        .map_err(EntrypointError::io(path))?;
    file.sync_all().await.map_err(EntrypointError::io(path))?;
    Ok(())
}
