// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Append-only JSONL audit log. One JSON object per line, flushed on every
//! write. Sensitive fields are redacted before they reach disk; console
//! diagnostics stay on `tracing`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use chrono::Utc;
use serde_json::Value;

const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

pub struct JsonlLogger {
    component: String,
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlLogger {
    pub fn new(component: impl Into<String>, path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        Ok(Self {
            component: component.into(),
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn debug(&self, event: &str, fields: Value) {
        self.write(LogLevel::Debug, event, fields);
    }

    pub fn info(&self, event: &str, fields: Value) {
        self.write(LogLevel::Info, event, fields);
    }

    pub fn warn(&self, event: &str, fields: Value) {
        self.write(LogLevel::Warn, event, fields);
    }

    pub fn error(&self, event: &str, fields: Value) {
        self.write(LogLevel::Error, event, fields);
    }

    pub fn message_sent(&self, message_type: &str, recipient: &str, conversation_id: &str) {
        self.info(
            "MESSAGE_SENT",
            serde_json::json!({
                "message_type": message_type,
                "recipient": recipient,
                "conversation_id": conversation_id,
            }),
        );
    }

    pub fn message_received(&self, message_type: &str, sender: &str, conversation_id: &str) {
        self.info(
            "MESSAGE_RECEIVED",
            serde_json::json!({
                "message_type": message_type,
                "sender": sender,
                "conversation_id": conversation_id,
            }),
        );
    }

    fn write(&self, level: LogLevel, event: &str, fields: Value) {
        let mut record = serde_json::Map::new();
        record.insert("ts".to_string(), Value::String(Utc::now().to_rfc3339()));
        record.insert(
            "level".to_string(),
            serde_json::to_value(level).expect("level serializes"),
        );
        record.insert("component".to_string(), Value::String(self.component.clone()));
        record.insert("event".to_string(), Value::String(event.to_string()));

        if let Value::Object(extra) = fields {
            for (key, value) in extra {
                let value = if is_sensitive(&key) {
                    Value::String(REDACTED.to_string())
                } else {
                    redact(value)
                };
                record.insert(key, value);
            }
        }

        let line = Value::Object(record).to_string();
        let mut file = self.file.lock().expect("log file poisoned");
        if let Err(error) = writeln!(file, "{line}").and_then(|_| file.flush()) {
            tracing::warn!(path = %self.path.display(), %error, "failed to append log record");
        }
    }
}

fn is_sensitive(field: &str) -> bool {
    let field = field.to_ascii_lowercase();
    matches!(field.as_str(), "auth_token" | "password" | "secret" | "api_key")
        || field.contains("token")
        || field.contains("secret")
}

/// Redacts sensitive keys in nested objects too; protocol payloads carry the
/// auth token at arbitrary depth.
fn redact(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    if is_sensitive(&key) {
                        (key, Value::String(REDACTED.to_string()))
                    } else {
                        (key, redact(value))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact).collect()),
        other => other,
    }
}
