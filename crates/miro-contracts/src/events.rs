use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};

pub type EventPayload = Map<String, Value>;

/// Session log appended to `events.jsonl`, one compact object per line.
///
/// Every record starts with `type`, `session_id` and `ts`; payload keys are
/// merged afterwards and win on conflict. Clones share the file, the write
/// lock and the dropped-record counter, so a turn worker and the
/// interactive thread can log side by side.
#[derive(Debug, Clone)]
pub struct EventWriter {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    path: PathBuf,
    session_id: String,
    append: Mutex<()>,
    dropped: AtomicU64,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                path: path.into(),
                session_id: session_id.into(),
                append: Mutex::new(()),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    /// Records that [`EventWriter::try_emit`] could not write.
    pub fn dropped_events(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Appends one record and returns it as written.
    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let record = self.record(event_type, payload);
        let line = serde_json::to_string(&record)?;
        self.append_line(&line)
            .with_context(|| format!("failed to append {event_type} to {}", self.path().display()))?;
        Ok(Value::Object(record))
    }

    /// Pipeline flavour of [`EventWriter::emit`]: a failed append is reported
    /// on stderr and counted, never propagated.
    pub fn try_emit(&self, event_type: &str, payload: EventPayload) -> bool {
        match self.emit(event_type, payload) {
            Ok(_) => true,
            Err(err) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                eprintln!("miro events: {err:#}");
                false
            }
        }
    }

    /// `warning` record with the component that raised it.
    pub fn warn(&self, source: &str, message: &str) -> bool {
        self.try_emit("warning", object(json!({"source": source, "message": message})))
    }

    fn record(&self, event_type: &str, payload: EventPayload) -> EventPayload {
        let mut record = object(json!({
            "type": event_type,
            "session_id": self.shared.session_id,
            "ts": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false),
        }));
        record.extend(payload);
        record
    }

    fn append_line(&self, line: &str) -> anyhow::Result<()> {
        if let Some(parent) = self.shared.path.parent() {
            fs::create_dir_all(parent)?;
        }
        // A panic elsewhere while holding the lock leaves the file intact.
        let _guard = self
            .shared
            .append
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.shared.path)?;
        file.write_all(format!("{line}\n").as_bytes())?;
        Ok(())
    }
}

fn object(value: Value) -> EventPayload {
    match value {
        Value::Object(map) => map,
        _ => EventPayload::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use super::*;

    #[test]
    fn emit_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "session-123");

        let mut payload = EventPayload::new();
        payload.insert("out_dir".to_string(), Value::String("/tmp/run".to_string()));
        let emitted = writer.emit("session_started", payload)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], Value::String("session_started".to_string()));
        assert_eq!(
            parsed["session_id"],
            Value::String("session-123".to_string())
        );
        assert_eq!(parsed["out_dir"], Value::String("/tmp/run".to_string()));

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn warn_records_source_and_message() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("events.jsonl");
        let writer = EventWriter::new(&path, "session-123");

        writer.warn("extractor", "no choices in edit response");

        let content = fs::read_to_string(&path)?;
        let parsed: Value = serde_json::from_str(content.trim())?;
        assert_eq!(parsed["type"], Value::String("warning".to_string()));
        assert_eq!(parsed["source"], Value::String("extractor".to_string()));
        assert_eq!(
            parsed["message"],
            Value::String("no choices in edit response".to_string())
        );
        Ok(())
    }

    #[test]
    fn clones_append_to_the_same_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "session-123");
        let worker = writer.clone();

        let handle = std::thread::spawn(move || worker.emit("two", EventPayload::new()));
        writer.emit("one", EventPayload::new())?;
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("worker panicked"))??;

        let content = fs::read_to_string(&path)?;
        let mut types: Vec<String> = content
            .lines()
            .map(|line| serde_json::from_str::<Value>(line))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter_map(|row| row["type"].as_str().map(str::to_string))
            .collect();
        types.sort();
        assert_eq!(types, vec!["one".to_string(), "two".to_string()]);
        Ok(())
    }

    #[test]
    fn try_emit_counts_unwritable_records() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let blocker = temp.path().join("not-a-dir");
        fs::write(&blocker, b"file")?;
        let writer = EventWriter::new(blocker.join("events.jsonl"), "session-123");

        assert!(writer.emit("turn_started", EventPayload::new()).is_err());
        assert!(!writer.try_emit("turn_started", EventPayload::new()));
        assert!(!writer.warn("render", "no preview produced"));
        assert_eq!(writer.dropped_events(), 2);
        assert_eq!(writer.clone().dropped_events(), 2);
        Ok(())
    }

    #[test]
    fn payload_overrides_default_fields() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "session-123");

        let mut payload = EventPayload::new();
        payload.insert("session_id".to_string(), Value::from("other"));
        let emitted = writer.emit("turn_started", payload)?;

        assert_eq!(emitted["session_id"], Value::from("other"));
        assert_eq!(writer.dropped_events(), 0);
        Ok(())
    }
}
