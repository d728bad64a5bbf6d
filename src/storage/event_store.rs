//! Reading append-only event logs.
//!
//! Logs are the single source of truth. Two readers exist: [`read_events`]
//! is strict and refuses damaged logs, which is what the write path and
//! replay need; [`scan_log`] is tolerant and reports every problem it finds,
//! which is what the integrity checker needs.

use super::{Result, StorageError};
use crate::core::events::Event;
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

const TAIL_CHUNK: u64 = 8 * 1024;

/// A line that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedLine {
    /// 1-based line number.
    pub line: usize,
    pub reason: String,
}

/// A final segment without its newline terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncatedTail {
    /// 1-based line number of the segment.
    pub line: usize,
    /// Byte length of the log up to and including the last newline.
    pub valid_len: usize,
    /// Length of the dangling segment.
    pub bytes: usize,
}

/// Everything a tolerant scan found in one log.
#[derive(Debug, Clone, Default)]
pub struct LogScan {
    /// Events decoded from complete lines, in log order, paired with their
    /// 1-based line numbers.
    pub events: Vec<(usize, Event)>,
    pub malformed: Vec<MalformedLine>,
    pub truncated: Option<TruncatedTail>,
}

impl LogScan {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.malformed.is_empty() && self.truncated.is_none()
    }

    /// Decoded events in log order.
    pub fn iter_events(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().map(|(_, e)| e)
    }
}

fn read_bytes(path: &Path) -> Result<Option<Vec<u8>>> {
    super::durable::read_optional(path)
}

/// Scans a log, collecting events and problems without failing on them.
///
/// A missing file scans as empty. Blank lines are skipped.
///
/// # Errors
/// Returns an error only if the file exists but cannot be read.
pub fn scan_log(path: &Path) -> Result<LogScan> {
    let Some(bytes) = read_bytes(path)? else {
        return Ok(LogScan::default());
    };
    let mut scan = LogScan::default();
    let mut offset = 0usize;
    let mut line_no = 0usize;

    while offset < bytes.len() {
        line_no += 1;
        let rest = &bytes[offset..];
        let Some(newline) = rest.iter().position(|b| *b == b'\n') else {
            scan.truncated = Some(TruncatedTail {
                line: line_no,
                valid_len: offset,
                bytes: rest.len(),
            });
            break;
        };
        let raw = &rest[..newline];
        offset += newline + 1;

        let Ok(text) = std::str::from_utf8(raw) else {
            scan.malformed.push(MalformedLine {
                line: line_no,
                reason: "line is not valid UTF-8".to_string(),
            });
            continue;
        };
        if text.trim().is_empty() {
            continue;
        }
        match Event::from_line(text) {
            Ok(event) => scan.events.push((line_no, event)),
            Err(e) => scan.malformed.push(MalformedLine {
                line: line_no,
                reason: e.to_string(),
            }),
        }
    }
    Ok(scan)
}

/// Reads every event of a log, refusing damaged logs.
///
/// # Errors
/// - [`StorageError::IncompleteTail`] if the last record lacks its newline.
/// - [`StorageError::Corrupt`] for the first line that does not decode.
pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    let scan = scan_log(path)?;
    if let Some(bad) = scan.malformed.first() {
        return Err(StorageError::Corrupt {
            path: path.to_path_buf(),
            line: bad.line,
            reason: bad.reason.clone(),
        });
    }
    if scan.truncated.is_some() {
        return Err(StorageError::IncompleteTail {
            path: path.to_path_buf(),
        });
    }
    Ok(scan.events.into_iter().map(|(_, e)| e).collect())
}

/// Reads only the final record of a log by scanning backwards from the end.
///
/// Returns `None` for a missing or empty log.
///
/// # Errors
/// Same as [`read_events`], limited to the final record.
pub fn last_event(path: &Path) -> Result<Option<Event>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::io("open", path, e)),
    };
    let io = |e| StorageError::io("read_tail", path, e);
    let len = file.metadata().map_err(io)?.len();
    if len == 0 {
        return Ok(None);
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1)).map_err(io)?;
    file.read_exact(&mut last).map_err(io)?;
    if last[0] != b'\n' {
        return Err(StorageError::IncompleteTail {
            path: path.to_path_buf(),
        });
    }

    // Collect bytes [pos, len - 1) until they contain the previous newline.
    let end = len - 1;
    let mut pos = end;
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let chunk = TAIL_CHUNK.min(pos);
        pos -= chunk;
        let mut head = vec![0u8; usize::try_from(chunk).unwrap_or(usize::MAX)];
        file.seek(SeekFrom::Start(pos)).map_err(io)?;
        file.read_exact(&mut head).map_err(io)?;
        head.extend_from_slice(&buf);
        buf = head;
        if pos == 0 || buf.contains(&b'\n') {
            break;
        }
    }

    let start = buf.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    let line = &buf[start..];
    let text = std::str::from_utf8(line).ok().map(str::trim);
    match text {
        // Blank trailing lines are legal; fall back to a full read.
        Some("") => Ok(read_events(path)?.pop()),
        Some(text) => Event::from_line(text).map(Some).map_err(|e| StorageError::Corrupt {
            path: path.to_path_buf(),
            line: 0,
            reason: e.to_string(),
        }),
        None => Err(StorageError::Corrupt {
            path: path.to_path_buf(),
            line: 0,
            reason: "final line is not valid UTF-8".to_string(),
        }),
    }
}

/// Filter for querying events.
#[derive(Debug, Default, Clone)]
pub struct EventFilter {
    /// Filter by entity id.
    pub entity_id: Option<String>,
    /// Filter by event type; a trailing `*` matches a prefix.
    pub kind: Option<String>,
    /// Filter by actor.
    pub actor: Option<String>,
    /// Only events at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Only events strictly before this instant.
    pub until: Option<DateTime<Utc>>,
    /// Maximum number of events to return.
    pub limit: Option<usize>,
}

impl EventFilter {
    /// Creates an empty filter (matches all events).
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter by entity id.
    #[must_use]
    pub fn for_entity(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn for_kind(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Checks if an event matches this filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(entity_id) = &self.entity_id {
            if &event.entity_id != entity_id {
                return false;
            }
        }
        if let Some(kind) = &self.kind {
            let hit = match kind.strip_suffix('*') {
                Some(prefix) => event.kind.starts_with(prefix),
                None => &event.kind == kind,
            };
            if !hit {
                return false;
            }
        }
        if let Some(actor) = &self.actor {
            if &event.actor != actor {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.timestamp >= until {
                return false;
            }
        }
        true
    }

    /// Applies the filter and limit to events already in memory.
    #[must_use]
    pub fn apply(&self, events: Vec<Event>) -> Vec<Event> {
        let mut result: Vec<Event> = events.into_iter().filter(|e| self.matches(e)).collect();
        if let Some(limit) = self.limit {
            result.truncate(limit);
        }
        result
    }
}

/// Reads events matching the filter from one log.
///
/// # Errors
/// Same as [`read_events`].
pub fn read_filtered(path: &Path, filter: &EventFilter) -> Result<Vec<Event>> {
    Ok(filter.apply(read_events(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::durable::append_line;
    use serde_json::json;
    use std::fs;

    fn write_events(path: &Path, events: &[Event]) {
        for e in events {
            append_line(path, &e.to_line().unwrap()).unwrap();
        }
    }

    #[test]
    fn written_log_reads_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t1.jsonl");
        let events = vec![
            Event::new("t1", "task.created", "a", json!({"title": "x"})),
            Event::new("t1", "task.commented", "b", json!({"body": "y"})),
        ];
        write_events(&path, &events);

        assert_eq!(read_events(&path).unwrap(), events);
        assert_eq!(last_event(&path).unwrap(), Some(events[1].clone()));
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.jsonl");
        assert!(read_events(&path).unwrap().is_empty());
        assert!(last_event(&path).unwrap().is_none());
    }

    #[test]
    fn scan_reports_truncated_tail_and_keeps_prior_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t1.jsonl");
        let events = vec![Event::new("t1", "task.created", "a", json!({"title": "x"}))];
        write_events(&path, &events);
        let valid_len = fs::metadata(&path).unwrap().len() as usize;
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut f| std::io::Write::write_all(&mut f, b"{\"id\":\"evt-"))
            .unwrap();

        let scan = scan_log(&path).unwrap();
        assert_eq!(scan.events.len(), 1);
        assert!(scan.malformed.is_empty());
        assert_eq!(
            scan.truncated,
            Some(TruncatedTail {
                line: 2,
                valid_len,
                bytes: 11
            })
        );
        assert!(matches!(read_events(&path), Err(StorageError::IncompleteTail { .. })));
        assert!(matches!(last_event(&path), Err(StorageError::IncompleteTail { .. })));
    }

    #[test]
    fn scan_reports_malformed_middle_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t1.jsonl");
        let first = Event::new("t1", "task.created", "a", json!({"title": "x"}));
        let last = Event::new("t1", "task.commented", "a", json!({"body": "z"}));
        fs::write(
            &path,
            format!("{}\nnot json\n\n{}\n", first.to_line().unwrap(), last.to_line().unwrap()),
        )
        .unwrap();

        let scan = scan_log(&path).unwrap();
        assert_eq!(scan.events.len(), 2);
        assert_eq!(scan.events[1].0, 4);
        assert_eq!(scan.malformed.len(), 1);
        assert_eq!(scan.malformed[0].line, 2);
        assert!(matches!(
            read_events(&path),
            Err(StorageError::Corrupt { line: 2, .. })
        ));
        // The tail reader only looks at the final record.
        assert_eq!(last_event(&path).unwrap(), Some(last));
    }

    #[test]
    fn tail_read_spans_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t1.jsonl");
        let big = "x".repeat(20_000);
        let events = vec![
            Event::new("t1", "task.created", "a", json!({"title": "x"})),
            Event::new("t1", "task.commented", "a", json!({"body": big})),
        ];
        write_events(&path, &events);
        assert_eq!(last_event(&path).unwrap(), Some(events[1].clone()));
    }

    #[test]
    fn filter_by_kind_prefix_actor_and_limit() {
        let events = vec![
            Event::new("t1", "task.created", "alice", json!({})),
            Event::new("t1", "task.commented", "bob", json!({})),
            Event::new("t2", "task.commented", "alice", json!({})),
            Event::new("r1", "resource.created", "alice", json!({})),
        ];

        let tasks = EventFilter::for_kind("task.*").apply(events.clone());
        assert_eq!(tasks.len(), 3);

        let alice = EventFilter {
            actor: Some("alice".to_string()),
            ..EventFilter::all()
        }
        .with_limit(2)
        .apply(events.clone());
        assert_eq!(alice.len(), 2);
        assert_eq!(alice[1].entity_id, "t2");

        let t1 = EventFilter::for_entity("t1").apply(events);
        assert_eq!(t1.len(), 2);
    }
}
