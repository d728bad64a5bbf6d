//! Post-commit notifications.
//!
//! Both channels fire strictly after the commit's locks are released and
//! never fail the write that triggered them. In-process listeners run
//! synchronously on the committing thread with panics caught; external hook
//! commands run on a detached thread and are killed after a timeout.

use crate::core::events::Event;
use crate::storage::layout::EntityKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const HOOK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What one commit changed.
#[derive(Debug, Clone)]
pub struct CommitNotice {
    pub kind: EntityKind,
    pub entity_id: String,
    /// Events appended by the commit, in log order.
    pub events: Vec<Event>,
    /// The snapshot written by the commit.
    pub snapshot: Value,
}

/// Receives every commit made through a store handle.
pub trait CommitListener: Send + Sync {
    fn on_commit(&self, notice: &CommitNotice);
}

impl<F> CommitListener for F
where
    F: Fn(&CommitNotice) + Send + Sync,
{
    fn on_commit(&self, notice: &CommitNotice) {
        self(notice);
    }
}

/// Synchronous fan-out to subscribed listeners.
#[derive(Clone, Default)]
pub struct ListenerBus {
    listeners: Arc<RwLock<Vec<Arc<dyn CommitListener>>>>,
}

impl std::fmt::Debug for ListenerBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerBus")
            .field("listeners", &self.len())
            .finish()
    }
}

impl ListenerBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn CommitListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `notice` to every listener. A panicking listener is logged
    /// and skipped.
    pub fn publish(&self, notice: &CommitNotice) {
        let listeners: Vec<Arc<dyn CommitListener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            let delivered = catch_unwind(AssertUnwindSafe(|| listener.on_commit(notice)));
            if delivered.is_err() {
                warn!(entity_id = %notice.entity_id, "commit listener panicked");
            }
        }
    }
}

/// An external command run for matching events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookConfig {
    /// `"*"`, an exact type, or a prefix ending in `*` such as `"task.*"`.
    pub event: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl HookConfig {
    #[must_use]
    pub fn matches(&self, kind: &str) -> bool {
        match self.event.strip_suffix('*') {
            Some(prefix) => kind.starts_with(prefix),
            None => self.event == kind,
        }
    }
}

/// How a hook run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    Exited(ExitStatus),
    TimedOut,
}

/// Runs configured hook commands.
#[derive(Debug, Clone)]
pub struct HookDispatcher {
    hooks: Arc<Vec<HookConfig>>,
    root: PathBuf,
    timeout: Duration,
}

impl HookDispatcher {
    #[must_use]
    pub fn new(hooks: Vec<HookConfig>, root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            hooks: Arc::new(hooks),
            root: root.into(),
            timeout,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Starts every matching hook for every event on a detached thread.
    pub fn dispatch(&self, notice: &CommitNotice) {
        if self.hooks.is_empty() {
            return;
        }
        let jobs: Vec<(HookConfig, Event)> = notice
            .events
            .iter()
            .flat_map(|event| {
                self.hooks
                    .iter()
                    .filter(|hook| hook.matches(&event.kind))
                    .map(move |hook| (hook.clone(), event.clone()))
            })
            .collect();
        if jobs.is_empty() {
            return;
        }
        let dispatcher = self.clone();
        std::thread::spawn(move || {
            for (hook, event) in jobs {
                match dispatcher.run(&hook, &event) {
                    Ok(HookOutcome::Exited(status)) if status.success() => {
                        debug!(command = %hook.command, event_id = %event.id, "hook finished");
                    }
                    Ok(HookOutcome::Exited(status)) => {
                        warn!(command = %hook.command, event_id = %event.id, %status, "hook failed");
                    }
                    Ok(HookOutcome::TimedOut) => {
                        warn!(
                            command = %hook.command,
                            event_id = %event.id,
                            timeout_ms = dispatcher.timeout.as_millis(),
                            "hook timed out and was killed"
                        );
                    }
                    Err(e) => {
                        warn!(command = %hook.command, event_id = %event.id, error = %e, "hook could not start");
                    }
                }
            }
        });
    }

    /// Runs one hook for one event on the calling thread.
    ///
    /// The event line is written to the child's stdin; identifying fields go
    /// into `TASKLOG_*` environment variables.
    ///
    /// # Errors
    /// Returns the I/O error if the command cannot be spawned or waited on.
    pub fn run(&self, hook: &HookConfig, event: &Event) -> std::io::Result<HookOutcome> {
        let line = event
            .to_line()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

        let mut child = Command::new(&hook.command)
            .args(&hook.args)
            .current_dir(&self.root)
            .env("TASKLOG_ENTITY_ID", &event.entity_id)
            .env("TASKLOG_EVENT_ID", event.id.as_str())
            .env("TASKLOG_EVENT_TYPE", &event.kind)
            .env("TASKLOG_ACTOR", &event.actor)
            .env("TASKLOG_ROOT", &self.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            std::thread::spawn(move || {
                // A hook that ignores stdin closes the pipe early.
                let _ = stdin.write_all(line.as_bytes());
                let _ = stdin.write_all(b"\n");
            });
        }

        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(HookOutcome::Exited(status));
            }
            if started.elapsed() >= self.timeout {
                let _ = child.kill();
                child.wait()?;
                return Ok(HookOutcome::TimedOut);
            }
            std::thread::sleep(HOOK_POLL_INTERVAL);
        }
    }
}

/// Both notification channels of one store handle.
#[derive(Debug, Clone)]
pub struct Notifier {
    bus: ListenerBus,
    hooks: HookDispatcher,
}

impl Notifier {
    #[must_use]
    pub fn new(bus: ListenerBus, hooks: HookDispatcher) -> Self {
        Self { bus, hooks }
    }

    #[must_use]
    pub fn bus(&self) -> &ListenerBus {
        &self.bus
    }

    pub fn publish(&self, notice: &CommitNotice) {
        self.bus.publish(notice);
        self.hooks.dispatch(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn notice() -> CommitNotice {
        CommitNotice {
            kind: EntityKind::Task,
            entity_id: "t1".to_string(),
            events: vec![Event::new("t1", "task.created", "alice", json!({"title": "x"}))],
            snapshot: json!({"id": "t1"}),
        }
    }

    #[test]
    fn hook_patterns() {
        let hook = |event: &str| HookConfig {
            event: event.to_string(),
            command: "true".to_string(),
            args: Vec::new(),
        };
        assert!(hook("*").matches("resource.acquired"));
        assert!(hook("task.*").matches("task.created"));
        assert!(!hook("task.*").matches("resource.created"));
        assert!(hook("task.created").matches("task.created"));
        assert!(!hook("task.created").matches("task.created.v2"));
    }

    #[test]
    fn panicking_listener_does_not_stop_delivery() {
        let bus = ListenerBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        bus.subscribe(Arc::new(|_: &CommitNotice| panic!("listener bug")));
        let counter = Arc::clone(&seen);
        bus.subscribe(Arc::new(move |n: &CommitNotice| {
            counter.fetch_add(n.events.len(), Ordering::SeqCst);
        }));

        bus.publish(&notice());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn hook_receives_env_and_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let hook = HookConfig {
            event: "task.*".to_string(),
            command: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                format!(
                    "printf '%s %s\\n' \"$TASKLOG_EVENT_TYPE\" \"$TASKLOG_ACTOR\" > {0}; cat >> {0}",
                    out.display()
                ),
            ],
        };
        let dispatcher = HookDispatcher::new(vec![hook.clone()], dir.path(), Duration::from_secs(10));
        let event = notice().events.remove(0);

        let outcome = dispatcher.run(&hook, &event).unwrap();
        assert!(matches!(outcome, HookOutcome::Exited(s) if s.success()));
        let written = std::fs::read_to_string(&out).unwrap();
        let mut lines = written.lines();
        assert_eq!(lines.next(), Some("task.created alice"));
        assert_eq!(lines.next(), Some(event.to_line().unwrap().as_str()));
    }

    #[cfg(unix)]
    #[test]
    fn slow_hook_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let hook = HookConfig {
            event: "*".to_string(),
            command: "sleep".to_string(),
            args: vec!["5".to_string()],
        };
        let dispatcher = HookDispatcher::new(vec![hook.clone()], dir.path(), Duration::from_millis(50));
        let started = Instant::now();
        let outcome = dispatcher.run(&hook, &notice().events[0]).unwrap();
        assert_eq!(outcome, HookOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
