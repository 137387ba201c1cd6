//! Operator-visible log splitter
//!
//! `tracing` carries diagnostics; this splitter carries the session log an
//! operator reads: one line per event, fanned out to stderr, an optional
//! file, and any subscribed administration sessions. It is the one
//! process-wide singleton in the crate, because log lines originate from
//! arbitrary tasks including teardown paths.

use crate::admin::types::{LogLine, LogSeverity, Timestamp};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// Receives every log line the splitter fans out
pub trait LogSink: Send + Sync {
    /// Deliver one line; must not block
    fn write_line(&self, line: &LogLine);
}

/// Fan-out point for operator-visible log lines
///
/// The mutex is held only long enough to snapshot the subscriber list;
/// sinks run outside it.
pub struct LogSplitter {
    subscribers: Mutex<Vec<(u64, Arc<dyn LogSink>)>>,
    next_id: AtomicU64,
}

static SPLITTER: OnceLock<LogSplitter> = OnceLock::new();

impl LogSplitter {
    fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The process-wide splitter
    pub fn global() -> &'static LogSplitter {
        SPLITTER.get_or_init(LogSplitter::new)
    }

    /// Register a sink; returns a token for [`unsubscribe`](Self::unsubscribe)
    pub fn subscribe(&self, sink: Arc<dyn LogSink>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock().push((id, sink));
        id
    }

    /// Remove a previously registered sink
    pub fn unsubscribe(&self, token: u64) {
        self.lock().retain(|(id, _)| *id != token);
    }

    /// Fan one line out to every subscriber
    pub fn log(&self, severity: LogSeverity, session_id: Option<u64>, message: impl Into<String>) {
        let line = LogLine {
            time: Timestamp::now(),
            severity,
            session_id,
            message: message.into(),
        };
        let snapshot: Vec<Arc<dyn LogSink>> =
            self.lock().iter().map(|(_, s)| Arc::clone(s)).collect();
        for sink in snapshot {
            sink.write_line(&line);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Arc<dyn LogSink>)>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-session logger carrying the session id prefix
#[derive(Debug, Clone, Copy)]
pub struct SessionLogger {
    session_id: Option<u64>,
}

impl SessionLogger {
    /// Logger for one session
    pub fn for_session(session_id: u64) -> Self {
        Self {
            session_id: Some(session_id),
        }
    }

    /// Logger for server-level events
    pub fn server() -> Self {
        Self { session_id: None }
    }

    /// Log an error line
    pub fn error(&self, message: impl Into<String>) {
        self.emit(LogSeverity::Error, message.into());
    }

    /// Log a warning line
    pub fn warning(&self, message: impl Into<String>) {
        self.emit(LogSeverity::Warning, message.into());
    }

    /// Log a routine status line
    pub fn status(&self, message: impl Into<String>) {
        self.emit(LogSeverity::Status, message.into());
    }

    /// Log a protocol trace line
    pub fn trace(&self, message: impl Into<String>) {
        self.emit(LogSeverity::Trace, message.into());
    }

    fn emit(&self, severity: LogSeverity, message: String) {
        match severity {
            LogSeverity::Error => tracing::error!(session = ?self.session_id, "{message}"),
            LogSeverity::Warning => tracing::warn!(session = ?self.session_id, "{message}"),
            LogSeverity::Status => tracing::info!(session = ?self.session_id, "{message}"),
            LogSeverity::Trace => tracing::trace!(session = ?self.session_id, "{message}"),
        }
        LogSplitter::global().log(severity, self.session_id, message);
    }
}

/// Sink writing formatted lines to stderr
pub struct StderrSink;

impl LogSink for StderrSink {
    fn write_line(&self, line: &LogLine) {
        let severity = match line.severity {
            LogSeverity::Error => "error",
            LogSeverity::Warning => "warning",
            LogSeverity::Status => "status",
            LogSeverity::Trace => "trace",
        };
        let mut stderr = std::io::stderr().lock();
        let _ = match line.session_id {
            Some(id) => writeln!(stderr, "[{severity}] [session {id}] {}", line.message),
            None => writeln!(stderr, "[{severity}] {}", line.message),
        };
    }
}
