//! Monitored pipe reporting byte rates and transfer progress

use crate::pipeline::pipe::{AbortHandle, Pipe, PipeOutcome};
use crate::pipeline::{Sink, Source};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Moving byte-rate estimator over a sliding window
#[derive(Debug)]
pub struct RateMonitor {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    total: u64,
}

impl RateMonitor {
    /// Create a monitor with the given averaging window
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            total: 0,
        }
    }

    /// Record bytes moved now
    pub fn record(&mut self, bytes: u64) {
        self.total += bytes;
        self.samples.push_back((Instant::now(), bytes));
        self.evict();
    }

    /// Total bytes recorded since creation
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Bytes per second over the window
    pub fn rate(&mut self) -> u64 {
        self.evict();
        let in_window: u64 = self.samples.iter().map(|(_, b)| b).sum();
        let secs = self.window.as_secs_f64();
        if secs <= 0.0 {
            return 0;
        }
        (in_window as f64 / secs) as u64
    }

    fn evict(&mut self) {
        // Early in process lifetime the window may reach before the clock's
        // epoch; nothing can be stale then.
        let Some(cutoff) = Instant::now().checked_sub(self.window) else {
            return;
        };
        while let Some(&(t, _)) = self.samples.front() {
            if t >= cutoff {
                break;
            }
            self.samples.pop_front();
        }
    }
}

/// Snapshot handed to the progress callback
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    /// Bytes put into the buffer so far
    pub bytes_added: u64,
    /// Bytes taken out of the buffer so far
    pub bytes_drained: u64,
    /// Drain rate in bytes per second over the monitor window
    pub rate_bps: u64,
    /// Time since the channel started running
    pub elapsed: Duration,
}

/// A pipe instrumented with rate monitoring
///
/// Progress callbacks fire at most once per [`Channel::PROGRESS_INTERVAL`]
/// and only when bytes actually moved, so idle transfers stay silent.
pub struct Channel {
    pipe: Pipe,
}

impl Channel {
    /// Minimum spacing between two progress callbacks
    pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

    /// Window over which byte rates are averaged
    pub const RATE_WINDOW: Duration = Duration::from_secs(2);

    /// Create a channel with the given fairness bound
    pub fn new(max_num_loops: usize) -> Self {
        Self {
            pipe: Pipe::new(max_num_loops),
        }
    }

    /// See [`Pipe::wait_for_empty_buffer_on_eof`]
    pub fn wait_for_empty_buffer_on_eof(mut self, wait: bool) -> Self {
        self.pipe = self.pipe.wait_for_empty_buffer_on_eof(wait);
        self
    }

    /// Handle to abort the channel from another task
    pub fn abort_handle(&self) -> AbortHandle {
        self.pipe.abort_handle()
    }

    /// Run the channel, invoking `on_progress` as bytes move
    pub async fn run<S, K, F>(self, source: S, sink: K, mut on_progress: F) -> PipeOutcome
    where
        S: Source,
        K: Sink,
        F: FnMut(&Progress) + Send,
    {
        let started = Instant::now();
        let mut monitor = RateMonitor::new(Self::RATE_WINDOW);
        let mut added: u64 = 0;
        let mut drained: u64 = 0;
        let mut last_emit: Option<Instant> = None;

        self.pipe
            .run_observed(source, sink, |add, drain| {
                added += add;
                drained += drain;
                if drain > 0 {
                    monitor.record(drain);
                }
                let due = last_emit.is_none_or(|t| t.elapsed() >= Self::PROGRESS_INTERVAL);
                if due {
                    last_emit = Some(Instant::now());
                    on_progress(&Progress {
                        bytes_added: added,
                        bytes_drained: drained,
                        rate_bps: monitor.rate(),
                        elapsed: started.elapsed(),
                    });
                }
            })
            .await
    }
}
