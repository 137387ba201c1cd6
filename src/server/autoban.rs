//! Failed-login tracking and temporary address bans
//!
//! Counts failed logins per peer address over a sliding window; reaching
//! the threshold bans the address for the configured duration. The check
//! runs before any TLS handshake so banned peers cost nothing but an
//! accept. State is in-memory only: it resets on configuration reload and
//! on restart.

use crate::config::AutobanConfig;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Default)]
struct PeerState {
    failures: VecDeque<Instant>,
    banned_until: Option<Instant>,
}

/// Per-address failed-login counter with temporary bans
#[derive(Debug)]
pub struct AutoBanner {
    config: AutobanConfig,
    peers: Mutex<HashMap<IpAddr, PeerState>>,
}

impl AutoBanner {
    /// Create with the given thresholds
    pub fn new(config: AutobanConfig) -> Self {
        Self {
            config,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failed login; returns true when this failure triggered a
    /// ban
    pub fn register_failure(&self, peer: IpAddr) -> bool {
        if self.config.max_login_failures == 0 {
            return false; // feature disabled
        }
        let now = Instant::now();
        let mut peers = self.lock();
        let state = peers.entry(peer).or_default();

        state.failures.push_back(now);
        if let Some(cutoff) = now.checked_sub(self.config.login_failures_time_window) {
            while state.failures.front().is_some_and(|&t| t < cutoff) {
                state.failures.pop_front();
            }
        }

        if state.failures.len() >= self.config.max_login_failures as usize {
            state.banned_until = Some(now + self.config.ban_duration);
            state.failures.clear();
            warn!(%peer, "address banned after repeated login failures");
            return true;
        }
        false
    }

    /// Whether the address is currently banned
    pub fn is_banned(&self, peer: IpAddr) -> bool {
        let now = Instant::now();
        let mut peers = self.lock();
        match peers.get_mut(&peer) {
            Some(state) => match state.banned_until {
                Some(until) if until > now => true,
                Some(_) => {
                    state.banned_until = None;
                    false
                }
                None => false,
            },
            None => false,
        }
    }

    /// Forget everything (configuration reload)
    pub fn reset(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<IpAddr, PeerState>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
