//! Shared per-run request window
//!
//! One `RateWindow` is owned by each pipeline run and shared by every
//! concurrent chunk task of that run. Mutation happens only under the
//! lock, and the lock is held only for the counter update; the cooldown
//! sleep happens outside it so unrelated tasks keep counting.

use crate::config::PipelineConfig;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct WindowState {
    started: Instant,
    requests: u32,
}

/// Mutex-guarded per-window request counter with rate-limit cooldown
#[derive(Debug)]
pub struct RateWindow {
    state: Mutex<WindowState>,
    window: Duration,
    cooldown: Duration,
}

impl RateWindow {
    pub fn new(window: Duration, cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(WindowState {
                started: Instant::now(),
                requests: 0,
            }),
            window,
            cooldown,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            Duration::from_secs(config.rate_window_secs),
            Duration::from_secs(config.cooldown_secs),
        )
    }

    /// Count one outbound request, starting a fresh window first if the
    /// current one has elapsed. Returns the count within the window.
    pub async fn record_request(&self) -> u32 {
        let mut state = self.state.lock().await;
        if state.started.elapsed() >= self.window {
            state.started = Instant::now();
            state.requests = 0;
        }
        state.requests += 1;
        state.requests
    }

    /// Requests counted in the current window
    pub async fn requests_in_window(&self) -> u32 {
        let state = self.state.lock().await;
        if state.started.elapsed() >= self.window {
            0
        } else {
            state.requests
        }
    }

    /// Sleep out the provider-side window, then reset the counter.
    /// Several tasks may cool down at once; each sleeps independently
    /// and the reset is idempotent.
    pub async fn cooldown_and_reset(&self) {
        tracing::warn!(
            cooldown_secs = self.cooldown.as_secs(),
            "rate limit detected, cooling down"
        );
        // The sleep must not hold the lock
        tokio::time::sleep(self.cooldown).await;

        let mut state = self.state.lock().await;
        state.started = Instant::now();
        state.requests = 0;
    }
}
