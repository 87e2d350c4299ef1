//! Per-client sliding window rate limiting.
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

const MAX_TRACKED_CLIENTS: usize = 10_000;

#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    max_tracked_clients: usize,
    state: Mutex<WindowTable>,
}

#[derive(Debug)]
struct WindowTable {
    clients: HashMap<String, VecDeque<Instant>>,
    last_sweep: Instant,
}

impl WindowTable {
    fn sweep(&mut self, now: Instant, window: Duration) -> usize {
        let before = self.clients.len();
        self.clients.retain(|_, entry| {
            expire(entry, now, window);
            !entry.is_empty()
        });
        self.last_sweep = now;
        before - self.clients.len()
    }
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self::with_client_cap(max_requests, window, MAX_TRACKED_CLIENTS)
    }

    fn with_client_cap(max_requests: usize, window: Duration, max_tracked_clients: usize) -> Self {
        Self {
            max_requests,
            window,
            max_tracked_clients,
            state: Mutex::new(WindowTable {
                clients: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admits the request and records it, or rejects it without touching the window.
    pub async fn check(&self, client_id: &str) -> bool {
        let now = Instant::now();
        let mut table = self.state.lock().await;
        // an oversized table is swept at most once per window
        if table.clients.len() > self.max_tracked_clients
            && now.duration_since(table.last_sweep) >= self.window
        {
            table.sweep(now, self.window);
        }

        let entry = table.clients.entry(client_id.to_string()).or_default();
        expire(entry, now, self.window);
        if entry.len() >= self.max_requests {
            return false;
        }
        entry.push_back(now);
        true
    }

    /// Drops clients with no request inside the trailing window. Returns how many were removed.
    pub async fn evict_stale(&self) -> usize {
        let mut table = self.state.lock().await;
        let removed = table.sweep(Instant::now(), self.window);
        if removed > 0 {
            debug!(removed, remaining = table.clients.len(), "Evicted idle rate limit entries");
        }
        removed
    }

    pub async fn tracked_clients(&self) -> usize {
        self.state.lock().await.clients.len()
    }
}

fn expire(entry: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = entry.front() {
        if now.duration_since(*oldest) >= window {
            entry.pop_front();
        } else {
            break;
        }
    }
}
