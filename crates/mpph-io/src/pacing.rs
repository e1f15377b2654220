//! Minimum spacing between sends to the destination.

use std::time::Duration;

use tokio::time::Instant;

/// Leaky bucket of capacity one: a send may start no sooner than `spacing`
/// after the previous one finished.
///
/// Not adaptive: failures neither slow it down nor speed it up.
#[derive(Debug, Clone)]
pub struct Pacer {
    spacing: Duration,
    next_slot: Option<Instant>,
}

impl Pacer {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            next_slot: None,
        }
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    /// Wait until the next send is allowed
    pub async fn ready(&mut self) {
        if let Some(slot) = self.next_slot {
            tokio::time::sleep_until(slot).await;
        }
    }

    /// Record that a send just finished
    pub fn mark_sent(&mut self) {
        if !self.spacing.is_zero() {
            self.next_slot = Some(Instant::now() + self.spacing);
        }
    }

    /// Rough lower bound for pushing `records` through this pacer
    pub fn estimate(&self, records: usize) -> Duration {
        self.spacing.saturating_mul(u32::try_from(records).unwrap_or(u32::MAX))
    }
}
