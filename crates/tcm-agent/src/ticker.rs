//! Tick sources driving the control loop

use async_trait::async_trait;
use std::time::Duration;
use tcm_core::TickSource;
use tokio::sync::mpsc;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Fires every `period`, starting immediately
///
/// A pass that overruns the period delays the next tick instead of
/// triggering a burst of catch-up ticks.
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }
}

#[async_trait]
impl TickSource for IntervalTicker {
    async fn tick(&mut self) -> bool {
        self.interval.tick().await;
        true
    }
}

/// Tick source fired explicitly through a [`ManualTickerHandle`]
///
/// Exhausted once every handle is dropped.
pub struct ManualTicker {
    rx: mpsc::Receiver<()>,
}

/// Sender side of a [`ManualTicker`]
#[derive(Clone)]
pub struct ManualTickerHandle {
    tx: mpsc::Sender<()>,
}

impl ManualTicker {
    pub fn new() -> (Self, ManualTickerHandle) {
        let (tx, rx) = mpsc::channel(16);
        (Self { rx }, ManualTickerHandle { tx })
    }
}

impl ManualTickerHandle {
    /// Queue one tick; returns `false` if the ticker is gone
    pub async fn fire(&self) -> bool {
        self.tx.send(()).await.is_ok()
    }
}

#[async_trait]
impl TickSource for ManualTicker {
    async fn tick(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_interval_ticker() {
        let mut ticker = IntervalTicker::new(Duration::from_secs(60));
        let start = tokio::time::Instant::now();

        assert!(ticker.tick().await);
        assert!(ticker.tick().await);
        assert_eq!(start.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_manual_ticker() {
        let (mut ticker, handle) = ManualTicker::new();

        assert!(handle.fire().await);
        assert!(ticker.tick().await);

        drop(handle);
        assert!(!ticker.tick().await);
    }
}
