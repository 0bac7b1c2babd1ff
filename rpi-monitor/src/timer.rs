//! Cancel-then-reschedule periodic timer
//!
//! A `RearmableTimer` owns at most one ticker task. `rearm` aborts the live
//! ticker before spawning the next one, so any number of consecutive rearms
//! leaves exactly one pending fire. Ticks are delivered over a small bounded
//! channel; a consumer that falls behind loses ticks instead of queueing them.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

const TICK_BUFFER: usize = 4;

pub struct RearmableTimer {
    name: &'static str,
    ticks: mpsc::Sender<()>,
    ticker: Option<JoinHandle<()>>,
    period: Option<Duration>,
}

impl RearmableTimer {
    pub fn new(name: &'static str) -> (Self, mpsc::Receiver<()>) {
        let (ticks, receiver) = mpsc::channel(TICK_BUFFER);
        let timer = Self {
            name,
            ticks,
            ticker: None,
            period: None,
        };
        (timer, receiver)
    }

    /// Schedule a fire every `period`, the first one `period` from now
    pub fn rearm(&mut self, period: Duration) {
        self.cancel();

        let first = Instant::now() + period;
        let ticks = self.ticks.clone();
        let name = self.name;

        self.ticker = Some(tokio::spawn(async move {
            let mut interval = interval_at(first, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match ticks.try_send(()) {
                    Ok(()) => trace!("{} timer fired", name),
                    Err(TrySendError::Full(())) => debug!("{} timer fired while busy, tick dropped", name),
                    Err(TrySendError::Closed(())) => break,
                }
            }
        }));
        self.period = Some(period);
        debug!("{} timer armed, every {:?}", self.name, period);
    }

    pub fn cancel(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
            debug!("{} timer stopped", self.name);
        }
        self.period = None;
    }

    pub fn is_armed(&self) -> bool {
        self.ticker.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn period(&self) -> Option<Duration> {
        self.period
    }
}

impl Drop for RearmableTimer {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}
