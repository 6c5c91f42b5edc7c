//! Debounced reachability tracking.
//!
//! Raw reachability signals are collapsed so that one event is emitted per
//! genuine transition: a new state must hold for the debounce window before
//! it is reported, and flapping back to the reported state inside the
//! window cancels the transition.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::clock::Clock;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    BecameOnline,
    BecameOffline,
}

impl ConnectivityEvent {
    fn for_state(online: bool) -> Self {
        if online {
            ConnectivityEvent::BecameOnline
        } else {
            ConnectivityEvent::BecameOffline
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    debounce: chrono::Duration,
    online: bool,
    candidate: Option<(bool, DateTime<Utc>)>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        Self::with_debounce(initially_online, DEFAULT_DEBOUNCE)
    }

    pub fn with_debounce(initially_online: bool, debounce: Duration) -> Self {
        Self {
            debounce: chrono::Duration::from_std(debounce).unwrap_or(chrono::Duration::zero()),
            online: initially_online,
            candidate: None,
        }
    }

    /// Last reported state.
    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Feeds a raw reachability signal observed at `at`.
    ///
    /// Returns an event only if an earlier transition had already settled
    /// by `at`.
    pub fn observe(&mut self, reachable: bool, at: DateTime<Utc>) -> Option<ConnectivityEvent> {
        let settled = self.poll(at);

        if reachable == self.online {
            if self.candidate.take().is_some() {
                tracing::debug!(online = self.online, "connectivity flap ignored");
            }
        } else if self.candidate.map(|(state, _)| state) != Some(reachable) {
            self.candidate = Some((reachable, at));
        }

        settled
    }

    /// Reports the pending transition if it has held for the debounce window.
    pub fn poll(&mut self, at: DateTime<Utc>) -> Option<ConnectivityEvent> {
        let (state, since) = self.candidate?;
        if at - since < self.debounce {
            return None;
        }
        self.candidate = None;
        self.online = state;
        tracing::info!(online = state, "connectivity changed");
        Some(ConnectivityEvent::for_state(state))
    }

    /// When the pending transition (if any) settles.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.candidate.map(|(_, since)| since + self.debounce)
    }

    /// Drives the monitor from a channel of raw signals until either side
    /// closes.
    pub async fn run(
        mut self,
        clock: Arc<dyn Clock>,
        mut signals: mpsc::Receiver<bool>,
        events: mpsc::Sender<ConnectivityEvent>,
    ) {
        loop {
            let deadline = self.next_deadline();
            let wait = deadline.map(|d| (d - clock.now()).to_std().unwrap_or(Duration::ZERO));

            let event = tokio::select! {
                signal = signals.recv() => match signal {
                    Some(reachable) => self.observe(reachable, clock.now()),
                    None => return,
                },
                _ = sleep_until(clock.as_ref(), wait) => {
                    let now = match deadline {
                        Some(deadline) => clock.now().max(deadline),
                        None => clock.now(),
                    };
                    self.poll(now)
                }
            };

            if let Some(event) = event {
                if events.send(event).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn sleep_until(clock: &dyn Clock, wait: Option<Duration>) {
    match wait {
        Some(duration) => clock.sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn test_transition_reported_after_debounce() {
        let t0 = Utc::now();
        let mut monitor = ConnectivityMonitor::new(true);

        assert_eq!(monitor.observe(false, t0), None);
        assert_eq!(monitor.next_deadline(), Some(t0 + secs(2)));
        assert_eq!(monitor.poll(t0 + secs(1)), None);
        assert_eq!(monitor.poll(t0 + secs(2)), Some(ConnectivityEvent::BecameOffline));
        assert!(!monitor.is_online());
        assert_eq!(monitor.poll(t0 + secs(10)), None);
    }

    #[test]
    fn test_flapping_collapses() {
        let t0 = Utc::now();
        let mut monitor = ConnectivityMonitor::new(true);

        monitor.observe(false, t0);
        monitor.observe(true, t0 + chrono::Duration::milliseconds(300));
        monitor.observe(false, t0 + chrono::Duration::milliseconds(600));
        monitor.observe(true, t0 + chrono::Duration::milliseconds(900));

        assert_eq!(monitor.next_deadline(), None);
        assert_eq!(monitor.poll(t0 + secs(5)), None);
        assert!(monitor.is_online());
    }

    #[test]
    fn test_repeated_signal_keeps_first_timestamp() {
        let t0 = Utc::now();
        let mut monitor = ConnectivityMonitor::new(false);

        monitor.observe(true, t0);
        monitor.observe(true, t0 + secs(1));
        assert_eq!(monitor.next_deadline(), Some(t0 + secs(2)));
    }

    #[test]
    fn test_settled_transition_reported_on_next_signal() {
        let t0 = Utc::now();
        let mut monitor = ConnectivityMonitor::new(true);

        monitor.observe(false, t0);
        assert_eq!(
            monitor.observe(true, t0 + secs(5)),
            Some(ConnectivityEvent::BecameOffline)
        );
        assert_eq!(monitor.poll(t0 + secs(7)), Some(ConnectivityEvent::BecameOnline));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_emits_one_event_per_transition() {
        let (signal_tx, signal_rx) = mpsc::channel(8);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let monitor = ConnectivityMonitor::with_debounce(true, Duration::from_millis(200));
        let handle = tokio::spawn(monitor.run(Arc::new(SystemClock), signal_rx, event_tx));

        signal_tx.send(false).await.unwrap();
        signal_tx.send(true).await.unwrap();
        signal_tx.send(false).await.unwrap();
        assert_eq!(event_rx.recv().await, Some(ConnectivityEvent::BecameOffline));

        signal_tx.send(true).await.unwrap();
        assert_eq!(event_rx.recv().await, Some(ConnectivityEvent::BecameOnline));

        drop(signal_tx);
        handle.await.unwrap();
    }
}
