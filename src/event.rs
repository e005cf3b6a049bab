use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

/// Sync signals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
  /// The backend became reachable again
  Online,
  /// The backend stopped answering
  Offline,
  /// Periodic background sync timer
  PeriodicSync,
}

/// Event handler that turns reachability probes and a sync timer into
/// signals.
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Probe every `probe_interval`; emit on reachability transitions and,
  /// when `periodic` is set, on every timer tick.
  ///
  /// The first successful probe counts as a transition, so pending writes
  /// are replayed right after startup.
  pub fn new<P, Fut>(probe: P, probe_interval: Duration, periodic: Option<Duration>) -> Self
  where
    P: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      let mut probe_timer = tokio::time::interval(probe_interval);
      probe_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

      // Never fires when periodic sync is off
      let mut sync_timer = periodic.map(|period| {
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
      });

      let mut online: Option<bool> = None;

      loop {
        let event = tokio::select! {
          _ = probe_timer.tick() => {
            let reachable = probe().await;
            if online == Some(reachable) {
              continue;
            }
            let was_known = online.is_some();
            online = Some(reachable);
            match (reachable, was_known) {
              (true, _) => Event::Online,
              (false, true) => Event::Offline,
              // Starting offline is not a transition
              (false, false) => continue,
            }
          }
          _ = async {
            match sync_timer.as_mut() {
              Some(timer) => timer.tick().await,
              None => std::future::pending().await,
            }
          } => Event::PeriodicSync,
        };

        if tx.send(event).is_err() {
          break;
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
