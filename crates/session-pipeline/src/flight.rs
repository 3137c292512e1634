//! Renewal coalescing
//!
//! When several requests hit 401 at once, each would otherwise run its own
//! renewal, and every renewal rotates the refresh cookie out from under the
//! others. `RenewalFlight` lets the first caller start a renewal and every
//! caller that arrives while it runs await the same outcome.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use session_auth::{AccessCredential, RenewalFailure};
use tracing::debug;

type RenewalOutcome = Result<AccessCredential, RenewalFailure>;

/// How concurrent 401s share renewals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenewalPolicy {
    /// At most one renewal in flight; concurrent callers join it.
    #[default]
    Coalesced,
    /// Every 401 renews on its own.
    Independent,
}

struct Flight {
    id: u64,
    /// Set by the renewal task itself, so a flight abandoned by all of its
    /// callers is never joined after it finished.
    finished: Arc<AtomicBool>,
    outcome: Shared<BoxFuture<'static, RenewalOutcome>>,
}

/// Single-slot registry for the renewal currently in flight.
#[derive(Default)]
pub struct RenewalFlight {
    slot: Mutex<Option<Flight>>,
    next_id: AtomicU64,
}

impl RenewalFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the renewal in flight, or start one with `start`.
    ///
    /// The renewal runs on its own task, so it completes even if every
    /// caller waiting on it is cancelled.
    pub async fn run<F>(&self, start: F) -> RenewalOutcome
    where
        F: FnOnce() -> BoxFuture<'static, RenewalOutcome>,
    {
        let (id, outcome) = {
            let mut slot = self.slot.lock();
            match slot.as_ref() {
                Some(flight) if !flight.finished.load(Ordering::Acquire) => {
                    debug!(flight = flight.id, "joining renewal in flight");
                    (flight.id, flight.outcome.clone())
                }
                _ => {
                    let flight = self.launch(start());
                    let joined = (flight.id, flight.outcome.clone());
                    *slot = Some(flight);
                    joined
                }
            }
        };

        let result = outcome.await;

        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|flight| flight.id == id) {
            *slot = None;
        }
        result
    }

    pub fn in_flight(&self) -> bool {
        self.slot
            .lock()
            .as_ref()
            .is_some_and(|flight| !flight.finished.load(Ordering::Acquire))
    }

    fn launch(&self, renewal: BoxFuture<'static, RenewalOutcome>) -> Flight {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let finished = Arc::new(AtomicBool::new(false));

        let done = finished.clone();
        let handle = tokio::spawn(async move {
            let result = renewal.await;
            done.store(true, Ordering::Release);
            result
        });

        debug!(flight = id, "starting renewal");
        Flight {
            id,
            finished,
            outcome: async move {
                handle.await.unwrap_or_else(|e| {
                    Err(RenewalFailure::NetworkError(format!("renewal task failed: {e}")))
                })
            }
            .boxed()
            .shared(),
        }
    }
}
