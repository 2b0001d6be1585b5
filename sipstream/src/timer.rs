//! Timer service with the RFC 3261 defaults.
//!
//! Transaction and transaction-user machines schedule named timers from
//! here. A fired timer whose owning machine has already moved on must be
//! a no-op; owners guarantee that by re-checking their state inside the
//! timer body (so cancellation races are harmless).

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;

/// Round-trip time estimate.
pub const T1: Duration = Duration::from_millis(500);
/// Maximum retransmission interval for non-INVITE requests and INVITE
/// responses.
pub const T2: Duration = Duration::from_secs(4);
/// Maximum duration a message remains in the network.
pub const T4: Duration = Duration::from_secs(5);

/// INVITE client transaction timeout (Timer B), and equally F, H, L, M
/// and N: 64 times T1.
pub const TIMER_B: Duration = Duration::from_millis(64 * 500);
pub const TIMER_F: Duration = TIMER_B;
pub const TIMER_H: Duration = TIMER_B;
pub const TIMER_L: Duration = TIMER_B;
pub const TIMER_M: Duration = TIMER_B;
pub const TIMER_N: Duration = TIMER_B;

/// How long the INVITE server transaction waits before answering with a
/// 100 Trying on the TU's behalf.
pub const TRYING_DELAY: Duration = Duration::from_millis(200);

/// Wait time for INVITE response retransmissions (Timer D).
pub fn timer_d(reliable: bool) -> Duration {
    if reliable {
        Duration::ZERO
    } else {
        Duration::from_secs(32)
    }
}

/// Wait time for ACK retransmissions (Timer I).
pub fn timer_i(reliable: bool) -> Duration {
    if reliable {
        Duration::ZERO
    } else {
        T4
    }
}

/// Wait time for non-INVITE request retransmissions (Timer J).
pub fn timer_j(reliable: bool) -> Duration {
    if reliable {
        Duration::ZERO
    } else {
        TIMER_B
    }
}

/// Wait time for non-INVITE response retransmissions (Timer K).
pub fn timer_k(reliable: bool) -> Duration {
    if reliable {
        Duration::ZERO
    } else {
        T4
    }
}

/// A cancelable one-shot timer.
///
/// The timer owns a spawned task that sleeps and then runs the given
/// future. Dropping or canceling the handle aborts the task; a handle
/// that already fired aborts nothing.
pub struct Timer {
    handle: JoinHandle<()>,
}

impl Timer {
    /// Schedules `task` to run after `delay`.
    pub fn start<F>(delay: Duration, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            time::sleep(delay).await;
            task.await;
        });
        Timer { handle }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
