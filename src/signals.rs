//! Component B: the async event-pair signal channel.
//!
//! Mirrors `original_source/.../common/async-eventpair.{h,cc}`: two endpoints of an
//! event-pair exchange a small vocabulary of one-shot signals and can wait
//! asynchronously for the peer to raise one, or for the peer to close. Zircon's
//! `zx::eventpair` has no direct Linux analog, so each endpoint here is a shared
//! `AtomicU8` signal bitmask plus a `tokio::sync::Notify` to wake waiters, with an
//! explicit closed flag standing in for "peer handle dropped".

use std::sync::atomic::{AtomicU8, AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::{Error, Result};

/// One-shot signals exchanged between an engine-side process proxy and the
/// target-adapter-side runner stub. Matches the signal vocabulary in the external
/// interfaces design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signals(u8);

impl Signals {
    pub const SYNC: Signals = Signals(1 << 0);
    pub const START: Signals = Signals(1 << 1);
    pub const START_LEAK_CHECK: Signals = Signals(1 << 2);
    pub const FINISH: Signals = Signals(1 << 3);
    pub const FINISH_WITH_LEAKS: Signals = Signals(1 << 4);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u8) -> Self {
        Signals(bits)
    }

    pub const fn contains(self, other: Signals) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Signals) -> Signals {
        Signals(self.0 | other.0)
    }
}

impl std::ops::BitOr for Signals {
    type Output = Signals;
    fn bitor(self, rhs: Signals) -> Signals {
        self.union(rhs)
    }
}

struct Shared {
    signals: AtomicU8,
    closed: AtomicBool,
    notify: Notify,
}

/// One endpoint of an event-pair. Cloning shares the same underlying channel state; use
/// `AsyncEventPair::new_pair` to get two independent, cross-linked endpoints instead.
#[derive(Clone)]
pub struct AsyncEventPair {
    /// This endpoint's own signal word: the peer raises bits here via `signal_peer`/
    /// `close`, and this endpoint is the only one that waits on or clears it.
    local: Arc<Shared>,
    /// The peer's signal word: this endpoint raises bits here via `signal_peer`/`close`
    /// for the peer to wait on and clear.
    peer: Arc<Shared>,
}

impl AsyncEventPair {
    /// Creates two endpoints of a fresh event-pair, cross-wired to each other.
    pub fn new_pair() -> (AsyncEventPair, AsyncEventPair) {
        let a = Arc::new(Shared {
            signals: AtomicU8::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        });
        let b = Arc::new(Shared {
            signals: AtomicU8::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        });
        (
            AsyncEventPair {
                local: Arc::clone(&a),
                peer: Arc::clone(&b),
            },
            AsyncEventPair {
                local: b,
                peer: a,
            },
        )
    }

    /// Raises `signals` on the peer's word so the peer's `wait_for` can observe them.
    /// Mirrors Zircon's `zx_object_signal_peer`.
    pub fn signal_peer(&self, signals: Signals) {
        self.peer.signals.fetch_or(signals.bits(), Ordering::AcqRel);
        self.peer.notify.notify_waiters();
    }

    /// Clears `signals` on this endpoint's own word, e.g. after consuming a one-shot
    /// notification this endpoint just observed via `wait_for`.
    pub fn clear(&self, signals: Signals) {
        self.local.signals.fetch_and(!signals.bits(), Ordering::AcqRel);
    }

    /// Marks the peer's word closed, waking the peer's `wait_for` or `wait_for_close`
    /// with `Error::PeerClosed`.
    pub fn close(&self, target_id: u64) {
        self.peer.closed.store(true, Ordering::Release);
        self.peer.notify.notify_waiters();
        let _ = target_id;
    }

    /// Waits until this endpoint's own word carries any signal in `want`, returning the
    /// full set of signals observed (which may include more than `want`). Resolves
    /// immediately if a wanted signal is already pending.
    pub async fn wait_for(&self, want: Signals, target_id: u64) -> Result<Signals> {
        loop {
            // Subscribe before checking state: `notify_waiters` only wakes waiters
            // already registered, so a signal or close raised between the check and the
            // subscription would otherwise be missed.
            let notified = self.local.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.local.closed.load(Ordering::Acquire) {
                return Err(Error::PeerClosed(target_id));
            }
            let observed = self.local.signals.load(Ordering::Acquire);
            if observed & want.bits() != 0 {
                return Ok(Signals::from_bits_truncate(observed));
            }
            notified.await;
        }
    }

    /// Waits until the peer has closed its end (observed on this endpoint's own word).
    pub async fn wait_for_close(&self, target_id: u64) -> Result<()> {
        let _ = target_id;
        loop {
            let notified = self.local.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.local.closed.load(Ordering::Acquire) {
                return Ok(());
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_wakes_waiter() {
        let (a, b) = AsyncEventPair::new_pair();
        let waiter = tokio::spawn(async move { b.wait_for(Signals::START, 1).await });
        tokio::task::yield_now().await;
        a.signal_peer(Signals::START);
        let observed = waiter.await.unwrap().unwrap();
        assert!(observed.contains(Signals::START));
    }

    #[tokio::test]
    async fn close_unblocks_waiter_with_peer_closed() {
        let (a, b) = AsyncEventPair::new_pair();
        let waiter = tokio::spawn(async move { b.wait_for(Signals::FINISH, 7).await });
        tokio::task::yield_now().await;
        a.close(7);
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::PeerClosed(7)));
    }

    #[tokio::test]
    async fn clear_removes_only_requested_signals() {
        let (a, b) = AsyncEventPair::new_pair();
        a.signal_peer(Signals::START | Signals::SYNC);
        b.clear(Signals::SYNC);
        let observed = b.wait_for(Signals::START, 1).await.unwrap();
        assert!(observed.contains(Signals::START));
        assert!(!observed.contains(Signals::SYNC));
    }
}
