//! Single-flight refresh gate.
//!
//! The first caller to reach an idle gate becomes the leader and runs the refresh procedure.
//! Callers arriving while it runs are queued as waiters and receive the leader's outcome once it
//! settles, in registration order. The queue is drained every time a flight ends, including when
//! the leader's future is dropped mid-refresh, so no waiter is ever left hanging.

// std
use std::{collections::VecDeque, mem};
// crates.io
use tokio::sync::oneshot;
// self
use crate::{
	_prelude::*,
	obs::{self, CallKind, CallOutcome, CallSpan},
	refresh::{RefreshError, RefreshMetrics, RefreshOutcome},
};

type Waiter = oneshot::Sender<RefreshOutcome>;

/// Serializes refresh procedures so at most one runs at a time.
///
/// Construct one gate per process (or per backend session) and share it behind an [`Arc`]
/// with every [`ApiClient`](crate::client::ApiClient) that talks to the same backend.
#[derive(Debug, Default)]
pub struct RefreshGate {
	state: Mutex<GateState>,
	metrics: Arc<RefreshMetrics>,
}
impl RefreshGate {
	/// Creates an idle gate.
	pub fn new() -> Self {
		Self::default()
	}

	/// Counters describing the gate's activity.
	pub fn metrics(&self) -> &RefreshMetrics {
		&self.metrics
	}

	/// Returns `true` while a refresh is in flight.
	pub fn is_refreshing(&self) -> bool {
		self.state.lock().in_flight
	}

	/// Number of callers currently waiting on the in-flight refresh.
	pub fn pending_waiters(&self) -> usize {
		self.state.lock().waiters.len()
	}

	/// Runs `refresh` unless another refresh is already in flight, in which case the caller waits
	/// for that one instead and `refresh` is dropped without being called.
	///
	/// A waiter whose `cancel` token fires stops waiting and receives
	/// [`RefreshError::Abandoned`]. The leader ignores `cancel`: the flight it runs is shared with
	/// every waiter, so it always runs to completion.
	pub async fn acquire<F, Fut>(
		&self,
		refresh: F,
		cancel: Option<&CancellationToken>,
	) -> RefreshOutcome
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = RefreshOutcome>,
	{
		const KIND: CallKind = CallKind::Refresh;

		let waiter = {
			let mut state = self.state.lock();

			if state.in_flight {
				let (tx, rx) = oneshot::channel();

				state.waiters.push_back(tx);

				Some(rx)
			} else {
				state.in_flight = true;

				None
			}
		};

		if let Some(rx) = waiter {
			self.metrics.record_coalesced();

			let received = match cancel {
				Some(cancel) => tokio::select! {
					biased;
					_ = cancel.cancelled() => None,
					outcome = rx => outcome.ok(),
				},
				None => rx.await.ok(),
			};

			return received.unwrap_or(Err(RefreshError::Abandoned));
		}

		let span = CallSpan::new(KIND, "refresh_gate");
		let mut flight = Flight { gate: self, settled: false };

		self.metrics.record_attempt();
		obs::record_call_outcome(KIND, CallOutcome::Attempt);

		let outcome = span.instrument(refresh()).await;

		match &outcome {
			Ok(Some(_)) => {
				self.metrics.record_success();
				obs::record_call_outcome(KIND, CallOutcome::Success);
			},
			_ => {
				self.metrics.record_failure();
				obs::record_call_outcome(KIND, CallOutcome::Failure);
			},
		}

		flight.settle(&outcome);

		outcome
	}

	fn release(&self, outcome: &RefreshOutcome) {
		let waiters = {
			let mut state = self.state.lock();

			state.in_flight = false;

			mem::take(&mut state.waiters)
		};

		for waiter in waiters {
			// Waiters that stopped waiting have dropped their receiver.
			let _ = waiter.send(outcome.clone());
		}
	}
}

#[derive(Debug, Default)]
struct GateState {
	in_flight: bool,
	waiters: VecDeque<Waiter>,
}

/// Leader-side guard; settles the queue even if the leader's future is dropped.
struct Flight<'a> {
	gate: &'a RefreshGate,
	settled: bool,
}
impl Flight<'_> {
	fn settle(&mut self, outcome: &RefreshOutcome) {
		self.settled = true;
		self.gate.release(outcome);
	}
}
impl Drop for Flight<'_> {
	fn drop(&mut self) {
		if !self.settled {
			self.gate.metrics.record_failure();
			self.gate.release(&Err(RefreshError::Abandoned));
		}
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::time::Duration as StdDuration;
	// self
	use super::*;
	use crate::auth::TokenSecret;

	fn token(value: &str) -> RefreshOutcome {
		Ok(Some(TokenSecret::new(value)))
	}

	async fn wait_for_waiters(gate: &RefreshGate, count: usize) {
		while gate.pending_waiters() < count {
			tokio::task::yield_now().await;
		}
	}

	#[tokio::test]
	async fn idle_gate_runs_refresh_once() {
		let gate = RefreshGate::new();
		let outcome = gate.acquire(|| async { token("token-b") }, None).await;

		assert_eq!(outcome, token("token-b"));
		assert!(!gate.is_refreshing());
		assert_eq!(gate.metrics().attempts(), 1);
		assert_eq!(gate.metrics().successes(), 1);
		assert_eq!(gate.metrics().coalesced(), 0);
	}

	#[tokio::test]
	async fn concurrent_callers_share_one_flight() {
		let gate = RefreshGate::new();
		let (release_tx, release_rx) = oneshot::channel::<()>();
		let leader = gate.acquire(
			|| async move {
				let _ = release_rx.await;

				token("token-b")
			},
			None,
		);
		let first = gate.acquire(|| async { token("unused") }, None);
		let second = gate.acquire(|| async { token("unused") }, None);
		let release = async {
			wait_for_waiters(&gate, 2).await;

			assert!(gate.is_refreshing());

			release_tx.send(()).expect("Leader should still be waiting for release.");
		};
		let (leader, first, second, ()) = tokio::join!(leader, first, second, release);

		assert_eq!(leader, token("token-b"));
		assert_eq!(first, token("token-b"));
		assert_eq!(second, token("token-b"));
		assert_eq!(gate.pending_waiters(), 0);
		assert!(!gate.is_refreshing());
		assert_eq!(gate.metrics().attempts(), 1);
		assert_eq!(gate.metrics().coalesced(), 2);
	}

	#[tokio::test]
	async fn failure_is_fanned_out_to_every_waiter() {
		let gate = RefreshGate::new();
		let (release_tx, release_rx) = oneshot::channel::<()>();
		let rejected = RefreshError::Rejected { status: Some(401), reason: "expired".into() };
		let expected = rejected.clone();
		let leader = gate.acquire(
			|| async move {
				let _ = release_rx.await;

				Err(rejected)
			},
			None,
		);
		let waiter = gate.acquire(|| async { token("unused") }, None);
		let release = async {
			wait_for_waiters(&gate, 1).await;

			release_tx.send(()).expect("Leader should still be waiting for release.");
		};
		let (leader, waiter, ()) = tokio::join!(leader, waiter, release);

		assert_eq!(leader, Err(expected.clone()));
		assert_eq!(waiter, Err(expected));
		assert_eq!(gate.metrics().failures(), 1);

		let next = gate.acquire(|| async { token("token-c") }, None).await;

		assert_eq!(next, token("token-c"), "A settled failure must not block the next flight.");
		assert_eq!(gate.metrics().attempts(), 2);
	}

	#[tokio::test]
	async fn dropped_leader_releases_waiters() {
		let gate = RefreshGate::new();
		let (_hold_tx, hold_rx) = oneshot::channel::<()>();
		let leader = tokio::time::timeout(
			StdDuration::from_millis(20),
			gate.acquire(
				|| async move {
					let _ = hold_rx.await;

					token("never")
				},
				None,
			),
		);
		let waiter = gate.acquire(|| async { token("unused") }, None);
		let (leader, waiter) = tokio::join!(leader, waiter);

		assert!(leader.is_err(), "Leader should have been dropped by the timeout.");
		assert_eq!(waiter, Err(RefreshError::Abandoned));
		assert!(!gate.is_refreshing());
	}

	#[tokio::test]
	async fn cancelled_waiter_stops_waiting_without_disturbing_the_leader() {
		let gate = RefreshGate::new();
		let cancel = CancellationToken::new();
		let (release_tx, release_rx) = oneshot::channel::<()>();
		let leader = gate.acquire(
			|| async move {
				let _ = release_rx.await;

				token("token-b")
			},
			Some(&cancel),
		);
		let waiter = gate.acquire(|| async { token("unused") }, Some(&cancel));
		let driver = async {
			wait_for_waiters(&gate, 1).await;
			cancel.cancel();
			tokio::task::yield_now().await;

			release_tx.send(()).expect("Leader should still be waiting for release.");
		};
		let (leader, waiter, ()) = tokio::join!(leader, waiter, driver);

		assert_eq!(leader, token("token-b"));
		assert_eq!(waiter, Err(RefreshError::Abandoned));
		assert_eq!(gate.pending_waiters(), 0);
	}
}
