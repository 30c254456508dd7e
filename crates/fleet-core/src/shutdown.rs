//! Cooperative shutdown signaling.
//!
//! Every long-running background task in the control plane (the MQTT PUBACK
//! resolver loop, today) holds a [`ShutdownWatcher`] and selects on it
//! alongside its normal work, so a single `Ctrl-C` drains the process instead
//! of dropping in-flight state.

use tokio::sync::watch;

#[derive(Clone)]
pub struct ShutdownTrigger {
	tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct ShutdownWatcher {
	rx: watch::Receiver<bool>,
}

/// Builds a connected trigger/watcher pair. The trigger is held by `main`;
/// the watcher is cloned into every task that needs to know when to stop.
pub fn channel() -> (ShutdownTrigger, ShutdownWatcher) {
	let (tx, rx) = watch::channel(false);
	(ShutdownTrigger { tx }, ShutdownWatcher { rx })
}

impl ShutdownTrigger {
	/// Signals all watchers that the process is shutting down. Idempotent.
	pub fn shutdown(&self) {
		let _ = self.tx.send(true);
	}
}

impl ShutdownWatcher {
	/// Resolves once shutdown has been triggered. Safe to call from a
	/// `tokio::select!` branch repeatedly; cloning the receiver means each
	/// caller tracks its own "have I already observed this" state.
	pub async fn signaled(&mut self) {
		if *self.rx.borrow() {
			return;
		}
		let _ = self.rx.changed().await;
	}

	pub fn is_signaled(&self) -> bool {
		*self.rx.borrow()
	}
}

/// Waits for SIGINT/SIGTERM (or just Ctrl-C on platforms without SIGTERM)
/// and fires the trigger. Spawned once from `main`.
pub async fn wait_for_signal(trigger: ShutdownTrigger) {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{SignalKind, signal};
		let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
		tokio::select! {
			_ = tokio::signal::ctrl_c() => {},
			_ = sigterm.recv() => {},
		}
	}
	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
	}
	tracing::info!("shutdown signal received, draining");
	trigger.shutdown();
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn watcher_observes_trigger() {
		let (trigger, mut watcher) = channel();
		assert!(!watcher.is_signaled());
		trigger.shutdown();
		watcher.signaled().await;
		assert!(watcher.is_signaled());
	}
}
