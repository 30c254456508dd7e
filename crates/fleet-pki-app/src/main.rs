//! Process entry point: loads configuration, wires every `fleet_pki`
//! collaborator through `AppState`, binds the HTTP router, and drains on
//! SIGINT/SIGTERM. Follows the teacher's split between ambient process
//! wiring here and domain logic kept entirely in the library crate.

mod directory;
mod http;
mod mqtt;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use fleet_core::shutdown;
use fleet_pki::config::AppConfig;
use fleet_pki::liveness::{ActiveDeviceCache, DeviceLivenessTracker, PubAckTracker};
use fleet_pki::AppState;

use crate::directory::HttpDirectory;
use crate::mqtt::LocalMqttClient;

/// `fleet-pki` takes all of its configuration from the environment
/// (`spec.md` §6); this binary accepts no runtime flags of its own beyond
/// the ones `clap` derives for free (`--help`, `--version`).
#[derive(Parser, Debug)]
#[command(name = "fleet-pki", version, about = "IoT device provisioning and certificate control plane")]
struct Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let _ = Cli::parse();
	fleet_core::logging::init();

	let config = AppConfig::from_env()?;
	tracing::info!(?config, "starting fleet-pki");

	let directory = Arc::new(HttpDirectory::new(config.directory_base_url.clone()));
	let host = config.http_host.clone();
	let port = config.http_port;

	let mut state = AppState::build(config, directory).await?;

	let mqtt = Arc::new(LocalMqttClient::new());
	let cache = ActiveDeviceCache::new(state.redis.clone());
	let (puback_tracker, pending) = PubAckTracker::new(64);
	let puback_tracker = Arc::new(puback_tracker);
	let (acks_tx, acks_rx) = tokio::sync::mpsc::channel(64);

	let (shutdown_trigger, shutdown_watcher) = shutdown::channel();

	let liveness = Arc::new(DeviceLivenessTracker::new(
		mqtt.clone(),
		cache,
		state.audit.clone(),
		state.telemetry.clone(),
		puback_tracker,
		acks_tx,
		state.config.mqtt_topic_prefix.clone(),
	));
	mqtt.set_message_callback(liveness.message_callback());
	if let Err(err) = liveness.subscribe_all().await {
		tracing::warn!(error = %err, "failed to subscribe to mqtt topics at startup");
	}
	state = state.with_liveness(liveness);

	tokio::spawn(shutdown::wait_for_signal(shutdown_trigger));
	tokio::spawn(fleet_pki::liveness::run_puback_resolver(pending, acks_rx, shutdown_watcher.clone()));

	let app = http::router(Arc::new(state));
	let addr: SocketAddr = format!("{host}:{port}").parse()?;
	let listener = tokio::net::TcpListener::bind(addr).await?;
	tracing::info!(%addr, "listening");

	let mut graceful_watcher = shutdown_watcher;
	axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
		.with_graceful_shutdown(async move {
			graceful_watcher.signaled().await;
		})
		.await?;

	Ok(())
}
