use std::sync::Arc;

use sqlx::postgres::PgListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pm_domain::backoff;

use crate::{
	bus::Bus,
	tx::{Envelope, PG_CHANNEL},
};

const RECONNECT_BASE_MS: u64 = 1_000;
const RECONNECT_MAX_MS: u64 = 30_000;

/// Bridges Postgres NOTIFY into the local bus so a process sees events
/// committed by its peers. Reconnects with full-jitter backoff; events
/// raised while disconnected are lost, which is fine for a
/// cache-invalidation channel.
pub async fn run_notify_bridge(dsn: String, bus: Arc<Bus>, cancel: CancellationToken) {
	let mut attempt: u32 = 0;

	loop {
		if cancel.is_cancelled() {
			return;
		}

		match listen_once(&dsn, &bus, &cancel).await {
			Ok(()) => return,
			Err(err) => {
				attempt = attempt.saturating_add(1);

				let delay = backoff::full_jitter_ms(attempt, RECONNECT_BASE_MS, RECONNECT_MAX_MS);

				warn!(error = %err, attempt, delay_ms = delay, "Event listener disconnected.");

				tokio::select! {
					_ = cancel.cancelled() => return,
					_ = tokio::time::sleep(std::time::Duration::from_millis(delay)) => {},
				}
			},
		}
	}
}

async fn listen_once(
	dsn: &str,
	bus: &Bus,
	cancel: &CancellationToken,
) -> Result<(), sqlx::Error> {
	let mut listener = PgListener::connect(dsn).await?;

	listener.listen(PG_CHANNEL).await?;
	info!(channel = PG_CHANNEL, "Event listener connected.");

	loop {
		let notification = tokio::select! {
			_ = cancel.cancelled() => return Ok(()),
			notification = listener.recv() => notification?,
		};

		match serde_json::from_str::<Envelope>(notification.payload()) {
			Ok(envelope) if envelope.origin == bus.instance() => {},
			Ok(envelope) => bus.publish(&envelope.event),
			Err(err) => {
				warn!(error = %err, "Dropping malformed event notification.");
			},
		}
	}
}
