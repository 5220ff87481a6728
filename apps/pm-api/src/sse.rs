use std::{collections::HashSet, convert::Infallible, time::Duration};

use axum::{
	extract::{Query, State},
	response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use pm_bus::{Event, Subscription, Topic};

use crate::{routes::ReqCtx, state::AppState};

#[derive(Debug, Default, Deserialize)]
pub struct SseQuery {
	/// Comma-separated topic filter, e.g. `entity:updated,review_queue:resolved`.
	pub topics: Option<String>,
}

/// The change stream: ordered delivery per connection, `entity:updated`
/// coalesced per id inside a short window, comment keep-alives while idle.
/// No delivery guarantee across reconnects; consumers treat frames as hints
/// and refetch authoritative state.
pub async fn sse_handler(
	State(state): State<AppState>,
	_ctx: ReqCtx,
	Query(query): Query<SseQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
	let filter: Option<HashSet<Topic>> = query
		.topics
		.map(|raw| raw.split(',').filter_map(|topic| topic.trim().parse().ok()).collect())
		.filter(|set: &HashSet<Topic>| !set.is_empty());
	let subscription = state.bus.subscribe(filter);
	let window = Duration::from_millis(state.service.cfg.service.sse_coalesce_ms);
	let keepalive = Duration::from_secs(state.service.cfg.service.sse_keepalive_secs);
	let stream = coalesced(subscription, window).map(|event| Ok(frame(&event)));

	Sse::new(stream).keep_alive(KeepAlive::new().interval(keepalive).text("ping"))
}

fn frame(event: &Event) -> SseEvent {
	SseEvent::default().event(event.topic().as_str()).data(event.payload_json().to_string())
}

/// Wraps a bus subscription so that a burst of `entity:updated` events for
/// the same id inside `window` collapses to one frame. Any other event ends
/// the window early; updates are flushed first so publish order holds.
pub(crate) fn coalesced(
	mut subscription: Subscription,
	window: Duration,
) -> impl Stream<Item = Event> {
	async_stream::stream! {
		let mut carried: Option<Event> = None;

		loop {
			let event = match carried.take() {
				Some(event) => event,
				None => subscription.recv().await,
			};

			match event {
				Event::EntityUpdated { id } => {
					let mut ids: Vec<Uuid> = vec![id];
					let deadline = tokio::time::sleep(window);

					tokio::pin!(deadline);

					loop {
						tokio::select! {
							_ = &mut deadline => break,
							next = subscription.recv() => match next {
								Event::EntityUpdated { id } => {
									if !ids.contains(&id) {
										ids.push(id);
									}
								},
								other => {
									carried = Some(other);

									break;
								},
							},
						}
					}

					for id in ids {
						yield Event::EntityUpdated { id };
					}
				},
				other => yield other,
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use pm_bus::Bus;

	use super::*;

	#[tokio::test]
	async fn update_storm_collapses_to_one_frame_per_id() {
		let bus = Arc::new(Bus::new());
		let subscription = bus.subscribe(None);
		let stream = coalesced(subscription, Duration::from_millis(50));
		let id = Uuid::new_v4();

		for _ in 0..5 {
			bus.publish(&Event::EntityUpdated { id });
		}

		bus.publish(&Event::ReviewQueueResolved {
			id: Uuid::new_v4(),
			status: "accepted".to_string(),
		});

		let events: Vec<Event> =
			tokio::time::timeout(Duration::from_secs(2), stream.take(2).collect::<Vec<_>>())
				.await
				.expect("stream should yield within the window");

		assert_eq!(events[0], Event::EntityUpdated { id });
		assert_eq!(events[1].topic(), Topic::ReviewQueueResolved);
	}

	#[tokio::test]
	async fn distinct_ids_each_get_a_frame() {
		let bus = Arc::new(Bus::new());
		let subscription = bus.subscribe(None);
		let stream = coalesced(subscription, Duration::from_millis(30));
		let first = Uuid::new_v4();
		let second = Uuid::new_v4();

		bus.publish(&Event::EntityUpdated { id: first });
		bus.publish(&Event::EntityUpdated { id: second });
		bus.publish(&Event::EntityUpdated { id: first });

		let events: Vec<Event> =
			tokio::time::timeout(Duration::from_secs(2), stream.take(2).collect::<Vec<_>>())
				.await
				.expect("stream should yield within the window");

		assert_eq!(events, vec![
			Event::EntityUpdated { id: first },
			Event::EntityUpdated { id: second },
		]);
	}
}
