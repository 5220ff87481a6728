use std::{
	collections::{HashSet, VecDeque},
	sync::{Arc, Mutex},
};

use tokio::sync::Notify;
use uuid::Uuid;

use crate::event::{Event, Topic};

/// Per-subscriber buffer size. A subscriber that falls behind loses the
/// oldest events and records a drop count; the publisher never blocks.
pub const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Default)]
struct SubscriberState {
	queue: VecDeque<Event>,
	dropped: u64,
	closed: bool,
}

struct SubscriberShared {
	state: Mutex<SubscriberState>,
	notify: Notify,
	filter: Option<HashSet<Topic>>,
}

/// In-process pub/sub over the fixed topic tree. Each process owns one bus;
/// the `instance` id tags outgoing NOTIFY envelopes so the cross-process
/// bridge can skip events that already arrived locally.
pub struct Bus {
	instance: Uuid,
	subscribers: Mutex<Vec<Arc<SubscriberShared>>>,
}

impl Default for Bus {
	fn default() -> Self {
		Self::new()
	}
}

impl Bus {
	pub fn new() -> Self {
		Self { instance: Uuid::new_v4(), subscribers: Mutex::new(Vec::new()) }
	}

	pub fn instance(&self) -> Uuid {
		self.instance
	}

	pub fn subscribe(&self, filter: Option<HashSet<Topic>>) -> Subscription {
		let shared = Arc::new(SubscriberShared {
			state: Mutex::new(SubscriberState::default()),
			notify: Notify::new(),
			filter,
		});

		self.subscribers.lock().unwrap_or_else(|err| err.into_inner()).push(Arc::clone(&shared));

		Subscription { shared }
	}

	pub fn publish(&self, event: &Event) {
		let mut subscribers = self.subscribers.lock().unwrap_or_else(|err| err.into_inner());

		subscribers.retain(|shared| {
			let mut state = shared.state.lock().unwrap_or_else(|err| err.into_inner());

			if state.closed {
				return false;
			}
			if let Some(filter) = shared.filter.as_ref()
				&& !filter.contains(&event.topic())
			{
				return true;
			}

			if state.queue.len() >= SUBSCRIBER_BUFFER {
				state.queue.pop_front();
				state.dropped = state.dropped.saturating_add(1);
			}

			state.queue.push_back(event.clone());
			drop(state);
			shared.notify.notify_one();

			true
		});
	}
}

/// Receiving half of a subscription. Dropping it unsubscribes.
pub struct Subscription {
	shared: Arc<SubscriberShared>,
}

impl Subscription {
	pub async fn recv(&mut self) -> Event {
		loop {
			let notified = self.shared.notify.notified();

			if let Some(event) = self.pop() {
				return event;
			}

			notified.await;
		}
	}

	pub fn try_recv(&mut self) -> Option<Event> {
		self.pop()
	}

	/// How many events this subscriber has lost to buffer overflow.
	pub fn dropped(&self) -> u64 {
		self.shared.state.lock().unwrap_or_else(|err| err.into_inner()).dropped
	}

	fn pop(&self) -> Option<Event> {
		self.shared.state.lock().unwrap_or_else(|err| err.into_inner()).queue.pop_front()
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		self.shared.state.lock().unwrap_or_else(|err| err.into_inner()).closed = true;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn updated(id: Uuid) -> Event {
		Event::EntityUpdated { id }
	}

	#[test]
	fn delivers_in_publish_order() {
		let bus = Bus::new();
		let mut sub = bus.subscribe(None);
		let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();

		for id in &ids {
			bus.publish(&updated(*id));
		}

		for id in &ids {
			assert_eq!(sub.try_recv(), Some(updated(*id)));
		}
		assert_eq!(sub.try_recv(), None);
	}

	#[test]
	fn overflow_drops_oldest_and_counts() {
		let bus = Bus::new();
		let mut sub = bus.subscribe(None);
		let ids: Vec<Uuid> = (0..SUBSCRIBER_BUFFER + 10).map(|_| Uuid::new_v4()).collect();

		for id in &ids {
			bus.publish(&updated(*id));
		}

		assert_eq!(sub.dropped(), 10);
		// The oldest ten are gone; delivery resumes at index 10 in order.
		assert_eq!(sub.try_recv(), Some(updated(ids[10])));
	}

	#[test]
	fn filter_limits_topics() {
		let bus = Bus::new();
		let mut sub = bus.subscribe(Some(HashSet::from([Topic::ReviewQueueResolved])));

		bus.publish(&updated(Uuid::new_v4()));
		bus.publish(&Event::ReviewQueueResolved {
			id: Uuid::new_v4(),
			status: "accepted".to_string(),
		});

		let event = sub.try_recv().expect("filtered event should arrive");

		assert_eq!(event.topic(), Topic::ReviewQueueResolved);
		assert_eq!(sub.try_recv(), None);
	}

	#[test]
	fn dropped_subscription_is_pruned() {
		let bus = Bus::new();
		let sub = bus.subscribe(None);

		drop(sub);
		bus.publish(&updated(Uuid::new_v4()));

		assert!(bus.subscribers.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn recv_wakes_on_publish() {
		let bus = Arc::new(Bus::new());
		let mut sub = bus.subscribe(None);
		let id = Uuid::new_v4();
		let publisher = {
			let bus = Arc::clone(&bus);

			tokio::spawn(async move {
				tokio::time::sleep(std::time::Duration::from_millis(10)).await;
				bus.publish(&updated(id));
			})
		};

		assert_eq!(sub.recv().await, updated(id));
		publisher.await.unwrap();
	}
}
