use serde::{Deserialize, Serialize};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::{bus::Bus, event::Event};

/// The NOTIFY channel shared by every process writing to the same database.
pub const PG_CHANNEL: &str = "pm_events";

/// Wire envelope for cross-process fanout. `origin` is the publishing bus
/// instance so a process can ignore its own notifications.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
	pub origin: Uuid,
	pub event: Event,
}

/// Collects events during a transaction. `pg_notify` is transactional, so
/// staging inside the transaction gives commit-ordered cross-process
/// delivery for free: if the commit fails, nothing is notified. Local
/// subscribers are flushed only after the commit succeeds.
#[derive(Default)]
pub struct TxEvents {
	events: Vec<Event>,
}

impl TxEvents {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, event: Event) {
		self.events.push(event);
	}

	pub fn is_empty(&self) -> bool {
		self.events.is_empty()
	}

	pub fn len(&self) -> usize {
		self.events.len()
	}

	/// Hands the buffered events to a caller that merges them into another
	/// buffer (batch sub-transactions).
	pub fn into_events(self) -> Vec<Event> {
		self.events
	}

	/// Stages every collected event as a `pg_notify` inside the transaction.
	/// Call once, immediately before commit.
	pub async fn stage(
		&self,
		tx: &mut Transaction<'_, Postgres>,
		origin: Uuid,
	) -> sqlx::Result<()> {
		for event in &self.events {
			let envelope = Envelope { origin, event: event.clone() };
			let payload = serde_json::to_string(&envelope)
				.map_err(|err| sqlx::Error::Encode(Box::new(err)))?;

			sqlx::query("SELECT pg_notify($1, $2)")
				.bind(PG_CHANNEL)
				.bind(payload)
				.execute(&mut **tx)
				.await?;
		}

		Ok(())
	}

	/// Delivers to in-process subscribers. Only call after the transaction
	/// committed; a failed commit discards the buffer.
	pub fn flush(self, bus: &Bus) {
		for event in self.events {
			bus.publish(&event);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn flush_delivers_in_order_after_commit() {
		let bus = Bus::new();
		let mut sub = bus.subscribe(None);
		let mut staged = TxEvents::new();
		let first = Uuid::new_v4();
		let second = Uuid::new_v4();

		staged.push(Event::EntityUpdated { id: first });
		staged.push(Event::EntityUpdated { id: second });

		assert_eq!(sub.try_recv(), None, "nothing is visible before flush");

		staged.flush(&bus);

		assert_eq!(sub.try_recv(), Some(Event::EntityUpdated { id: first }));
		assert_eq!(sub.try_recv(), Some(Event::EntityUpdated { id: second }));
	}

	#[test]
	fn envelope_round_trips() {
		let envelope = Envelope {
			origin: Uuid::new_v4(),
			event: Event::RawNoteProcessed {
				raw_note_id: Uuid::new_v4(),
				entity_ids: vec![Uuid::new_v4()],
			},
		};
		let raw = serde_json::to_string(&envelope).unwrap();
		let decoded: Envelope = serde_json::from_str(&raw).unwrap();

		assert_eq!(decoded.origin, envelope.origin);
		assert_eq!(decoded.event, envelope.event);
	}
}
