use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Topic {
	#[serde(rename = "entity:created")]
	EntityCreated,
	#[serde(rename = "entity:updated")]
	EntityUpdated,
	#[serde(rename = "entity:event_added")]
	EntityEventAdded,
	#[serde(rename = "raw_note:processed")]
	RawNoteProcessed,
	#[serde(rename = "review_queue:created")]
	ReviewQueueCreated,
	#[serde(rename = "review_queue:resolved")]
	ReviewQueueResolved,
	#[serde(rename = "project:stats_updated")]
	ProjectStatsUpdated,
}

impl Topic {
	pub const fn as_str(&self) -> &'static str {
		match self {
			Self::EntityCreated => "entity:created",
			Self::EntityUpdated => "entity:updated",
			Self::EntityEventAdded => "entity:event_added",
			Self::RawNoteProcessed => "raw_note:processed",
			Self::ReviewQueueCreated => "review_queue:created",
			Self::ReviewQueueResolved => "review_queue:resolved",
			Self::ProjectStatsUpdated => "project:stats_updated",
		}
	}
}

impl fmt::Display for Topic {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Topic {
	type Err = UnknownTopic;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		match raw {
			"entity:created" => Ok(Self::EntityCreated),
			"entity:updated" => Ok(Self::EntityUpdated),
			"entity:event_added" => Ok(Self::EntityEventAdded),
			"raw_note:processed" => Ok(Self::RawNoteProcessed),
			"review_queue:created" => Ok(Self::ReviewQueueCreated),
			"review_queue:resolved" => Ok(Self::ReviewQueueResolved),
			"project:stats_updated" => Ok(Self::ProjectStatsUpdated),
			other => Err(UnknownTopic { raw: other.to_string() }),
		}
	}
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown event topic: {raw}.")]
pub struct UnknownTopic {
	pub raw: String,
}

/// Every topic carries a fixed payload shape; the tagged representation is
/// the exact frame consumers see (`{"topic": ..., "payload": ...}`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "payload")]
pub enum Event {
	#[serde(rename = "entity:created")]
	EntityCreated {
		id: Uuid,
		#[serde(rename = "type")]
		entity_type: String,
	},
	#[serde(rename = "entity:updated")]
	EntityUpdated { id: Uuid },
	#[serde(rename = "entity:event_added")]
	EntityEventAdded {
		#[serde(rename = "entityId")]
		entity_id: Uuid,
		#[serde(rename = "eventId")]
		event_id: Uuid,
		#[serde(rename = "type")]
		event_type: String,
	},
	#[serde(rename = "raw_note:processed")]
	RawNoteProcessed {
		#[serde(rename = "rawNoteId")]
		raw_note_id: Uuid,
		#[serde(rename = "entityIds")]
		entity_ids: Vec<Uuid>,
	},
	#[serde(rename = "review_queue:created")]
	ReviewQueueCreated {
		id: Uuid,
		#[serde(rename = "reviewType")]
		review_type: String,
		#[serde(default, rename = "entityId", skip_serializing_if = "Option::is_none")]
		entity_id: Option<Uuid>,
		#[serde(default, rename = "projectId", skip_serializing_if = "Option::is_none")]
		project_id: Option<Uuid>,
	},
	#[serde(rename = "review_queue:resolved")]
	ReviewQueueResolved { id: Uuid, status: String },
	#[serde(rename = "project:stats_updated")]
	ProjectStatsUpdated {
		#[serde(rename = "projectId")]
		project_id: Uuid,
	},
}

impl Event {
	pub const fn topic(&self) -> Topic {
		match self {
			Self::EntityCreated { .. } => Topic::EntityCreated,
			Self::EntityUpdated { .. } => Topic::EntityUpdated,
			Self::EntityEventAdded { .. } => Topic::EntityEventAdded,
			Self::RawNoteProcessed { .. } => Topic::RawNoteProcessed,
			Self::ReviewQueueCreated { .. } => Topic::ReviewQueueCreated,
			Self::ReviewQueueResolved { .. } => Topic::ReviewQueueResolved,
			Self::ProjectStatsUpdated { .. } => Topic::ProjectStatsUpdated,
		}
	}

	pub fn payload_json(&self) -> serde_json::Value {
		serde_json::to_value(self)
			.ok()
			.and_then(|mut value| value.get_mut("payload").map(serde_json::Value::take))
			.unwrap_or(serde_json::Value::Null)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn events_serialize_with_topic_tag() {
		let id = Uuid::new_v4();
		let json =
			serde_json::to_value(Event::EntityCreated { id, entity_type: "task".to_string() })
				.unwrap();

		assert_eq!(json["topic"], "entity:created");
		assert_eq!(json["payload"]["id"], id.to_string());
		assert_eq!(json["payload"]["type"], "task");
	}

	#[test]
	fn events_round_trip() {
		let event = Event::ReviewQueueCreated {
			id: Uuid::new_v4(),
			review_type: "project_assignment".to_string(),
			entity_id: Some(Uuid::new_v4()),
			project_id: None,
		};
		let decoded: Event =
			serde_json::from_value(serde_json::to_value(&event).unwrap()).unwrap();

		assert_eq!(decoded, event);
	}

	#[test]
	fn topic_strings_round_trip() {
		for topic in [
			Topic::EntityCreated,
			Topic::EntityUpdated,
			Topic::EntityEventAdded,
			Topic::RawNoteProcessed,
			Topic::ReviewQueueCreated,
			Topic::ReviewQueueResolved,
			Topic::ProjectStatsUpdated,
		] {
			assert_eq!(topic.as_str().parse::<Topic>().unwrap(), topic);
		}
	}
}
