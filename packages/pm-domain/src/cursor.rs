use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

/// Pagination cursor: a `(primary sort key, id)` tuple encoded as base64 of
/// a canonical JSON object. The id tiebreaker keeps rows with equal sort
/// keys from repeating or vanishing across pages.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
	pub k: serde_json::Value,
	pub id: Uuid,
}

impl Cursor {
	pub fn new(k: serde_json::Value, id: Uuid) -> Self {
		Self { k, id }
	}

	pub fn from_timestamp(ts: OffsetDateTime, id: Uuid) -> Result<Self, Error> {
		let formatted = ts.format(&Rfc3339).map_err(|_| Error::Unencodable)?;

		Ok(Self { k: serde_json::Value::String(formatted), id })
	}

	pub fn timestamp(&self) -> Result<OffsetDateTime, Error> {
		let raw = self.k.as_str().ok_or(Error::Malformed)?;

		OffsetDateTime::parse(raw, &Rfc3339).map_err(|_| Error::Malformed)
	}

	pub fn encode(&self) -> String {
		// Field order in the struct is the canonical order.
		let json = serde_json::to_vec(self).unwrap_or_default();

		URL_SAFE_NO_PAD.encode(json)
	}

	pub fn decode(raw: &str) -> Result<Self, Error> {
		let bytes = URL_SAFE_NO_PAD.decode(raw).map_err(|_| Error::Malformed)?;

		serde_json::from_slice(&bytes).map_err(|_| Error::Malformed)
	}
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Malformed pagination cursor.")]
	Malformed,
	#[error("Cursor key could not be encoded.")]
	Unencodable,
}

#[cfg(test)]
mod tests {
	use time::macros::datetime;

	use super::*;

	#[test]
	fn round_trips_through_base64() {
		let id = Uuid::new_v4();
		let cursor = Cursor::from_timestamp(datetime!(2026-02-06 15:45:00.123456 UTC), id)
			.expect("encodable timestamp");
		let decoded = Cursor::decode(&cursor.encode()).expect("decodable cursor");

		assert_eq!(decoded, cursor);
		assert_eq!(decoded.timestamp().unwrap(), datetime!(2026-02-06 15:45:00.123456 UTC));
	}

	#[test]
	fn rejects_garbage() {
		assert!(Cursor::decode("not-base64!!").is_err());
		assert!(Cursor::decode("aGVsbG8").is_err());
	}

	#[test]
	fn preserves_microsecond_precision() {
		let a = Cursor::from_timestamp(datetime!(2026-01-01 00:00:00.000001 UTC), Uuid::nil())
			.unwrap();
		let b = Cursor::from_timestamp(datetime!(2026-01-01 00:00:00.000002 UTC), Uuid::nil())
			.unwrap();

		assert_ne!(a.timestamp().unwrap(), b.timestamp().unwrap());
	}
}
