use serde::{Deserialize, Deserializer};

/// Tri-state PATCH field: a missing key leaves the column unchanged, an
/// explicit `null` clears it, a value sets it. Use with `#[serde(default)]`
/// so absent keys deserialize to `Missing`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum Patch<T> {
	#[default]
	Missing,
	Null,
	Set(T),
}

impl<T> Patch<T> {
	pub fn is_missing(&self) -> bool {
		matches!(self, Self::Missing)
	}

	/// `None` when the field was absent; `Some(None)` for an explicit clear.
	pub fn into_update(self) -> Option<Option<T>> {
		match self {
			Self::Missing => None,
			Self::Null => Some(None),
			Self::Set(value) => Some(Some(value)),
		}
	}

	pub fn as_ref(&self) -> Patch<&T> {
		match self {
			Self::Missing => Patch::Missing,
			Self::Null => Patch::Null,
			Self::Set(value) => Patch::Set(value),
		}
	}
}

impl<'de, T> Deserialize<'de> for Patch<T>
where
	T: Deserialize<'de>,
{
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		Option::<T>::deserialize(deserializer).map(|value| match value {
			Some(value) => Self::Set(value),
			None => Self::Null,
		})
	}
}

#[cfg(test)]
mod tests {
	use serde::Deserialize;
	use uuid::Uuid;

	use super::*;

	#[derive(Debug, Deserialize)]
	struct Body {
		#[serde(default)]
		project_id: Patch<Uuid>,
		#[serde(default)]
		content: Patch<String>,
	}

	#[test]
	fn missing_null_and_set_are_distinct() {
		let id = Uuid::new_v4();
		let body: Body = serde_json::from_str(&format!(r#"{{"project_id": "{id}"}}"#)).unwrap();

		assert_eq!(body.project_id, Patch::Set(id));
		assert_eq!(body.content, Patch::Missing);

		let body: Body = serde_json::from_str(r#"{"project_id": null}"#).unwrap();

		assert_eq!(body.project_id, Patch::Null);
	}

	#[test]
	fn into_update_maps_to_optional_column_writes() {
		assert_eq!(Patch::<i32>::Missing.into_update(), None);
		assert_eq!(Patch::<i32>::Null.into_update(), Some(None));
		assert_eq!(Patch::Set(7).into_update(), Some(Some(7)));
	}
}
