use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use uuid::Uuid;

use pm_storage::models::{ApiKey, User};

use crate::{Error, PmService, Result};

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
	pub id: Uuid,
	pub name: String,
	pub email: String,
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
}

impl From<User> for UserView {
	fn from(user: User) -> Self {
		Self { id: user.user_id, name: user.name, email: user.email, created_at: user.created_at }
	}
}

#[derive(Clone, Debug, Deserialize)]
pub struct CreateUserRequest {
	pub name: String,
	pub email: String,
	pub password: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateApiKeyRequest {
	pub user_id: Uuid,
	pub name: String,
}

/// The one response that ever carries the plaintext key. Only the hash is
/// stored.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyCreated {
	pub id: Uuid,
	pub user_id: Uuid,
	pub name: String,
	pub key: String,
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
}

/// Peppered SHA-256 over a secret, hex-encoded.
pub fn hash_secret(pepper: &str, secret: &str) -> String {
	let mut hasher = Sha256::new();

	hasher.update(pepper.as_bytes());
	hasher.update(secret.as_bytes());

	format!("{:x}", hasher.finalize())
}

impl PmService {
	pub async fn create_user(&self, req: CreateUserRequest) -> Result<UserView> {
		if req.name.trim().is_empty() || req.email.trim().is_empty() {
			return Err(Error::validation("name and email must be non-empty."));
		}
		if req.password.len() < 8 {
			return Err(Error::validation("password must be at least 8 characters."));
		}

		let password_hash = hash_secret(&self.cfg.auth.key_hash_pepper, &req.password);
		let user = sqlx::query_as::<_, User>(
			"INSERT INTO users (user_id, name, email, password_hash) VALUES ($1, $2, $3, $4) \
			 RETURNING user_id, name, email, password_hash, created_at, updated_at",
		)
		.bind(Uuid::new_v4())
		.bind(req.name.trim())
		.bind(req.email.trim().to_lowercase())
		.bind(password_hash)
		.fetch_one(&self.db.pool)
		.await?;

		Ok(user.into())
	}

	pub async fn list_users(&self) -> Result<Vec<UserView>> {
		let users = sqlx::query_as::<_, User>(
			"SELECT user_id, name, email, password_hash, created_at, updated_at FROM users \
			 ORDER BY name",
		)
		.fetch_all(&self.db.pool)
		.await?;

		Ok(users.into_iter().map(UserView::from).collect())
	}

	pub async fn create_api_key(&self, req: CreateApiKeyRequest) -> Result<ApiKeyCreated> {
		if req.name.trim().is_empty() {
			return Err(Error::validation("name must be non-empty."));
		}

		let plaintext = format!(
			"pm_{}{}",
			Uuid::new_v4().simple(),
			Uuid::new_v4().simple(),
		);
		let key_hash = hash_secret(&self.cfg.auth.key_hash_pepper, &plaintext);
		let key = sqlx::query_as::<_, ApiKey>(
			"INSERT INTO api_keys (api_key_id, user_id, name, key_hash) VALUES ($1, $2, $3, $4) \
			 RETURNING api_key_id, user_id, name, key_hash, last_used_at, revoked_at, created_at",
		)
		.bind(Uuid::new_v4())
		.bind(req.user_id)
		.bind(req.name.trim())
		.bind(key_hash)
		.fetch_one(&self.db.pool)
		.await?;

		Ok(ApiKeyCreated {
			id: key.api_key_id,
			user_id: key.user_id,
			name: key.name,
			key: plaintext,
			created_at: key.created_at,
		})
	}

	/// Bearer-token lookup for the HTTP surface. A hit touches
	/// `last_used_at`; revoked keys never match.
	pub async fn authenticate_api_key(&self, plaintext: &str) -> Result<Option<UserView>> {
		let key_hash = hash_secret(&self.cfg.auth.key_hash_pepper, plaintext);
		let user = sqlx::query_as::<_, User>(
			"UPDATE api_keys SET last_used_at = now() \
			 FROM users \
			 WHERE api_keys.key_hash = $1 AND api_keys.revoked_at IS NULL \
			 AND users.user_id = api_keys.user_id \
			 RETURNING users.user_id, users.name, users.email, users.password_hash, \
			 users.created_at, users.updated_at",
		)
		.bind(key_hash)
		.fetch_optional(&self.db.pool)
		.await?;

		Ok(user.map(UserView::from))
	}

	pub async fn revoke_api_key(&self, api_key_id: Uuid) -> Result<()> {
		let updated = sqlx::query(
			"UPDATE api_keys SET revoked_at = now() WHERE api_key_id = $1 AND revoked_at IS NULL",
		)
		.bind(api_key_id)
		.execute(&self.db.pool)
		.await?;

		if updated.rows_affected() == 0 {
			return Err(Error::not_found(format!(
				"API key {api_key_id} does not exist or is already revoked.",
			)));
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hashing_is_deterministic_and_peppered() {
		let a = hash_secret("pepper", "pm_abc");
		let b = hash_secret("pepper", "pm_abc");
		let c = hash_secret("other", "pm_abc");

		assert_eq!(a, b);
		assert_ne!(a, c);
		assert_eq!(a.len(), 64);
	}
}
