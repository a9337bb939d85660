//! Identity provider seam.
//!
//! Password verification is an external collaborator: the platform only
//! consumes a verify/update interface and layers sessions, lockout and
//! audit on top. The HTTP provider talks to the configured identity
//! service; the static provider backs tests and local development.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Deserialize;

use trustplane::crypto::constant_time_eq;

/// A successfully verified identity.
#[derive(Debug, Clone)]
pub struct VerifiedIdentity {
    pub user_id: String,
    pub email: String,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

/// The configured identity backend.
pub enum IdentityProvider {
    Http(HttpIdentityProvider),
    Static(StaticIdentityProvider),
}

impl IdentityProvider {
    pub async fn verify_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<VerifiedIdentity, IdentityError> {
        match self {
            IdentityProvider::Http(provider) => provider.verify_password(email, password).await,
            IdentityProvider::Static(provider) => provider.verify_password(email, password),
        }
    }

    pub async fn update_password(
        &self,
        user_id: &str,
        new_password: &str,
    ) -> Result<(), IdentityError> {
        match self {
            IdentityProvider::Http(provider) => provider.update_password(user_id, new_password).await,
            IdentityProvider::Static(provider) => provider.update_password(user_id, new_password),
        }
    }
}

#[derive(Deserialize)]
struct VerifyResponse {
    user_id: String,
    email: String,
}

/// Identity service client over HTTP.
pub struct HttpIdentityProvider {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpIdentityProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn verify_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<VerifiedIdentity, IdentityError> {
        let url = format!("{}/v1/password/verify", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(std::time::Duration::from_secs(5))
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await
            .map_err(|e| IdentityError::Unavailable(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                let verified: VerifyResponse = response
                    .json()
                    .await
                    .map_err(|e| IdentityError::Unavailable(e.to_string()))?;
                Ok(VerifiedIdentity {
                    user_id: verified.user_id,
                    email: verified.email,
                })
            }
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                Err(IdentityError::InvalidCredentials)
            }
            status => Err(IdentityError::Unavailable(format!(
                "identity service returned {status}"
            ))),
        }
    }

    async fn update_password(
        &self,
        user_id: &str,
        new_password: &str,
    ) -> Result<(), IdentityError> {
        let url = format!(
            "{}/v1/users/{user_id}/password",
            self.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.api_key)
            .timeout(std::time::Duration::from_secs(5))
            .json(&serde_json::json!({ "password": new_password }))
            .send()
            .await
            .map_err(|e| IdentityError::Unavailable(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(IdentityError::Unavailable(format!(
                "identity service returned {}",
                response.status()
            )))
        }
    }
}

struct StaticUser {
    user_id: String,
    password: String,
}

/// In-memory provider for tests and local development.
pub struct StaticIdentityProvider {
    users: Mutex<HashMap<String, StaticUser>>,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Register a user and return its id.
    pub fn add_user(&self, email: &str, password: &str) -> String {
        let user_id = uuid::Uuid::new_v4().to_string();
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        users.insert(
            email.to_string(),
            StaticUser {
                user_id: user_id.clone(),
                password: password.to_string(),
            },
        );
        user_id
    }

    fn verify_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<VerifiedIdentity, IdentityError> {
        let users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        let Some(user) = users.get(email) else {
            return Err(IdentityError::InvalidCredentials);
        };
        if !constant_time_eq(user.password.as_bytes(), password.as_bytes()) {
            return Err(IdentityError::InvalidCredentials);
        }
        Ok(VerifiedIdentity {
            user_id: user.user_id.clone(),
            email: email.to_string(),
        })
    }

    fn update_password(&self, user_id: &str, new_password: &str) -> Result<(), IdentityError> {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        for user in users.values_mut() {
            if user.user_id == user_id {
                user.password = new_password.to_string();
                return Ok(());
            }
        }
        Err(IdentityError::InvalidCredentials)
    }
}

impl Default for StaticIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}
