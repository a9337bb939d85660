//! Server configuration from environment variables.

use std::env;

use trustplane::{ConfigError, CoreConfig};

const DEFAULT_PORT: u16 = 4040;

/// How password verification is performed.
#[derive(Clone)]
pub enum IdentitySettings {
    /// External identity service.
    Http { base_url: String, api_key: String },
    /// In-process provider for development and tests. Never production.
    StaticDev,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub core: CoreConfig,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    /// Bearer token required for `/metrics` (None = endpoint refuses).
    pub metrics_token: Option<String>,
    pub identity: IdentitySettings,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("core", &self.core)
            .field("port", &self.port)
            .field("allowed_origins", &self.allowed_origins)
            .field(
                "metrics_token",
                &self.metrics_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field(
                "identity",
                &match self.identity {
                    IdentitySettings::Http { ref base_url, .. } => format!("http:{base_url}"),
                    IdentitySettings::StaticDev => "static-dev".to_string(),
                },
            )
            .finish()
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let core = CoreConfig::from_env()?;

        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let allowed_origins: Vec<String> = env::var("ALLOWED_ORIGINS")
            .map(|s| {
                s.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let metrics_token = env::var("METRICS_TOKEN").ok().filter(|t| !t.is_empty());
        if metrics_token.is_none() {
            tracing::warn!("METRICS_TOKEN not set — /metrics will refuse all requests");
        }

        let static_identity = env::var("DEV_STATIC_IDENTITY")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let identity = if static_identity {
            tracing::warn!("DEV_STATIC_IDENTITY=true — using the in-process identity provider. DO NOT use this in production!");
            IdentitySettings::StaticDev
        } else {
            let base_url =
                env::var("IDENTITY_URL").map_err(|_| ConfigError::MissingRequired("IDENTITY_URL"))?;
            url::Url::parse(&base_url)
                .map_err(|e| ConfigError::Invalid("IDENTITY_URL", e.to_string()))?;
            let api_key = env::var("IDENTITY_API_KEY")
                .map_err(|_| ConfigError::MissingRequired("IDENTITY_API_KEY"))?;
            IdentitySettings::Http { base_url, api_key }
        };

        Ok(Self {
            core,
            port,
            allowed_origins,
            metrics_token,
            identity,
        })
    }

    /// In-memory store, static identity, fixed secrets. For tests.
    pub fn for_tests() -> Self {
        let mut core = CoreConfig::for_tests();
        core.store.path = ":memory:".to_string();
        Self {
            core,
            port: 0,
            allowed_origins: vec![],
            metrics_token: None,
            identity: IdentitySettings::StaticDev,
        }
    }
}
