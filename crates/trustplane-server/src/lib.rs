//! HTTP service for the trustplane security core.
//!
//! Every request runs through the fixed pipeline: rate limit →
//! authentication → team scope → idempotency → handler → audit → response
//! envelope. Handlers receive the dependency container ([`AppState`]) built
//! once at startup.
//!
//! # Modules
//!
//! - [`auth`] — authentication service (login, logout, refresh, password)
//! - [`config`] — server configuration ([`ServerConfig`])
//! - [`error`] — error envelope ([`error::ApiError`], [`error::ErrorCode`])
//! - [`identity`] — identity provider seam (HTTP and static backends)
//! - [`middleware`] — request pipeline guards and [`middleware::RequestContext`]
//! - [`metrics`] — Prometheus metrics
//! - [`routes`] — HTTP endpoints
//! - [`state`] — shared application state ([`AppState`])

pub mod auth;
pub mod config;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::ServerConfig;
pub use state::AppState;
