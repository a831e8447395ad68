//! Shared domain models and error types for the relaypool gateway.
//!
//! This crate has no I/O: it defines the account/group data model, the
//! ephemeral load shapes, gateway configuration, and the error taxonomy
//! consumed by `relaypool-core` and the server binary.

pub mod error;
pub mod models;

pub use error::{
    FailoverErrorKind, GatewayError, MixedChannelError, PromptTooLongError, UpstreamFailoverError,
};
pub use models::account::{Account, AccountStatus, CredentialKind, Platform};
pub use models::config::{GatewayConfig, RunMode};
pub use models::group::{Group, SchedulePolicy};
pub use models::load::{AccountLoadInfo, ModelLoadInfo};
pub use models::rate_limit::QuotaScope;
