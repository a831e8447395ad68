//! Error taxonomy for the gateway.

mod admin;
mod failover;
mod gateway;

pub use admin::MixedChannelError;
pub use failover::{
    classify_status, is_prompt_too_long_body, FailoverErrorKind, PromptTooLongError,
    UpstreamFailoverError,
};
pub use gateway::{map_upstream_error, GatewayError};
