//! Per-request dispatch: parsing, warmup interception, session-id
//! rewriting, cache-billing simulation, and the orchestrator loop.

mod cache_billing;
mod orchestrator;
mod request;
mod session_id;
mod warmup;

pub use cache_billing::{
    estimate_input_tokens_after_last_cache_breakpoint, estimate_tokens_for_text,
    force_cache_read_billing, split_usage_for_cache_billing,
};
pub use orchestrator::{DispatchBody, DispatchResponse, Dispatcher, DispatcherConfig};
pub use request::ParsedRequest;
pub use session_id::{derive_session_id, replace_session_id_for_oauth};
pub use warmup::{is_warmup_request, warmup_response};
