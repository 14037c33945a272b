//! Webhook processing: per-path ordered queues, the handler contract, and the
//! circuit breaker handlers share.

pub mod circuit_breaker;
pub mod handler;
pub mod manager;
pub mod queue;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use handler::{
    run_handler, HandlerError, HandlerFactory, ProcessingOutcome, SkipReason, WebhookHandler,
};
pub use manager::{
    normalize_path, sync_raw_results, ManagerConfig, ManagerError, ProcessingContext, SyncCounts,
    WebhookProcessorManager,
};
pub use queue::LocalQueue;

pub const CRATE_NAME: &str = "catsync-webhook";
