pub mod auth;
pub mod client;
pub mod response;
pub mod subs;
pub mod ws;

pub use auth::KisEnv;
pub use client::{CircuitBreaker, KisClient};
pub use response::ApiResponse;
pub use subs::SubscriptionManager;
pub use ws::{AskBidMessage, KisWsClient, TickMessage};
