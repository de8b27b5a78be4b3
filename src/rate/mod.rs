pub mod bucket;
pub mod budget;
pub mod shared;

pub use bucket::{PriorityTokenBucket, PriorityWindows, TokenBucket};
pub use budget::{EndpointClass, RateBudget};
pub use shared::SharedRateBudget;
