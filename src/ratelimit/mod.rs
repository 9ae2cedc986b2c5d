//! Rate limiting logic and state management.

mod key;
mod limiter;
mod memory;
mod policy;
mod store;
mod window;

pub use key::LimitKey;
pub use limiter::{LimitStatus, RateLimiter};
pub use memory::MemoryCounterStore;
pub use policy::{Admission, FailurePolicy};
pub use store::CounterStore;
pub use window::Window;
