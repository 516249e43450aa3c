//! Rate limiting logic and state management.

mod backend;
mod counter;
mod key;
mod limiter;
mod logged;

pub use backend::RateLimiterBackend;
pub use counter::{Algorithm, RateWindowEntry};
pub use key::KeyGenerator;
pub use limiter::{RateDecision, RateLimiter};
pub use logged::LoggedRateLimiter;
