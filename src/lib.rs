//! Tollgate - API request admission and integrity checks
//!
//! This crate decides, per inbound API request, whether it fits a rate
//! budget, fits a usage quota, carries fresh and authentic headers, and is
//! not a replay of a previously seen signed request. Each check is an
//! independent component over in-memory state; [`gate::AdmissionGate`]
//! composes them for callers that want the usual pipeline.

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod gate;
pub mod headers;
pub mod quota;
pub mod ratelimit;
pub mod replay;
pub mod signing;

mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::GateConfig;
pub use error::{GateError, Violation, ViolationKind};
pub use events::{EventSink, MemorySink, TracingSink};
pub use gate::{Admission, AdmissionGate, AdmissionRequest, SignedPayload, Stage};
pub use headers::{HeaderLookup, HeaderValidation, HeaderValidator};
pub use quota::{QuotaDecision, QuotaEntry, QuotaManager};
pub use ratelimit::{
    Algorithm, KeyGenerator, LoggedRateLimiter, RateDecision, RateLimiter, RateLimiterBackend,
    RateWindowEntry,
};
pub use replay::{ReplayDecision, ReplayGuard, SignatureCache};
