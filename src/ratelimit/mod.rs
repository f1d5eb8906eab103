//! Rate limiting logic: policies, keys, decisions and the limiter itself.

mod clock;
mod decision;
mod key;
mod limiter;
mod observer;
mod policy;

pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{CheckOutcome, Decision};
pub use key::{
    CounterKey, KeyGenerator, RequestInfo, DEFAULT_ACTION, FORWARDED_FOR, REAL_IP, REMOTE_ADDR,
    UNKNOWN_CLIENT,
};
pub use limiter::RateLimiter;
pub use observer::{DecisionObserver, ViolationLogger, VIOLATION_TARGET};
pub use policy::{
    Classification, CustomKeyFn, KeyStrategy, PolicyOverride, PolicyRegistry, RateLimitPolicy,
    RouteClass,
};
