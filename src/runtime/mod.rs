//! Runtime for endpoints and sessions: a pool of worker threads running fibers, and a timer
//!  manager. The event loop that ties them to socket readiness lives in
//!  [crate::manager::ConnectionManager].

pub mod clock;
pub mod fiber;
pub mod scheduler;
pub mod timer;
pub mod handle;
