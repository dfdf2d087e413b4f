//! Cross-cutting utilities: OCPP-J framing, clocks, errors, retry schedules.

pub mod backoff;
pub mod clock;
pub mod errors;
pub mod frame;

pub use backoff::RetryPolicy;
pub use clock::{Clock, SimClock, SystemClock};
pub use errors::{CoreError, CoreResult};
pub use frame::{OcppFrame, OcppFrameError};
