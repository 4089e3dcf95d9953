//! Avatar sync runtime
//!
//! Ties the codec and trait channel to a relay link:
//! 1. Configuration (JSON, human-readable durations) and validation
//! 2. Logging bootstrap
//! 3. The outbound avatar session (sequence numbers, trait send window, full updates)
//! 4. The receive dispatcher (trait batches, bulk avatar data, identity, kill)
//! 5. The relay-side encode fallback
//! 6. Runtime statistics

pub mod config;
pub mod dispatcher;
pub mod fallback;
pub mod logging;
pub mod session;
pub mod stats;

pub use config::*;
pub use dispatcher::*;
pub use fallback::*;
pub use logging::*;
pub use session::*;
pub use stats::*;
