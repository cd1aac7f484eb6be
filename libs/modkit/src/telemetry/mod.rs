//! Throttled-logging helper shared by the reload and health loops.

mod throttled_log;

pub use throttled_log::ThrottledLog;
