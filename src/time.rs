//! Single source of truth for wall-clock seconds.
//!
//! Every module that needs "now" as a unix timestamp goes through this
//! function rather than calling `SystemTime::now()` directly, so there is
//! one place to swap in a mockable clock if tests ever need it.

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
