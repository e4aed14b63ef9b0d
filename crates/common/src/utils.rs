//! Small helpers shared by the dispatcher crates

use std::future::Future;
use std::time::Duration;

use bytesize::ByteSize;
use tokio::time::timeout;

use crate::error::{Error, Result};

/// Renders a byte count with binary units, e.g. `"1.0 GiB"`
pub fn format_bytes(bytes: u64) -> String {
    ByteSize(bytes).to_string_as(true)
}

/// Awaits `future` for at most `limit`.
///
/// Expiry becomes [`Error::Timeout`] naming `operation`; the future is
/// dropped.
pub async fn execute_with_timeout<T, F>(future: F, limit: Duration, operation: &str) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    timeout(limit, future)
        .await
        .unwrap_or_else(|_| Err(Error::Timeout(format!("{} exceeded {:?}", operation, limit))))
}

/// Clamps a fraction into [0, 1], mapping NaN to 0
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}
