//! Human-readable window lengths such as `"10 s"`, `"500ms"` or `"1 d"`.

use std::time::Duration;

use crate::error::{RatewardenError, Result};

/// Parse a duration string, e.g. `"10 s"`, `"1m 30s"` or `"2h"`.
pub fn parse(input: &str) -> Result<Duration> {
    humantime::parse_duration(input.trim()).map_err(|e| {
        RatewardenError::Config(format!(
            "invalid duration {:?} ({}), expected e.g. \"10 s\" or \"500ms\"",
            input, e
        ))
    })
}
