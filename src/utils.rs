//! Small shared helpers, re-exported through [`prelude`] the way the rest of
//! the crate expects to `use crate::utils::prelude::*;`.

pub mod prelude {
    pub use anyhow::Context as _;
    pub use anyhow::Result as AnyResult;
    pub use tracing::{debug, error, info, trace, warn};
}

/// Clamp a ratio-like computation into `[0.0, 1.0]`, guarding against a
/// zero-length denominator (e.g. a malformed event with `endTime == startTime`).
pub fn safe_ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator <= 0.0 {
        0.0
    } else {
        (numerator / denominator).clamp(0.0, 1.0)
    }
}
