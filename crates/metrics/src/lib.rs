//! Metric names for the wecom bot.
//!
//! Recording goes through the `metrics` facade; the process embedding the
//! bot decides whether and how to export.
//!
//! ```rust,ignore
//! use wecom_metrics::{counter, wecom};
//!
//! counter!(wecom::DELIVERIES_TOTAL, "tier" => "stream").increment(1);
//! ```

mod definitions;

pub use definitions::*;

pub use metrics::{counter, gauge, histogram};
