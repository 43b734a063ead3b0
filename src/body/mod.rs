//! Message body pipelines: inbound interpretation for inline display and
//! outbound transformation for composition.

pub mod format;
pub mod outbound;
pub mod processor;
pub mod quote;

pub use processor::{ATTRIBUTION_MARKERS, MessageBodyProcessor};
