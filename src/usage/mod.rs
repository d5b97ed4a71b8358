pub mod extract;
pub mod pricing;

pub use extract::{USAGE_PARSER_VERSION, TokenUsage, UsageSource, UsageStatus, extract_usage};
pub use pricing::{PriceRow, PriceTable};
