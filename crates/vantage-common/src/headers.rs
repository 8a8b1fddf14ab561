//! Header names shared by the node service and its peers.

pub const REQUEST_ID: &str = "x-request-id";
pub const LOG_LEVEL: &str = "x-log-level";
pub const TIMEOUT: &str = "x-timeout";
pub const DEADLINE: &str = "x-deadline";
pub const RETRY_AFTER: &str = "retry-after";
/// Non standard: the server tells the client there is no point in retrying.
pub const NO_RETRY: &str = "no-retry";
pub const WARNING: &str = "warning";
pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// Query parameters starting with this prefix override the header of the same name.
pub const HEADER_OVERWRITE_PREFIX: &str = "_";
