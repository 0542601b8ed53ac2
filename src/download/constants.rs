//! Constants for the download module (timeouts, backoff, file layout).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large files).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Maximum Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Maximum jitter added to backoff delays.
pub const MAX_JITTER: Duration = Duration::from_millis(500);

/// Suffix of in-flight transfer files in the incomplete directory.
pub const PART_SUFFIX: &str = ".part";

/// Bytes read from the head of an artifact for content sniffing.
pub const SNIFF_BYTES: usize = 1024;
