use std::time::Duration;

/// Bounded resend policy for transient device conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Resends after the first attempt.
    pub retries: u32,
    pub backoff: Option<Duration>,
    /// Device status codes treated as busy rather than rejected.
    pub transient_codes: Vec<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff: None,
            transient_codes: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// Completion polling. `max_wait: None` polls until cancelled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_wait: Option<Duration>,
    pub interval: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub retry: RetryPolicy,
    pub poll: PollPolicy,
    /// How long to wait for a reply frame before reporting the device busy.
    pub response_timeout: Option<Duration>,
    /// Append and require CRC trailers on frames we send.
    pub crc: bool,
    /// Largest single write of bulk data.
    pub bulk_chunk: usize,
    /// Caller capacity for one raw result.
    pub max_result_len: usize,
    /// Consecutive window-accounting mismatches tolerated before failing.
    pub window_mismatch_limit: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            poll: PollPolicy::default(),
            response_timeout: Some(Duration::from_secs(5)),
            crc: false,
            bulk_chunk: 2 * 1024 * 1024,
            max_result_len: 1024 * 1024,
            window_mismatch_limit: 3,
        }
    }
}
