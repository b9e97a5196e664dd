//! Reconnect backoff schedule, shared by every long-lived transport.

/// Reconnect delays, attempt 1 onward. The last entry repeats for every
/// later attempt.
pub const BACKOFF_SCHEDULE_SECS: [u64; 6] = [1, 2, 5, 10, 30, 60];

/// Delay in milliseconds before reconnect attempt `attempt` (1-based),
/// capped at `max_delay_ms`. Jitter is applied by the caller so this stays
/// table-exact for tests.
pub fn backoff_delay_ms(attempt: u32, max_delay_ms: u64) -> u64 {
    let idx = (attempt.saturating_sub(1) as usize).min(BACKOFF_SCHEDULE_SECS.len() - 1);
    (BACKOFF_SCHEDULE_SECS[idx] * 1000).min(max_delay_ms)
}
