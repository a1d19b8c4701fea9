//! Serde default values for the configuration surface.

pub(crate) fn max_tool_rounds_per_turn() -> u32 {
    8
}

pub(crate) fn dispatch_timeout_ms() -> u64 {
    30_000
}

pub(crate) fn retry_count() -> u32 {
    2
}

pub(crate) fn max_queue_depth() -> usize {
    32
}
