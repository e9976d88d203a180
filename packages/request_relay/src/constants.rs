// A poisoned lock means a request handler panicked while the relay state was being updated.
// The queue and its flags can no longer be trusted, so we refuse to continue (we panic).
pub(crate) const ERR_POISONED_LOCK: &str = "encountered poisoned relay lock - a request \
    handler panicked and the relay queue can no longer be trusted to uphold its ordering \
    and wake-up guarantees";
