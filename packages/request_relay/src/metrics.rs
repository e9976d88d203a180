//! Metrics for the request relay.
//!
//! The framebuffer access counters are the per-frame statistics that emulator frontends display
//! alongside draw call counts. The remaining events describe relay activity itself.

use nm::{Event, Magnitude};

/// Histogram buckets for the number of requests executed by a single drain pass.
///
/// Most drain passes are triggered by one request; long batches mean the consumer is falling
/// behind the producer.
const DRAIN_BATCH_SIZE_BUCKETS: &[Magnitude] = &[0, 1, 2, 4, 8, 16, 32, 64, 128];

thread_local! {
    /// Counts framebuffer writes (color or depth pokes) executed by the relay.
    pub(crate) static EFB_POKES: Event = Event::builder()
        .name("request_relay_efb_pokes")
        .build();

    /// Counts framebuffer reads (color or depth peeks) executed by the relay.
    pub(crate) static EFB_PEEKS: Event = Event::builder()
        .name("request_relay_efb_peeks")
        .build();

    /// Counts requests that were dropped without execution, either because they were submitted
    /// to a disabled relay or because they were discarded when the relay was disabled.
    pub(crate) static REQUESTS_DROPPED: Event = Event::builder()
        .name("request_relay_requests_dropped")
        .build();

    /// Number of requests executed by one drain pass.
    pub(crate) static DRAIN_BATCH_SIZE: Event = Event::builder()
        .name("request_relay_drain_batch_size")
        .histogram(DRAIN_BATCH_SIZE_BUCKETS)
        .build();
}
