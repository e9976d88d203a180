//! The request relay and its configuration.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::metrics::{DRAIN_BATCH_SIZE, REQUESTS_DROPPED};
use crate::{Backend, ERR_POISONED_LOCK, Request};

/// A queued request, tagged with the sequence number it was queued under.
///
/// The sequence number lets `drain()` tell whether the front of the queue is still the request
/// it just executed, which is not the case if the queue was cleared while the handler ran.
#[derive(Debug)]
struct QueuedRequest {
    sequence: u64,
    request: Request,
}

#[derive(Debug)]
struct RelayState {
    queue: VecDeque<QueuedRequest>,
    next_sequence: u64,

    enabled: bool,
    passthrough: bool,

    // Coalesced wake-up flag: at least one thread is waiting for the queue to become empty
    // since the last time waiters were notified.
    pending_wake: bool,
}

impl RelayState {
    fn new(enabled: bool, passthrough: bool) -> Self {
        Self {
            queue: VecDeque::new(),
            next_sequence: 0,
            enabled,
            passthrough,
            pending_wake: false,
        }
    }

    fn push(&mut self, request: Request) {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        self.queue.push_back(QueuedRequest { sequence, request });
    }
}

/// Relays requests from producer threads to the consumer thread that owns the emulated
/// graphics processor.
///
/// Producers call [`submit()`][Self::submit] to queue a [`Request`], optionally blocking until
/// it has been executed. The consumer-side driver calls [`drain()`][Self::drain] (or
/// [`drain_if_pending()`][Self::drain_if_pending]) on the consumer thread whenever the
/// [`Backend`] signals it via [`Backend::wake_consumer()`], which executes every queued request
/// in submission order.
///
/// There is meant to be one relay per emulated system. Share it between the producer and the
/// consumer by reference or by wrapping it in an [`Arc`][std::sync::Arc].
///
/// # Modes
///
/// * **Enabled** (default): requests are queued and executed by `drain()`.
/// * **Disabled**: requests are silently dropped and blocking submits return immediately. Used
///   while the consumer is not running, e.g. during startup and shutdown.
/// * **Passthrough**: requests are executed immediately on the submitting thread, which must
///   itself have exclusive use of the backend (e.g. when producer and consumer run on the
///   same thread). Takes priority over the enabled flag.
///
/// # Delivery guarantees
///
/// Returning from `submit()` never means that a request was executed, only that it is no
/// longer queued. A request is dropped without execution if it is submitted while the relay is
/// disabled or if the relay is disabled before the request is drained. A blocking submitter
/// waiting for such a request is released, and any [`OutputSlot`][crate::OutputSlot] the
/// request carries stays empty. Callers that need the output must check whether it was
/// populated.
///
/// # Example
///
/// ```rust
/// use request_relay::{Backend, OutputSlot, Request, RequestRelay, SwapRequest};
///
/// struct NullBackend;
///
/// impl Backend for NullBackend {
///     fn poke_color(&self, _x: u16, _y: u16, _value: u32) {}
///     fn poke_depth(&self, _x: u16, _y: u16, _value: u32) {}
///     fn peek_color(&self, x: u16, y: u16) -> u32 {
///         u32::from(x) + u32::from(y)
///     }
///     fn peek_depth(&self, _x: u16, _y: u16) -> u32 {
///         0
///     }
///     fn present(&self, _swap: &SwapRequest) {}
///     fn read_bbox(&self, _index: usize) -> u32 {
///         0
///     }
///     fn reset_command_buffer(&self) {}
///     fn flush_perf_queries(&self) {}
///     fn save_state(&self, _buffer: &mut Vec<u8>) {}
///     fn flush_pending_work(&self) {}
///     fn wake_consumer(&self) {}
/// }
///
/// let relay = RequestRelay::new(NullBackend);
/// let color = OutputSlot::new();
///
/// relay.submit(
///     Request::EfbPeekColor {
///         x: 3,
///         y: 4,
///         output: color.clone(),
///     },
///     false,
/// );
///
/// // Normally called on the consumer thread after `wake_consumer()`.
/// relay.drain();
///
/// assert_eq!(color.get(), Some(7));
/// ```
pub struct RequestRelay<B>
where
    B: Backend,
{
    backend: B,

    state: Mutex<RelayState>,

    // Signaled when the queue becomes empty and `pending_wake` was set.
    queue_emptied: Condvar,

    // Observer hint read without the lock: `true` means no request has been submitted since
    // the start of the last drain pass. Cleared on submit, set at the start of a drain pass.
    idle: AtomicBool,
}

impl<B> RequestRelay<B>
where
    B: Backend,
{
    /// Creates an enabled relay in queued (non-passthrough) mode.
    ///
    /// Use [`RequestRelay::builder()`] for custom configuration.
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self::builder(backend).build()
    }

    /// Creates a builder for configuring a relay that executes requests against `backend`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use request_relay::{Backend, Request, RequestRelay, SwapRequest};
    ///
    /// struct InlineBackend;
    ///
    /// impl Backend for InlineBackend {
    ///     fn poke_color(&self, _x: u16, _y: u16, _value: u32) {}
    ///     fn poke_depth(&self, _x: u16, _y: u16, _value: u32) {}
    ///     fn peek_color(&self, _x: u16, _y: u16) -> u32 {
    ///         0
    ///     }
    ///     fn peek_depth(&self, _x: u16, _y: u16) -> u32 {
    ///         0
    ///     }
    ///     fn present(&self, _swap: &SwapRequest) {}
    ///     fn read_bbox(&self, _index: usize) -> u32 {
    ///         0
    ///     }
    ///     fn reset_command_buffer(&self) {}
    ///     fn flush_perf_queries(&self) {}
    ///     fn save_state(&self, _buffer: &mut Vec<u8>) {}
    ///     fn flush_pending_work(&self) {}
    ///     fn wake_consumer(&self) {}
    /// }
    ///
    /// // Producer and consumer share a thread, so requests run immediately.
    /// let relay = RequestRelay::builder(InlineBackend)
    ///     .passthrough(true)
    ///     .build();
    ///
    /// relay.submit(Request::FifoReset, true);
    /// assert!(relay.is_passthrough());
    /// assert_eq!(relay.pending_requests(), 0);
    /// ```
    #[must_use]
    pub fn builder(backend: B) -> RelayBuilder<B> {
        RelayBuilder::new(backend)
    }

    /// Submits a request for execution on the consumer thread.
    ///
    /// If `blocking` is `true`, the call does not return until the queue has been drained, i.e.
    /// until this request and every request submitted before it have been executed, or until
    /// the relay has been disabled.
    ///
    /// In passthrough mode the request is executed on the calling thread before this method
    /// returns, regardless of `blocking` and of the enabled flag.
    ///
    /// If the relay is disabled (and not in passthrough mode), the request is dropped and the
    /// call returns immediately even if `blocking` is `true`. See the
    /// [type-level documentation][Self] for what this means for delivery guarantees.
    ///
    /// # Deadlocks
    ///
    /// A blocking submit from the consumer thread (or from a handler running in passthrough mode)
    /// deadlocks, because nobody else is going to drain the queue.
    pub fn submit(&self, request: Request, blocking: bool) {
        let mut state = self.lock_state();

        if state.passthrough {
            trace!(kind = request.kind(), "executing request in passthrough mode");

            // The lock stays held while the handler runs; passthrough handlers must not call
            // back into the relay.
            request.execute(&self.backend);
            return;
        }

        self.idle.store(false, Ordering::Release);
        state.pending_wake |= blocking;

        if !state.enabled {
            debug!(
                kind = request.kind(),
                blocking, "dropping request submitted to disabled relay"
            );
            REQUESTS_DROPPED.with(|e| e.observe_once());
            return;
        }

        state.push(request);
        self.backend.wake_consumer();

        if blocking {
            drop(self.wait_until_empty(state));
        }
    }

    /// Executes every queued request on the calling thread, in submission order.
    ///
    /// Must only be called on the consumer thread. Requests submitted while the drain pass is in
    /// progress are executed by the same pass. Once the queue is empty, every thread blocked in
    /// [`submit()`][Self::submit] or [`wait_for_empty_queue()`][Self::wait_for_empty_queue] is
    /// released.
    ///
    /// Calling this on an empty queue does not touch the backend. It only resets the
    /// [`has_pending_requests()`][Self::has_pending_requests] hint.
    pub fn drain(&self) {
        let state = self.lock_state();

        if state.queue.is_empty() {
            self.idle.store(true, Ordering::Release);
            return;
        }

        drop(state);

        // Requests must observe everything the consumer has been asked to do before them.
        self.backend.flush_pending_work();

        let mut state = self.lock_state();
        self.idle.store(true, Ordering::Release);

        let mut executed: usize = 0;

        while let Some(front) = state.queue.front() {
            let sequence = front.sequence;
            let request = front.request.clone();

            drop(state);
            request.execute(&self.backend);
            state = self.lock_state();

            // If the relay was disabled while the handler ran, the queue was cleared and may
            // even have been refilled after re-enabling. Only remove what we executed.
            if state
                .queue
                .front()
                .is_some_and(|front| front.sequence == sequence)
            {
                state.queue.pop_front();
            }

            executed = executed.saturating_add(1);
        }

        if state.pending_wake {
            state.pending_wake = false;
            self.queue_emptied.notify_all();
        }

        drop(state);

        if executed > 0 {
            trace!(executed, "drained request queue");
            DRAIN_BATCH_SIZE.with(|e| e.observe(executed));
        }
    }

    /// Drains the queue if any request may have been submitted since the last drain pass.
    ///
    /// This is a cheap check suitable for calling on every iteration of the consumer's main
    /// loop: it does not take the relay lock when there is nothing to do.
    pub fn drain_if_pending(&self) {
        if self.has_pending_requests() {
            self.drain();
        }
    }

    /// Whether a request may have been submitted since the last drain pass started.
    ///
    /// This is a hint read without taking the relay lock. It may report `true` for requests that
    /// were dropped because the relay was disabled; the next drain pass resets it.
    #[must_use]
    pub fn has_pending_requests(&self) -> bool {
        !self.idle.load(Ordering::Acquire)
    }

    /// Number of requests currently queued.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.lock_state().queue.len()
    }

    /// Blocks the calling thread until the queue is empty, without submitting anything.
    ///
    /// Returns immediately if the queue is already empty. Like a blocking
    /// [`submit()`][Self::submit], this must not be called from the consumer thread.
    pub fn wait_for_empty_queue(&self) {
        let mut state = self.lock_state();

        if state.queue.is_empty() {
            return;
        }

        // The drain pass only notifies if someone asked for it.
        state.pending_wake = true;

        drop(self.wait_until_empty(state));
    }

    /// Enables or disables the relay.
    ///
    /// Disabling the relay discards every queued request without executing it and releases all
    /// threads blocked waiting for the queue to empty. While disabled, submitted requests are
    /// dropped. Re-enabling the relay restores normal queueing for subsequent submits.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.lock_state();

        if state.enabled != enabled {
            debug!(enabled, "request relay enabled state changed");
        }

        state.enabled = enabled;

        if !enabled {
            let discarded = state.queue.len();
            state.queue.clear();

            if discarded > 0 {
                debug!(discarded, "discarded queued requests on disable");
                REQUESTS_DROPPED.with(|e| e.batch(discarded).observe_once());
            }

            if state.pending_wake {
                state.pending_wake = false;
                self.queue_emptied.notify_all();
            }
        }
    }

    /// Enables or disables passthrough mode.
    ///
    /// Takes effect for the next [`submit()`][Self::submit]. Requests already queued stay
    /// queued and are executed by the next drain pass.
    pub fn set_passthrough(&self, passthrough: bool) {
        let mut state = self.lock_state();

        if state.passthrough != passthrough {
            debug!(passthrough, "request relay passthrough mode changed");
        }

        state.passthrough = passthrough;
    }

    /// Whether the relay currently accepts requests into its queue.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.lock_state().enabled
    }

    /// Whether requests are currently executed on the submitting thread.
    #[must_use]
    pub fn is_passthrough(&self) -> bool {
        self.lock_state().passthrough
    }

    /// The backend that requests are executed against.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn lock_state(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().expect(ERR_POISONED_LOCK)
    }

    fn wait_until_empty<'a>(
        &'a self,
        state: MutexGuard<'a, RelayState>,
    ) -> MutexGuard<'a, RelayState> {
        self.queue_emptied
            .wait_while(state, |state| !state.queue.is_empty())
            .expect(ERR_POISONED_LOCK)
    }
}

impl<B> fmt::Debug for RequestRelay<B>
where
    B: Backend,
{
    #[cfg_attr(test, mutants::skip)] // No API contract for debug output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();

        f.debug_struct("RequestRelay")
            .field("queued", &state.queue.len())
            .field("enabled", &state.enabled)
            .field("passthrough", &state.passthrough)
            .field("pending_wake", &state.pending_wake)
            .finish_non_exhaustive()
    }
}

/// Builder for configuring a [`RequestRelay`].
///
/// Created by [`RequestRelay::builder()`].
pub struct RelayBuilder<B>
where
    B: Backend,
{
    backend: B,
    enabled: bool,
    passthrough: bool,
}

impl<B> RelayBuilder<B>
where
    B: Backend,
{
    fn new(backend: B) -> Self {
        Self {
            backend,
            enabled: true,
            passthrough: false,
        }
    }

    /// Sets whether the relay starts out accepting requests.
    ///
    /// Default is `true`.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets whether the relay starts out in passthrough mode.
    ///
    /// Default is `false`.
    #[must_use]
    pub fn passthrough(mut self, passthrough: bool) -> Self {
        self.passthrough = passthrough;
        self
    }

    /// Builds the relay with the configured settings.
    #[must_use]
    pub fn build(self) -> RequestRelay<B> {
        RequestRelay {
            backend: self.backend,
            state: Mutex::new(RelayState::new(self.enabled, self.passthrough)),
            queue_emptied: Condvar::new(),
            idle: AtomicBool::new(true),
        }
    }
}

impl<B> fmt::Debug for RelayBuilder<B>
where
    B: Backend,
{
    #[cfg_attr(test, mutants::skip)] // No API contract for debug output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayBuilder")
            .field("enabled", &self.enabled)
            .field("passthrough", &self.passthrough)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, OnceLock};
    use std::thread;
    use std::time::Duration;

    use mockall::Sequence;
    use static_assertions::assert_impl_all;
    use testing::{wait_for, with_watchdog};

    use super::*;
    use crate::{MockBackend, OutputSlot, StateBuffer, SwapRequest};

    assert_impl_all!(RequestRelay<MockBackend>: Send, Sync);

    fn poke(value: u32) -> Request {
        Request::EfbPokeColor { x: 0, y: 0, value }
    }

    fn swap() -> Request {
        Request::Swap(SwapRequest {
            xfb_addr: 0x0040_0000,
            fb_width: 640,
            fb_stride: 640,
            fb_height: 528,
            ticks: 42,
            presentation_time: Duration::ZERO,
        })
    }

    /// A backend that expects any number of wake-ups and flushes but no handler calls.
    fn idle_backend() -> MockBackend {
        let mut backend = MockBackend::new();
        backend.expect_wake_consumer().return_const(());
        backend.expect_flush_pending_work().return_const(());
        backend
    }

    #[test]
    fn defaults_are_enabled_and_queued() {
        let relay = RequestRelay::new(MockBackend::new());

        assert!(relay.is_enabled());
        assert!(!relay.is_passthrough());
        assert_eq!(relay.pending_requests(), 0);
        assert!(!relay.has_pending_requests());
    }

    #[test]
    fn builder_applies_configuration() {
        let relay = RequestRelay::builder(MockBackend::new())
            .enabled(false)
            .passthrough(true)
            .build();

        assert!(!relay.is_enabled());
        assert!(relay.is_passthrough());
    }

    #[test]
    fn non_blocking_submit_queues_and_wakes_consumer() {
        let mut backend = MockBackend::new();
        backend.expect_wake_consumer().once().return_const(());

        let relay = RequestRelay::new(backend);
        relay.submit(poke(1), false);

        assert_eq!(relay.pending_requests(), 1);
        assert!(relay.has_pending_requests());
    }

    #[test]
    fn drain_executes_in_submission_order() {
        let mut seq = Sequence::new();
        let mut backend = idle_backend();

        for value in [1, 2, 3] {
            backend
                .expect_poke_color()
                .withf(move |_, _, v| *v == value)
                .once()
                .in_sequence(&mut seq)
                .return_const(());
        }

        let relay = RequestRelay::new(backend);

        relay.submit(poke(1), false);
        relay.submit(poke(2), false);
        relay.submit(poke(3), false);

        relay.drain();

        assert_eq!(relay.pending_requests(), 0);
        assert!(!relay.has_pending_requests());
    }

    #[test]
    fn drain_flushes_pending_work_before_handlers() {
        let mut seq = Sequence::new();
        let mut backend = MockBackend::new();
        backend.expect_wake_consumer().return_const(());
        backend
            .expect_flush_pending_work()
            .once()
            .in_sequence(&mut seq)
            .return_const(());
        backend
            .expect_reset_command_buffer()
            .once()
            .in_sequence(&mut seq)
            .return_const(());

        let relay = RequestRelay::new(backend);
        relay.submit(Request::FifoReset, false);
        relay.drain();
    }

    #[test]
    fn drain_on_empty_queue_is_no_op() {
        // No expectations at all: touching the backend would panic.
        let relay = RequestRelay::new(MockBackend::new());

        relay.drain();
        relay.drain();

        assert_eq!(relay.pending_requests(), 0);
    }

    #[test]
    fn drain_after_dropped_submit_only_resets_hint() {
        // No expectations at all: touching the backend would panic.
        let relay = RequestRelay::builder(MockBackend::new())
            .enabled(false)
            .build();

        relay.submit(Request::FifoReset, false);
        assert!(relay.has_pending_requests());

        relay.drain();

        assert!(!relay.has_pending_requests());
        assert_eq!(relay.pending_requests(), 0);
    }

    #[test]
    fn drain_if_pending_skips_idle_relay() {
        // No expectations at all: touching the backend would panic.
        let relay = RequestRelay::new(MockBackend::new());

        relay.drain_if_pending();
    }

    #[test]
    fn drain_if_pending_drains_after_submit() {
        let mut backend = idle_backend();
        backend
            .expect_flush_perf_queries()
            .once()
            .return_const(());

        let relay = RequestRelay::new(backend);
        relay.submit(Request::PerfQueryFlush, false);

        relay.drain_if_pending();

        assert_eq!(relay.pending_requests(), 0);
        assert!(!relay.has_pending_requests());
    }

    #[test]
    fn passthrough_executes_on_calling_thread() {
        let mut backend = MockBackend::new();
        backend
            .expect_peek_color()
            .withf(|x, y| *x == 3 && *y == 4)
            .once()
            .return_const(0xDEAD_BEEF_u32);

        let relay = RequestRelay::builder(backend).passthrough(true).build();
        let output = OutputSlot::new();

        relay.submit(
            Request::EfbPeekColor {
                x: 3,
                y: 4,
                output: output.clone(),
            },
            false,
        );

        assert_eq!(output.get(), Some(0xDEAD_BEEF));
        assert_eq!(relay.pending_requests(), 0);
        assert!(!relay.has_pending_requests());
    }

    #[test]
    fn passthrough_ignores_disabled_flag() {
        let mut backend = MockBackend::new();
        backend
            .expect_reset_command_buffer()
            .once()
            .return_const(());

        let relay = RequestRelay::builder(backend)
            .enabled(false)
            .passthrough(true)
            .build();

        relay.submit(Request::FifoReset, true);
    }

    #[test]
    fn set_passthrough_takes_effect_on_next_submit() {
        let mut backend = idle_backend();
        backend.expect_poke_color().times(2).return_const(());

        let relay = RequestRelay::new(backend);

        relay.submit(poke(1), false);
        relay.set_passthrough(true);
        relay.submit(poke(2), false);

        // The first request is still queued; only the second ran immediately.
        assert_eq!(relay.pending_requests(), 1);

        relay.drain();
        assert_eq!(relay.pending_requests(), 0);
    }

    #[test]
    fn disabled_relay_drops_requests() {
        // No handler expectations: executing anything would panic.
        let relay = RequestRelay::builder(MockBackend::new())
            .enabled(false)
            .build();

        relay.submit(poke(1), false);

        assert_eq!(relay.pending_requests(), 0);
        assert!(relay.has_pending_requests());
    }

    #[test]
    fn disabled_relay_does_not_block_blocking_submit() {
        let relay = RequestRelay::builder(MockBackend::new())
            .enabled(false)
            .build();
        let output = OutputSlot::new();

        relay.submit(
            Request::BboxRead {
                index: 0,
                output: output.clone(),
            },
            true,
        );

        assert_eq!(output.get(), None);
    }

    #[test]
    fn disable_discards_queued_requests() {
        let relay = RequestRelay::new(idle_backend());

        relay.submit(poke(1), false);
        relay.submit(poke(2), false);
        relay.set_enabled(false);

        assert_eq!(relay.pending_requests(), 0);
        assert!(!relay.is_enabled());

        // Nothing left to execute; the mock would panic on a poke.
        relay.drain();
    }

    #[test]
    fn re_enable_resumes_queueing() {
        let mut backend = idle_backend();
        backend
            .expect_poke_color()
            .withf(|_, _, v| *v == 2)
            .once()
            .return_const(());

        let relay = RequestRelay::new(backend);

        relay.submit(poke(1), false);
        relay.set_enabled(false);
        relay.set_enabled(true);
        relay.submit(poke(2), false);

        assert_eq!(relay.pending_requests(), 1);
        relay.drain();
        assert_eq!(relay.pending_requests(), 0);
    }

    #[test]
    fn wait_for_empty_queue_returns_immediately_when_empty() {
        let relay = RequestRelay::new(MockBackend::new());

        relay.wait_for_empty_queue();
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn blocking_peek_returns_value_after_drain() {
        with_watchdog(|| {
            let mut backend = idle_backend();
            backend
                .expect_peek_color()
                .withf(|x, y| *x == 3 && *y == 4)
                .once()
                .return_const(0x00C0_FFEE_u32);

            let relay = Arc::new(RequestRelay::new(backend));
            let output = OutputSlot::new();

            let producer = thread::spawn({
                let relay = Arc::clone(&relay);
                let output = output.clone();

                move || {
                    relay.submit(
                        Request::EfbPeekColor {
                            x: 3,
                            y: 4,
                            output: output.clone(),
                        },
                        true,
                    );

                    output.get()
                }
            });

            wait_for(|| relay.pending_requests() == 1);
            relay.drain();

            assert_eq!(producer.join().unwrap(), Some(0x00C0_FFEE));
            assert_eq!(output.get(), Some(0x00C0_FFEE));
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn blocking_swap_waits_for_earlier_pokes() {
        with_watchdog(|| {
            let mut seq = Sequence::new();
            let mut backend = idle_backend();
            backend
                .expect_poke_color()
                .times(3)
                .in_sequence(&mut seq)
                .return_const(());
            backend
                .expect_present()
                .once()
                .in_sequence(&mut seq)
                .return_const(());

            let relay = Arc::new(RequestRelay::new(backend));
            let returned = Arc::new(AtomicBool::new(false));

            let producer = thread::spawn({
                let relay = Arc::clone(&relay);
                let returned = Arc::clone(&returned);

                move || {
                    relay.submit(poke(1), false);
                    relay.submit(poke(2), false);
                    relay.submit(poke(3), false);
                    relay.submit(swap(), true);
                    returned.store(true, Ordering::Release);
                }
            });

            wait_for(|| relay.pending_requests() == 4);
            assert!(!returned.load(Ordering::Acquire));

            relay.drain();
            producer.join().unwrap();

            assert!(returned.load(Ordering::Acquire));
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn disable_releases_blocked_submitter_without_output() {
        with_watchdog(|| {
            let relay = Arc::new(RequestRelay::new(idle_backend()));
            let output = OutputSlot::new();

            let producer = thread::spawn({
                let relay = Arc::clone(&relay);
                let output = output.clone();

                move || {
                    relay.submit(
                        Request::EfbPeekDepth {
                            x: 1,
                            y: 1,
                            output: output.clone(),
                        },
                        true,
                    );

                    output.get()
                }
            });

            wait_for(|| relay.pending_requests() == 1);
            relay.set_enabled(false);

            assert_eq!(producer.join().unwrap(), None);
            assert_eq!(output.get(), None);
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn wait_for_empty_queue_is_released_by_drain() {
        with_watchdog(|| {
            let mut backend = idle_backend();
            backend.expect_poke_color().once().return_const(());

            let relay = Arc::new(RequestRelay::new(backend));
            relay.submit(poke(1), false);

            let waiter = thread::spawn({
                let relay = Arc::clone(&relay);
                move || relay.wait_for_empty_queue()
            });

            // Give the waiter a chance to actually start waiting. The test passes either way.
            thread::sleep(Duration::from_millis(10));

            relay.drain();
            waiter.join().unwrap();

            assert_eq!(relay.pending_requests(), 0);
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn all_blocked_submitters_are_released() {
        const SUBMITTERS: usize = 4;

        with_watchdog(|| {
            let mut backend = idle_backend();
            backend
                .expect_flush_perf_queries()
                .times(SUBMITTERS)
                .return_const(());

            let relay = Arc::new(RequestRelay::new(backend));
            let released = Arc::new(AtomicUsize::new(0));

            let submitters = (0..SUBMITTERS)
                .map(|_| {
                    let relay = Arc::clone(&relay);
                    let released = Arc::clone(&released);

                    thread::spawn(move || {
                        relay.submit(Request::PerfQueryFlush, true);
                        released.fetch_add(1, Ordering::Relaxed);
                    })
                })
                .collect::<Vec<_>>();

            wait_for(|| relay.pending_requests() == SUBMITTERS);
            relay.drain();

            for submitter in submitters {
                submitter.join().unwrap();
            }

            assert_eq!(released.load(Ordering::Relaxed), SUBMITTERS);
        });
    }

    #[test]
    fn disable_during_handler_does_not_drop_later_request() {
        // The handler of the first request disables and re-enables the relay and queues a new
        // request. The drain pass must not mistake the new request for the one it just ran.
        let relay = Arc::new(OnceLock::<Arc<RequestRelay<MockBackend>>>::new());

        let mut backend = idle_backend();
        let mut seq = Sequence::new();

        backend
            .expect_save_state()
            .once()
            .in_sequence(&mut seq)
            .returning({
                let relay = Arc::clone(&relay);
                move |_| {
                    let relay = relay.get().unwrap();
                    relay.set_enabled(false);
                    relay.set_enabled(true);
                    relay.submit(Request::FifoReset, false);
                }
            });
        backend
            .expect_reset_command_buffer()
            .once()
            .in_sequence(&mut seq)
            .return_const(());

        let instance = Arc::new(RequestRelay::new(backend));
        relay.set(Arc::clone(&instance)).unwrap();

        instance.submit(
            Request::SaveState {
                state: StateBuffer::new(),
            },
            false,
        );
        instance.drain();

        assert_eq!(instance.pending_requests(), 0);
    }
}
