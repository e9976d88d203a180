use crate::SwapRequest;

/// The consumer-side capabilities that relayed requests are executed against.
///
/// The relay does not know what a framebuffer, a bounding box or a command buffer is. It only
/// guarantees that the request handlers ([`poke_color()`][Self::poke_color] through
/// [`save_state()`][Self::save_state]) are called on a thread that has exclusive use of the
/// emulated graphics processor: either the consumer thread inside
/// [`RequestRelay::drain()`][crate::RequestRelay::drain], or the submitting thread itself when the
/// relay is in passthrough mode.
///
/// # Reentrancy
///
/// Handlers called from `drain()` run with the relay lock released, so a handler may submit new
/// requests. Handlers called in passthrough mode run with the relay lock held and must not call
/// back into the relay. Implementations that may run in passthrough mode must therefore never
/// submit from a handler.
#[cfg_attr(test, mockall::automock)]
pub trait Backend: Send + Sync {
    /// Writes a color value into the embedded framebuffer at the given coordinates.
    fn poke_color(&self, x: u16, y: u16, value: u32);

    /// Writes a depth value into the embedded framebuffer at the given coordinates.
    fn poke_depth(&self, x: u16, y: u16, value: u32);

    /// Reads the color value of the embedded framebuffer at the given coordinates.
    fn peek_color(&self, x: u16, y: u16) -> u32;

    /// Reads the depth value of the embedded framebuffer at the given coordinates.
    fn peek_depth(&self, x: u16, y: u16) -> u32;

    /// Presents the frame described by `swap`.
    fn present(&self, swap: &SwapRequest);

    /// Reads one component of the bounding box register set.
    fn read_bbox(&self, index: usize) -> u32;

    /// Discards everything buffered in the command buffer.
    fn reset_command_buffer(&self);

    /// Flushes pending performance query results.
    fn flush_perf_queries(&self);

    /// Serializes the engine state into `buffer`.
    fn save_state(&self, buffer: &mut Vec<u8>);

    /// Flushes work that the consumer has buffered but not yet executed.
    ///
    /// Called on the consumer thread at the start of every drain pass that has requests to
    /// execute, before any request handler runs, so that requests observe a state that includes
    /// all previously issued work.
    /// The relay lock is not held during this call.
    fn flush_pending_work(&self);

    /// Signals the consumer-side driver that requests are waiting to be drained.
    ///
    /// Called on the submitting thread after a request has been queued, with the relay lock
    /// held. The driver is expected to (eventually) call `drain()` on the consumer thread; it
    /// must not call `drain()` synchronously from this method.
    fn wake_consumer(&self);
}
