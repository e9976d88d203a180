use std::time::Duration;

use crate::metrics::{EFB_PEEKS, EFB_POKES};
use crate::{Backend, OutputSlot, StateBuffer};

/// An operation that must be executed on the consumer thread.
///
/// Requests are submitted via [`RequestRelay::submit()`][crate::RequestRelay::submit]. Each
/// variant maps to exactly one [`Backend`] call. Variants that produce a value carry an
/// [`OutputSlot`] owned by the producer, which the handler fills in on the consumer thread.
///
/// # Example
///
/// ```rust
/// use request_relay::{OutputSlot, Request};
///
/// let color = OutputSlot::new();
///
/// let request = Request::EfbPeekColor {
///     x: 3,
///     y: 4,
///     output: color.clone(),
/// };
/// # drop(request);
/// ```
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Request {
    /// Writes a color value into the embedded framebuffer.
    EfbPokeColor {
        /// Horizontal pixel coordinate.
        x: u16,
        /// Vertical pixel coordinate.
        y: u16,
        /// Packed color value to write.
        value: u32,
    },

    /// Writes a depth value into the embedded framebuffer.
    EfbPokeDepth {
        /// Horizontal pixel coordinate.
        x: u16,
        /// Vertical pixel coordinate.
        y: u16,
        /// Depth value to write.
        value: u32,
    },

    /// Reads a color value from the embedded framebuffer into `output`.
    EfbPeekColor {
        /// Horizontal pixel coordinate.
        x: u16,
        /// Vertical pixel coordinate.
        y: u16,
        /// Receives the packed color value.
        output: OutputSlot<u32>,
    },

    /// Reads a depth value from the embedded framebuffer into `output`.
    EfbPeekDepth {
        /// Horizontal pixel coordinate.
        x: u16,
        /// Vertical pixel coordinate.
        y: u16,
        /// Receives the depth value.
        output: OutputSlot<u32>,
    },

    /// Presents a frame.
    Swap(SwapRequest),

    /// Reads one bounding box component into `output`.
    BboxRead {
        /// Index of the bounding box component.
        index: usize,
        /// Receives the component value.
        output: OutputSlot<u32>,
    },

    /// Discards everything buffered in the command buffer.
    FifoReset,

    /// Flushes pending performance query results.
    PerfQueryFlush,

    /// Serializes the engine state into `state`.
    SaveState {
        /// Receives the serialized state.
        state: StateBuffer,
    },
}

impl Request {
    /// Executes the request against the backend.
    ///
    /// The caller is responsible for ensuring that the current thread has exclusive use of
    /// the backend's consumer-side resources.
    pub(crate) fn execute<B>(&self, backend: &B)
    where
        B: Backend + ?Sized,
    {
        match self {
            Self::EfbPokeColor { x, y, value } => {
                EFB_POKES.with(|e| e.observe_once());
                backend.poke_color(*x, *y, *value);
            }
            Self::EfbPokeDepth { x, y, value } => {
                EFB_POKES.with(|e| e.observe_once());
                backend.poke_depth(*x, *y, *value);
            }
            Self::EfbPeekColor { x, y, output } => {
                EFB_PEEKS.with(|e| e.observe_once());
                output.set(backend.peek_color(*x, *y));
            }
            Self::EfbPeekDepth { x, y, output } => {
                EFB_PEEKS.with(|e| e.observe_once());
                output.set(backend.peek_depth(*x, *y));
            }
            Self::Swap(swap) => backend.present(swap),
            Self::BboxRead { index, output } => output.set(backend.read_bbox(*index)),
            Self::FifoReset => backend.reset_command_buffer(),
            Self::PerfQueryFlush => backend.flush_perf_queries(),
            Self::SaveState { state } => state.with_mut(|bytes| backend.save_state(bytes)),
        }
    }

    /// Short name of the request kind, for logging.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::EfbPokeColor { .. } => "efb_poke_color",
            Self::EfbPokeDepth { .. } => "efb_poke_depth",
            Self::EfbPeekColor { .. } => "efb_peek_color",
            Self::EfbPeekDepth { .. } => "efb_peek_depth",
            Self::Swap(_) => "swap",
            Self::BboxRead { .. } => "bbox_read",
            Self::FifoReset => "fifo_reset",
            Self::PerfQueryFlush => "perf_query_flush",
            Self::SaveState { .. } => "save_state",
        }
    }
}

/// Describes a frame to present.
///
/// All values are forwarded to [`Backend::present()`] unchanged.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[expect(
    clippy::exhaustive_structs,
    reason = "mirrors the fixed register set that describes an external framebuffer"
)]
pub struct SwapRequest {
    /// Guest memory address of the external framebuffer.
    pub xfb_addr: u32,

    /// Width of the external framebuffer, in pixels.
    pub fb_width: u32,

    /// Distance between the starts of two consecutive rows, in pixels.
    pub fb_stride: u32,

    /// Height of the external framebuffer, in pixels.
    pub fb_height: u32,

    /// Emulated processor tick count at which the swap was requested.
    pub ticks: u64,

    /// Host time at which the frame should be presented, relative to emulation start.
    pub presentation_time: Duration,
}
