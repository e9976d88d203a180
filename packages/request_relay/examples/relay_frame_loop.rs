//! Simulates an emulated control processor that pokes pixels into the framebuffer, reads one
//! back and then presents the frame, while a separate graphics thread drains the relay.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use nm::Report;
use request_relay::{Backend, OutputSlot, Request, RequestRelay, StateBuffer, SwapRequest};

const FRAMES: u64 = 3;

/// A tiny framebuffer that remembers the last color written to it.
struct Framebuffer {
    last_color: AtomicU32,
    frames_presented: AtomicU32,
    wake: Mutex<Sender<()>>,
}

impl Backend for Framebuffer {
    fn poke_color(&self, _x: u16, _y: u16, value: u32) {
        self.last_color.store(value, Ordering::Relaxed);
    }

    fn poke_depth(&self, _x: u16, _y: u16, _value: u32) {}

    fn peek_color(&self, _x: u16, _y: u16) -> u32 {
        self.last_color.load(Ordering::Relaxed)
    }

    fn peek_depth(&self, _x: u16, _y: u16) -> u32 {
        0
    }

    fn present(&self, swap: &SwapRequest) {
        self.frames_presented.fetch_add(1, Ordering::Relaxed);
        println!(
            "presenting {}x{} frame from {:#010x} at tick {}",
            swap.fb_width, swap.fb_height, swap.xfb_addr, swap.ticks
        );
    }

    fn read_bbox(&self, _index: usize) -> u32 {
        0
    }

    fn reset_command_buffer(&self) {}

    fn flush_perf_queries(&self) {}

    fn save_state(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.frames_presented.load(Ordering::Relaxed).to_le_bytes());
    }

    fn flush_pending_work(&self) {}

    fn wake_consumer(&self) {
        if self.wake.lock().unwrap().send(()).is_err() {
            // The consumer has already shut down, so there is nobody left to wake up.
        }
    }
}

fn main() {
    let (wake, wake_rx) = mpsc::channel();

    let relay = Arc::new(RequestRelay::new(Framebuffer {
        last_color: AtomicU32::new(0),
        frames_presented: AtomicU32::new(0),
        wake: Mutex::new(wake),
    }));

    let shutdown = Arc::new(AtomicBool::new(false));

    let gpu_thread = thread::spawn({
        let relay = Arc::clone(&relay);
        let shutdown = Arc::clone(&shutdown);

        move || {
            while !shutdown.load(Ordering::Acquire) {
                match wake_rx.recv_timeout(Duration::from_millis(10)) {
                    Ok(()) | Err(RecvTimeoutError::Timeout) => relay.drain_if_pending(),
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }
    });

    for frame in 0..FRAMES {
        let color = u32::try_from(frame).unwrap().wrapping_mul(0x0011_2233);

        relay.submit(
            Request::EfbPokeColor {
                x: 10,
                y: 10,
                value: color,
            },
            false,
        );

        let readback = OutputSlot::new();
        relay.submit(
            Request::EfbPeekColor {
                x: 10,
                y: 10,
                output: readback.clone(),
            },
            true,
        );
        println!("frame {frame}: read back {:#010x}", readback.get().unwrap_or_default());

        relay.submit(
            Request::Swap(SwapRequest {
                xfb_addr: 0x0031_0000,
                fb_width: 640,
                fb_stride: 640,
                fb_height: 480,
                ticks: frame * 8_100_000,
                presentation_time: Duration::from_micros(16_667 * frame),
            }),
            false,
        );
    }

    let state = StateBuffer::new();
    relay.submit(
        Request::SaveState {
            state: state.clone(),
        },
        true,
    );
    println!("saved {} bytes of engine state", state.len());

    // Emulation is stopping: anything still queued is dropped.
    relay.set_enabled(false);

    shutdown.store(true, Ordering::Release);
    gpu_thread.join().unwrap();

    println!();
    println!("{}", Report::collect());
}
