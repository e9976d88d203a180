use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex};

use crate::ERR_POISONED_LOCK;

/// A producer-owned location that a request handler writes its result into.
///
/// Peek and read requests carry a clone of an `OutputSlot`. The handler runs on the consumer
/// thread and stores the value it obtained from the backend; the producer reads it back with
/// [`get()`][Self::get] or [`take()`][Self::take].
///
/// The producer may only rely on the slot being populated after a blocking
/// [`RequestRelay::submit()`][crate::RequestRelay::submit] for the request has returned while the
/// relay was enabled. If the relay was disabled (or became disabled while the request was
/// queued), the request never ran and the slot stays empty.
///
/// # Example
///
/// ```rust
/// use request_relay::OutputSlot;
///
/// let slot = OutputSlot::<u32>::new();
/// assert_eq!(slot.get(), None);
/// ```
pub struct OutputSlot<T> {
    value: Arc<Mutex<Option<T>>>,
}

impl<T> OutputSlot<T> {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            value: Arc::new(Mutex::new(None)),
        }
    }

    /// Removes the value from the slot, leaving it empty.
    ///
    /// Returns [`None`] if no handler has written to the slot since it was created or last taken.
    #[must_use]
    pub fn take(&self) -> Option<T> {
        self.value.lock().expect(ERR_POISONED_LOCK).take()
    }

    /// Whether a handler has written a value that has not yet been taken.
    #[must_use]
    pub fn is_populated(&self) -> bool {
        self.value.lock().expect(ERR_POISONED_LOCK).is_some()
    }

    pub(crate) fn set(&self, value: T) {
        *self.value.lock().expect(ERR_POISONED_LOCK) = Some(value);
    }
}

impl<T> OutputSlot<T>
where
    T: Copy,
{
    /// Returns a copy of the value in the slot, if a handler has written one.
    #[must_use]
    pub fn get(&self) -> Option<T> {
        *self.value.lock().expect(ERR_POISONED_LOCK)
    }
}

impl<T> Clone for OutputSlot<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
        }
    }
}

impl<T> Default for OutputSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for OutputSlot<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSlot")
            .field("value", &*self.value.lock().expect(ERR_POISONED_LOCK))
            .finish()
    }
}

/// A producer-owned buffer that a save-state handler serializes engine state into.
///
/// The byte layout is owned by the [`Backend`][crate::Backend]; the relay only moves the handle
/// to the consumer thread and back. Like [`OutputSlot`], the contents are only meaningful after a
/// blocking submit of the save-state request has returned while the relay was enabled.
#[derive(Clone, Default)]
pub struct StateBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl StateBuffer {
    /// Creates an empty state buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a state buffer that starts out with existing bytes, e.g. a previously captured
    /// state that the backend should extend or overwrite.
    #[must_use]
    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Number of bytes currently in the buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.lock().expect(ERR_POISONED_LOCK).len()
    }

    /// Whether the buffer holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.lock().expect(ERR_POISONED_LOCK).is_empty()
    }

    /// Returns a copy of the serialized bytes.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.lock().expect(ERR_POISONED_LOCK).clone()
    }

    /// Moves the serialized bytes out, leaving the buffer empty.
    #[must_use]
    pub fn take(&self) -> Vec<u8> {
        mem::take(&mut *self.bytes.lock().expect(ERR_POISONED_LOCK))
    }

    pub(crate) fn with_mut<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        f(&mut self.bytes.lock().expect(ERR_POISONED_LOCK))
    }
}

impl fmt::Debug for StateBuffer {
    #[cfg_attr(test, mutants::skip)] // No API contract for debug output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateBuffer")
            .field("len", &self.len())
            .finish()
    }
}
