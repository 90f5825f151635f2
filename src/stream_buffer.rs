//! Triple-buffered handoff of one stream's images from the capture callback
//! to the consumer.
//!
//! The producer only ever touches the back slot and the consumer only ever
//! touches the front slot. The middle slot is the exchange point: both sides
//! take its lock only long enough to swap image descriptors, never to copy
//! pixels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard};

use crate::traits::{Image, StreamMode};

/// Latest-image holder for one logical stream.
///
/// Lock order is back, then middle, then front. There is one producer and
/// one consumer per buffer. Consumer reads of the front slot nest freely;
/// only moving a new image to the front takes it exclusively.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    mode: Mutex<Option<StreamMode>>,
    front: RwLock<Image>,
    middle: Mutex<Image>,
    back: Mutex<Image>,
    updated: AtomicBool,
    published: Condvar,
}

impl StreamBuffer {
    /// Create an empty buffer with no mode.
    pub fn new() -> Self {
        Self::default()
    }

    /// Size all three slots for `mode` and forget any pending image.
    ///
    /// Must not be called while the stream is being produced.
    pub fn set_mode(&self, mode: StreamMode) {
        let size = mode.image_size();
        let reset = |image: &mut Image| {
            image.pixels.clear();
            image.pixels.resize(size, 0);
            image.number = 0;
        };
        reset(&mut *self.back.lock());
        reset(&mut *self.middle.lock());
        reset(&mut *self.front.write());
        self.updated.store(false, Ordering::Release);
        *self.mode.lock() = Some(mode);
    }

    /// The mode set by [`StreamBuffer::set_mode`].
    pub fn mode(&self) -> Option<StreamMode> {
        *self.mode.lock()
    }

    /// Producer side: the slot the next image is decoded into.
    pub fn back(&self) -> MutexGuard<'_, Image> {
        self.back.lock()
    }

    /// Producer side: hand the completed back image to the consumer.
    ///
    /// `back` is the guard obtained from [`StreamBuffer::back`]; afterwards it
    /// holds the previous middle image, ready to be overwritten.
    pub fn publish(&self, back: &mut Image) {
        {
            let mut middle = self.middle.lock();
            std::mem::swap(back, &mut *middle);
            self.updated.store(true, Ordering::Release);
        }
        self.published.notify_all();
    }

    /// Producer side: fill the back slot with `fill` and publish it.
    pub fn produce<F>(&self, fill: F)
    where
        F: FnOnce(&mut Image),
    {
        let mut back = self.back.lock();
        fill(&mut *back);
        self.publish(&mut back);
    }

    /// Consumer side: move the newest published image to the front.
    ///
    /// Returns `false` without locking if nothing was published since the
    /// last call.
    pub fn update_image(&self) -> bool {
        if !self.updated.load(Ordering::Acquire) {
            return false;
        }
        let mut middle = self.middle.lock();
        self.take_published(&mut middle)
    }

    /// Consumer side: block until an image is published, then move it to the
    /// front.
    pub fn wait_for_update(&self) {
        let mut middle = self.middle.lock();
        while !self.updated.load(Ordering::Acquire) {
            self.published.wait(&mut middle);
        }
        self.take_published(&mut middle);
    }

    /// Like [`StreamBuffer::wait_for_update`] but gives up after `timeout`.
    ///
    /// Returns whether a new image reached the front.
    pub fn wait_for_update_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut middle = self.middle.lock();
        while !self.updated.load(Ordering::Acquire) {
            if self.published.wait_until(&mut middle, deadline).timed_out() {
                break;
            }
        }
        self.take_published(&mut middle)
    }

    fn take_published(&self, middle: &mut Image) -> bool {
        if !self.updated.load(Ordering::Acquire) {
            return false;
        }
        std::mem::swap(&mut *self.front.write(), middle);
        self.updated.store(false, Ordering::Release);
        true
    }

    /// Consumer side: the most recent image moved to the front.
    ///
    /// Stable until the next `update_image` or `wait_for_update*` call.
    pub fn image(&self) -> RwLockReadGuard<'_, Image> {
        self.front.read_recursive()
    }

    /// Frame number of the front image.
    pub fn frame_number(&self) -> u32 {
        self.front.read_recursive().number
    }
}
