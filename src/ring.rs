// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bounded single-producer/single-consumer ring with in-place slot access.
//!
//! Slots are preallocated at construction and handed out by reference, so the
//! streaming hot path never moves or reallocates payloads: the producer fills
//! the slot at the write cursor in place and commits, the consumer peeks the
//! slot at the read cursor and commits. Of `N` slots only `N - 1` are usable;
//! the cursors always address valid slots, which is what makes
//! [`Ring::acquire_write`] non-blocking (one slot is always free).
//!
//! A third, supervisor, role may reset the ring ([`Ring::invalidate`]), mutate
//! every slot ([`Ring::apply_all`]) or inject a synthetic element
//! ([`Ring::fake_write`]). Supervisor calls quiesce the producer's and
//! consumer's critical sections through a halt handshake before touching
//! anything.
//!
//! # Safety
//!
//! Slot contents live in `UnsafeCell`s and are accessed outside the control
//! mutex. This is sound because:
//! - the slot at the write cursor is never inside the readable range
//!   (`size <= N - 1`), so the single producer has exclusive access to it
//!   between `acquire_write` and commit/abort;
//! - the consumer only dereferences the slot at the read cursor while the
//!   single-reader guard (`read_pending`) is held;
//! - supervisor calls wait until both `read_halt` and `write_halt` are set,
//!   i.e. neither side is inside its critical section.

use std::cell::UnsafeCell;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Condvar;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug)]
struct Ctl {
    read: usize,
    write: usize,
    valid: bool,
    halt: bool,
    read_halt: bool,
    write_halt: bool,
    read_pending: bool,
}

pub struct Ring<T> {
    slots: Box<[UnsafeCell<T>]>,
    ctl: Mutex<Ctl>,
    cv: Condvar,
    cv_supervisor: Condvar,
}

// The halt/pending protocol above serializes all slot access.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

enum Notify {
    Always,
    Relaxed,
    Never,
}

impl<T: Default> Ring<T> {
    /// `n_slots` slots, `n_slots - 1` usable.
    pub fn new(n_slots: usize) -> Self {
        assert!(n_slots >= 2, "ring needs at least two slots");
        let slots: Box<[UnsafeCell<T>]> =
            (0..n_slots).map(|_| UnsafeCell::new(T::default())).collect();
        Self {
            slots,
            ctl: Mutex::new(Ctl {
                read: 0,
                write: 0,
                valid: true,
                halt: false,
                read_halt: true,
                write_halt: true,
                read_pending: false,
            }),
            cv: Condvar::new(),
            cv_supervisor: Condvar::new(),
        }
    }
}

impl<T> Ring<T> {
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    pub fn len(&self) -> usize {
        let ctl = self.ctl.lock().unwrap();
        self.size(&ctl)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn size(&self, ctl: &Ctl) -> usize {
        (ctl.write + self.slots.len() - ctl.read) % self.slots.len()
    }

    fn full(&self, ctl: &Ctl) -> bool {
        self.size(ctl) == self.capacity()
    }

    fn readable(&self, ctl: &Ctl) -> bool {
        !ctl.halt && ctl.valid && self.size(ctl) != 0
    }

    /// Non-blocking: the slot at the write cursor is always free. The guard
    /// aborts on drop; call [`WriteGuard::commit`] to publish.
    pub fn acquire_write(&self) -> WriteGuard<'_, T> {
        let mut ctl = self.ctl.lock().unwrap();
        ctl.write_halt = false;
        // A supervisor may have invalidated the ring; the next published
        // element restores validity.
        ctl.valid = true;
        let index = ctl.write;
        drop(ctl);
        WriteGuard {
            ring: self,
            index,
            done: false,
        }
    }

    /// Blocks up to `timeout` for the ring to become non-empty and valid.
    /// `None` means wait forever; a zero timeout never waits. Returns `None`
    /// on timeout. The guard aborts on drop; call [`ReadGuard::commit`] to
    /// consume the element.
    ///
    /// # Panics
    /// If another `acquire_read` is already pending: the ring is single
    /// consumer by contract.
    pub fn acquire_read(&self, timeout: Option<Duration>) -> Option<ReadGuard<'_, T>> {
        let mut ctl = self.ctl.lock().unwrap();
        if ctl.read_pending {
            // Release the lock before failing so outstanding guards can
            // still abort cleanly during unwind.
            drop(ctl);
            panic!("another acquire_read is pending");
        }
        ctl.read_pending = true;
        let ready = match timeout {
            None => {
                while !self.readable(&ctl) {
                    ctl = self.cv.wait(ctl).unwrap();
                }
                true
            }
            Some(timeout) if timeout.is_zero() => self.readable(&ctl),
            Some(timeout) => {
                let (guard, res) = self
                    .cv
                    .wait_timeout_while(ctl, timeout, |ctl| !self.readable(ctl))
                    .unwrap();
                ctl = guard;
                !res.timed_out()
            }
        };
        if !ready {
            ctl.read_pending = false;
            return None;
        }
        ctl.read_halt = false;
        let index = ctl.read;
        drop(ctl);
        Some(ReadGuard {
            ring: self,
            index,
            done: false,
        })
    }

    fn finalize_write(&self, success: bool, notify: Notify) {
        let mut ctl = self.ctl.lock().unwrap();
        ctl.write_halt = true;
        if ctl.halt {
            self.cv_supervisor.notify_all();
        }
        if success {
            // Commit at full capacity waits for the next read commit, or for
            // the ring to be invalidated (which empties it).
            while ctl.halt || self.full(&ctl) {
                ctl = self.cv.wait(ctl).unwrap();
            }
            if ctl.valid {
                ctl.write = (ctl.write + 1) % self.slots.len();
            }
        } else {
            while ctl.halt {
                ctl = self.cv.wait(ctl).unwrap();
            }
        }
        let became_nonempty = self.size(&ctl) == 1;
        drop(ctl);
        match notify {
            Notify::Always => self.cv.notify_all(),
            Notify::Relaxed => {
                if became_nonempty {
                    self.cv.notify_all();
                }
            }
            Notify::Never => {}
        }
    }

    fn finalize_read(&self, success: bool, notify: Notify) {
        let mut ctl = self.ctl.lock().unwrap();
        let was_full = self.full(&ctl);
        if success {
            ctl.read = (ctl.read + 1) % self.slots.len();
        }
        ctl.read_halt = true;
        if ctl.halt {
            self.cv_supervisor.notify_all();
        }
        ctl.read_pending = false;
        let now_empty = self.size(&ctl) == 0;
        drop(ctl);
        match notify {
            Notify::Always => self.cv.notify_all(),
            Notify::Relaxed => {
                // Wake a writer stalled on full, or a wait_empty supervisor.
                if now_empty || was_full {
                    self.cv.notify_all();
                }
            }
            Notify::Never => {}
        }
    }

    fn supervisor_call(&self, f: impl FnOnce(&mut Ctl, &[UnsafeCell<T>])) {
        {
            let mut ctl = self.ctl.lock().unwrap();
            ctl.halt = true;
            while !(ctl.read_halt && ctl.write_halt) {
                ctl = self.cv_supervisor.wait(ctl).unwrap();
            }
            f(&mut ctl, &self.slots);
            ctl.halt = false;
        }
        self.cv.notify_all();
    }

    /// Drain both cursors and mark the ring invalid until the next producer
    /// commit.
    pub fn invalidate(&self) {
        self.supervisor_call(|ctl, _| {
            ctl.valid = false;
            ctl.read = 0;
            ctl.write = 0;
        });
    }

    /// Reset the ring and apply `f` to every slot. Used at arm time to
    /// preallocate slot payloads.
    pub fn apply_all(&self, mut f: impl FnMut(&mut T)) {
        self.supervisor_call(|ctl, slots| {
            ctl.valid = false;
            ctl.read = 0;
            ctl.write = 0;
            for slot in slots {
                // Safety: both sides are halted, see module docs.
                f(unsafe { &mut *slot.get() });
            }
        });
    }

    /// Atomic reset plus a single synthetic element, used to unblock a stuck
    /// consumer with a sentinel.
    pub fn fake_write(&self, f: impl FnOnce(&mut T)) {
        self.supervisor_call(|ctl, slots| {
            ctl.valid = true;
            ctl.read = 0;
            ctl.write = 1;
            // Safety: both sides are halted, see module docs.
            f(unsafe { &mut *slots[0].get() });
        });
    }

    pub fn has_data(&self) -> bool {
        let ctl = self.ctl.lock().unwrap();
        self.readable(&ctl)
    }

    /// Block until the ring is valid and empty.
    pub fn wait_empty(&self) {
        let mut ctl = self.ctl.lock().unwrap();
        while !(!ctl.halt && ctl.valid && self.size(&ctl) == 0) {
            ctl = self.cv.wait(ctl).unwrap();
        }
    }

    pub fn notify(&self) {
        self.cv.notify_all();
    }

    pub fn is_read_pending(&self) -> bool {
        self.ctl.lock().unwrap().read_pending
    }

    #[cfg(test)]
    fn cursors(&self) -> (usize, usize) {
        let ctl = self.ctl.lock().unwrap();
        (ctl.read, ctl.write)
    }
}

pub struct WriteGuard<'a, T> {
    ring: &'a Ring<T>,
    index: usize,
    done: bool,
}

impl<T> WriteGuard<'_, T> {
    /// Publish the slot and wake the consumer.
    pub fn commit(mut self) {
        self.done = true;
        self.ring.finalize_write(true, Notify::Always);
    }

    /// Publish the slot; wake the consumer only on the empty→non-empty
    /// transition.
    pub fn commit_relaxed(mut self) {
        self.done = true;
        self.ring.finalize_write(true, Notify::Relaxed);
    }
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safety: exclusive producer access to the write slot, see module docs.
        unsafe { &*self.ring.slots[self.index].get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: exclusive producer access to the write slot, see module docs.
        unsafe { &mut *self.ring.slots[self.index].get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        if !self.done {
            self.ring.finalize_write(false, Notify::Never);
        }
    }
}

pub struct ReadGuard<'a, T> {
    ring: &'a Ring<T>,
    index: usize,
    done: bool,
}

impl<T> ReadGuard<'_, T> {
    /// Consume the element and wake the producer.
    pub fn commit(mut self) {
        self.done = true;
        self.ring.finalize_read(true, Notify::Always);
    }

    /// Consume the element; notify only when the ring drains or a writer may
    /// be stalled on full.
    pub fn commit_relaxed(mut self) {
        self.done = true;
        self.ring.finalize_read(true, Notify::Relaxed);
    }
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safety: single-reader access to the read slot, see module docs.
        unsafe { &*self.ring.slots[self.index].get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        if !self.done {
            self.ring.finalize_read(false, Notify::Never);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    use proptest::prelude::*;

    use super::*;

    const ZERO: Option<Duration> = Some(Duration::ZERO);

    #[test]
    fn test_capacity_is_slots_minus_one() {
        let ring: Ring<u32> = Ring::new(4);
        assert_eq!(ring.capacity(), 3);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let ring: Ring<u32> = Ring::new(4);
        for value in [7u32, 8, 9] {
            let mut slot = ring.acquire_write();
            *slot = value;
            slot.commit();
        }
        assert_eq!(ring.len(), 3);
        for value in [7u32, 8, 9] {
            let slot = ring.acquire_read(ZERO).unwrap();
            assert_eq!(*slot, value);
            slot.commit();
        }
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn test_cursors_align_after_k_cycles() {
        let ring: Ring<u32> = Ring::new(5);
        for k in 0..23 {
            let mut slot = ring.acquire_write();
            *slot = k;
            slot.commit();
            ring.acquire_read(ZERO).unwrap().commit();
        }
        assert_eq!(ring.len(), 0);
        let (read, write) = ring.cursors();
        assert_eq!(read, write);
    }

    #[test]
    fn test_two_slot_ring_interleaved() {
        // Usable capacity 1: strict alternation.
        let ring: Ring<u32> = Ring::new(2);
        assert_eq!(ring.capacity(), 1);
        for k in 0..10 {
            let mut slot = ring.acquire_write();
            *slot = k;
            slot.commit();
            assert_eq!(ring.len(), 1);
            let slot = ring.acquire_read(ZERO).unwrap();
            assert_eq!(*slot, k);
            slot.commit();
            assert_eq!(ring.len(), 0);
        }
    }

    #[test]
    fn test_zero_timeout_never_waits() {
        let ring: Ring<u32> = Ring::new(4);
        let started = Instant::now();
        assert!(ring.acquire_read(ZERO).is_none());
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_finite_timeout_expires() {
        let ring: Ring<u32> = Ring::new(4);
        let started = Instant::now();
        assert!(ring.acquire_read(Some(Duration::from_millis(30))).is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_abort_write_leaves_ring_unchanged() {
        let ring: Ring<u32> = Ring::new(4);
        {
            let mut slot = ring.acquire_write();
            *slot = 42;
            // dropped without commit
        }
        assert!(!ring.has_data());
        // The aborted slot content is still there on the next acquire.
        let slot = ring.acquire_write();
        assert_eq!(*slot, 42);
    }

    #[test]
    fn test_abort_read_keeps_element() {
        let ring: Ring<u32> = Ring::new(4);
        let mut slot = ring.acquire_write();
        *slot = 3;
        slot.commit();
        {
            let slot = ring.acquire_read(ZERO).unwrap();
            assert_eq!(*slot, 3);
            // dropped without commit
        }
        assert_eq!(ring.len(), 1);
        assert_eq!(*ring.acquire_read(ZERO).unwrap(), 3);
    }

    #[test]
    fn test_invalidate_then_commit_restores_validity() {
        let ring: Ring<u32> = Ring::new(4);
        let mut slot = ring.acquire_write();
        *slot = 1;
        slot.commit();
        ring.invalidate();
        assert!(!ring.has_data());
        assert_eq!(ring.len(), 0);
        let mut slot = ring.acquire_write();
        *slot = 2;
        slot.commit();
        assert!(ring.has_data());
        assert_eq!(ring.len(), 1);
        assert_eq!(*ring.acquire_read(ZERO).unwrap(), 2);
    }

    #[test]
    fn test_fake_write_unblocks_infinite_read() {
        let ring: Arc<Ring<u32>> = Arc::new(Ring::new(4));
        let consumer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let slot = ring.acquire_read(None).unwrap();
                let value = *slot;
                slot.commit();
                value
            })
        };
        thread::sleep(Duration::from_millis(30));
        ring.fake_write(|slot| *slot = 99);
        assert_eq!(consumer.join().unwrap(), 99);
    }

    #[test]
    fn test_commit_at_full_waits_for_reader() {
        let ring: Arc<Ring<u32>> = Arc::new(Ring::new(2));
        let mut slot = ring.acquire_write();
        *slot = 1;
        slot.commit();
        // Ring is full; the next commit must block until a read commit.
        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut slot = ring.acquire_write();
                *slot = 2;
                slot.commit();
            })
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!producer.is_finished());
        ring.acquire_read(ZERO).unwrap().commit();
        producer.join().unwrap();
        assert_eq!(*ring.acquire_read(ZERO).unwrap(), 2);
    }

    #[test]
    #[should_panic(expected = "another acquire_read is pending")]
    fn test_second_pending_read_panics() {
        let ring: Ring<u32> = Ring::new(4);
        let mut slot = ring.acquire_write();
        *slot = 1;
        slot.commit();
        let _held = ring.acquire_read(ZERO).unwrap();
        let _ = ring.acquire_read(ZERO);
    }

    #[test]
    fn test_wait_empty_wakes_on_relaxed_read_commit() {
        let ring: Arc<Ring<u32>> = Arc::new(Ring::new(4));
        let mut slot = ring.acquire_write();
        *slot = 1;
        slot.commit();
        let waiter = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || ring.wait_empty())
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());
        ring.acquire_read(ZERO).unwrap().commit_relaxed();
        waiter.join().unwrap();
    }

    #[test]
    fn test_threaded_fifo_order() {
        let ring: Arc<Ring<u64>> = Arc::new(Ring::new(8));
        const COUNT: u64 = 2000;
        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for value in 0..COUNT {
                    let mut slot = ring.acquire_write();
                    *slot = value;
                    slot.commit();
                }
            })
        };
        for expected in 0..COUNT {
            let slot = ring.acquire_read(None).unwrap();
            assert_eq!(*slot, expected);
            slot.commit();
        }
        producer.join().unwrap();
        assert_eq!(ring.len(), 0);
    }

    proptest! {
        #[test]
        fn prop_size_tracks_operations(
            n_slots in 2usize..9,
            ops in proptest::collection::vec(any::<bool>(), 0..64),
        ) {
            let ring: Ring<u64> = Ring::new(n_slots);
            let mut expected = 0usize;
            for write in ops {
                if write {
                    if expected < ring.capacity() {
                        ring.acquire_write().commit();
                        expected += 1;
                    }
                } else if expected > 0 {
                    ring.acquire_read(ZERO).unwrap().commit();
                    expected -= 1;
                } else {
                    prop_assert!(ring.acquire_read(ZERO).is_none());
                }
                prop_assert_eq!(ring.len(), expected);
            }
        }
    }
}
