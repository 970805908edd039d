// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for debugging the IPC runtime and its drivers.
//!
//! This contains an implementation for a static ring buffer designed to be
//! used to instrument arbitrary contexts. While there is nothing to prevent
//! these ring buffers from being left in production code, the design center
//! is primarily around debugging in development: a module declares a `Trace`
//! payload type and a buffer, then records entries at interesting points.
//!
//! ## Constraints
//!
//! The type in the ring buffer must implement both `Copy` and `PartialEq`.
//!
//! If you use the variants of the `ringbuf!` macro that leave the name of the
//! data structure implicit, you can only have one per module. (You can lift
//! this constraint by providing a name.)
//!
//! ## Creating a ring buffer
//!
//! Ring buffers are instantiated with the [`ringbuf!`] macro, to which one
//! must provide the type of per-entry payload, the number of entries, and a
//! static initializer. For example, to define a 16-entry ring buffer with
//! each entry containing a `u32`:
//!
//! ```ignore
//! ringbuf!(u32, 16, 0);
//! ```
//!
//! Ring buffer entries are generated with [`ringbuf_entry!`] specifying a
//! payload of the appropriate type, e.g.:
//!
//! ```ignore
//! ringbuf_entry!(status.bits());
//! ```
//!
//! You can also provide a name for the ring buffer, to distinguish between
//! them if you have more than one:
//!
//! ```ignore
//! ringbuf!(MY_RINGBUF, u32, 16, 0);
//!
//! // ...
//!
//! ringbuf_entry!(MY_RINGBUF, status.bits());
//! ```

use std::sync::{Mutex, MutexGuard};

/// Mutable static storage for a ring buffer.
///
/// The runtime is hosted and multi-threaded, so concurrent recorders are
/// real; a mutex keeps entries whole. Trace recording must never wedge on a
/// panicked recorder, so a poisoned lock is simply taken anyway.
pub struct StaticCell<T>(Mutex<T>);

impl<T> StaticCell<T> {
    pub const fn new(value: T) -> Self {
        Self(Mutex::new(value))
    }

    pub fn borrow_mut(&self) -> MutexGuard<'_, T> {
        match self.0.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Declares a ringbuffer in the current module or context.
///
/// `ringbuf!(NAME, Type, N, expr)` makes a ringbuffer named `NAME`,
/// containing entries of type `Type`, with room for `N` such entries, all of
/// which are initialized to `expr`.
///
/// The resulting ringbuffer will be static, so `NAME` should be uppercase.
///
/// The actual type of `NAME` will be `StaticCell<Ringbuf<T, N>>`.
///
/// To support the common case of having one quickly-installed ringbuffer per
/// module, if you omit the name, it will default to `__RINGBUF`.
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[used]
        static $name: $crate::StaticCell<$crate::Ringbuf<$t, $n>> =
            $crate::StaticCell::new($crate::Ringbuf {
                last: None,
                buffer: [$crate::RingbufEntry {
                    line: 0,
                    generation: 0,
                    count: 0,
                    payload: $init,
                }; $n],
            });
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

/// Inserts data into a named ringbuffer (which should have been declared with
/// the `ringbuf!` macro).
///
/// `ringbuf_entry!(NAME, expr)` will insert `expr` into the ringbuffer called
/// `NAME`.
///
/// If you declared your ringbuffer without a name, you can also use this
/// without a name, and it will default to `__RINGBUF`.
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate both buf and payload, without letting them access each
        // other, by evaluating them in a tuple where each cannot
        // accidentally use the other's binding.
        let (p, buf) = ($payload, &$buf);
        // Invoke these functions using slightly weird syntax to avoid
        // accidentally calling a _different_ routine called borrow_mut or
        // entry.
        $crate::Ringbuf::entry(
            &mut *$crate::StaticCell::borrow_mut(buf),
            line!() as u16,
            p,
        );
    }};
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}

///
/// The structure of a single [`Ringbuf`] entry, carrying a payload of
/// arbitrary type. When a ring buffer entry is generated with an identical
/// payload to the most recent entry (in terms of both `line` and `payload`),
/// `count` will be incremented rather than generating a new entry.
///
#[derive(Debug, Copy, Clone)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

///
/// A ring buffer of parametrized type and size. In practice, instantiating
/// this directly is strange -- see the [`ringbuf!`] macro.
///
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, { N }> {
    pub fn entry(&mut self, line: u16, payload: T) {
        let ndx = match self.last {
            None => 0,
            Some(last) => {
                let ent = &mut self.buffer[last];

                if ent.line == line && ent.payload == payload {
                    // Only reuse this entry if we don't overflow the
                    // count.
                    if let Some(new_count) = ent.count.checked_add(1) {
                        ent.count = new_count;
                        return;
                    }
                }

                if last + 1 >= self.buffer.len() {
                    0
                } else {
                    last + 1
                }
            }
        };

        let ent = &mut self.buffer[ndx];
        ent.line = line;
        ent.payload = payload;
        ent.count = 1;
        ent.generation = ent.generation.wrapping_add(1);

        self.last = Some(ndx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty<const N: usize>() -> Ringbuf<u32, N> {
        Ringbuf {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: 0,
            }; N],
        }
    }

    #[test]
    fn coalesces_repeated_entries() {
        let mut rb = empty::<4>();

        rb.entry(7, 42);
        rb.entry(7, 42);
        rb.entry(7, 42);
        assert_eq!(rb.last, Some(0));
        assert_eq!(rb.buffer[0].count, 3);

        rb.entry(7, 43);
        assert_eq!(rb.last, Some(1));
        assert_eq!(rb.buffer[1].count, 1);
    }

    #[test]
    fn wraps_around() {
        let mut rb = empty::<2>();

        rb.entry(1, 1);
        rb.entry(2, 2);
        rb.entry(3, 3);
        assert_eq!(rb.last, Some(0));
        assert_eq!(rb.buffer[0].payload, 3);
        assert_eq!(rb.buffer[0].generation, 2);
    }

    ringbuf!(u8, 4, 0);

    #[test]
    fn macro_surface() {
        ringbuf_entry!(9);
        let g = __RINGBUF.borrow_mut();
        assert_eq!(g.last, Some(0));
        assert_eq!(g.buffer[0].payload, 9);
    }
}
