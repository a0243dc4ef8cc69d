//! Argument Lists for Unit Runs
//!
//! An [`ArgumentList`] is the argument vector a code unit sees while it
//! runs.  It is owned by a runtime and can be reused across any number of
//! runs and units.
//!
//! # Allocation Policy:
//! - Argument text is packed into one contiguous byte buffer
//! - The length table grows by fixed steps of 4 entries, since most lists are short
//! - The byte buffer doubles, since argument text length is unbounded
//!
//! The two growth rules are observable through [`ArgStats`].

use rhai::{Array, Dynamic};
use std::fmt;
use tracing::debug;

/// Length table growth step, in entries.
pub const LENGTH_STEP: usize = 4;
/// Minimum byte buffer size.
pub const BUFFER_MIN: usize = 32;
/// Bytes reserved per initial argument.
const BYTES_PER_ARG: usize = 20;

fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

/// Growth statistics for an [`ArgumentList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgStats {
    /// Number of arguments.
    pub count: usize,
    /// Reserved length-table entries.
    pub length_capacity: usize,
    /// Reserved buffer bytes.
    pub buffer_capacity: usize,
    /// Bytes of argument text stored.
    pub buffer_len: usize,
    /// Times the length table was enlarged.
    pub length_grows: usize,
    /// Times the byte buffer was enlarged.
    pub buffer_grows: usize,
}

/// Ordered argument vector with a taint flag.
#[derive(Clone)]
pub struct ArgumentList {
    tainted: bool,
    lengths: Vec<usize>,
    length_capacity: usize,
    buffer: Vec<u8>,
    buffer_capacity: usize,
    length_grows: usize,
    buffer_grows: usize,
}

impl ArgumentList {
    /// Create a list holding `items`.
    ///
    /// The length table starts at `items` rounded up to a multiple of 4
    /// (at least 4), the buffer at 20 bytes per item rounded up to 32
    /// (at least 32).
    pub fn new<I, S>(tainted: bool, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let items: Vec<S> = items.into_iter().collect();
        let length_capacity = round_up(items.len(), LENGTH_STEP).max(LENGTH_STEP);
        let buffer_capacity = round_up(items.len() * BYTES_PER_ARG, BUFFER_MIN).max(BUFFER_MIN);

        let mut list = Self {
            tainted,
            lengths: Vec::with_capacity(length_capacity),
            length_capacity,
            buffer: Vec::with_capacity(buffer_capacity),
            buffer_capacity,
            length_grows: 0,
            buffer_grows: 0,
        };
        for item in &items {
            list.append(item.as_ref());
        }
        list
    }

    /// Append one argument.
    pub fn append(&mut self, item: &[u8]) {
        if self.lengths.len() == self.length_capacity {
            self.length_capacity += LENGTH_STEP;
            self.lengths.reserve_exact(LENGTH_STEP);
            self.length_grows += 1;
        }

        let needed = self.buffer.len() + item.len();
        if needed > self.buffer_capacity {
            while needed > self.buffer_capacity {
                self.buffer_capacity *= 2;
            }
            self.buffer
                .reserve_exact(self.buffer_capacity - self.buffer.len());
            self.buffer_grows += 1;
            debug!(capacity = self.buffer_capacity, "Argument buffer enlarged");
        }

        self.buffer.extend_from_slice(item);
        self.lengths.push(item.len());
    }

    /// Append a formatted argument.
    pub fn append_fmt(&mut self, args: fmt::Arguments<'_>) {
        let text = fmt::format(args);
        self.append(text.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    /// Bytes of the argument at `index`.
    pub fn get(&self, index: usize) -> Option<&[u8]> {
        self.iter().nth(index)
    }

    /// Iterate over the arguments in order.
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let mut offset = 0;
        self.lengths.iter().map(move |len| {
            let item = &self.buffer[offset..offset + len];
            offset += len;
            item
        })
    }

    pub fn stats(&self) -> ArgStats {
        ArgStats {
            count: self.lengths.len(),
            length_capacity: self.length_capacity,
            buffer_capacity: self.buffer_capacity,
            buffer_len: self.buffer.len(),
            length_grows: self.length_grows,
            buffer_grows: self.buffer_grows,
        }
    }

    /// Script-visible argument vector.
    ///
    /// Bytes decode as UTF-8 (lossy) when `utf8` is set, as Latin-1
    /// otherwise.  Every element carries the taint tag if the list is tainted.
    pub(crate) fn to_visible(&self, utf8: bool) -> Array {
        self.iter()
            .map(|bytes| {
                let text = if utf8 {
                    String::from_utf8_lossy(bytes).into_owned()
                } else {
                    bytes.iter().map(|&b| b as char).collect()
                };
                crate::engine::tainted_value(Dynamic::from(text), self.tainted)
            })
            .collect()
    }
}

impl fmt::Debug for ArgumentList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArgumentList")
            .field("tainted", &self.tainted)
            .field(
                "items",
                &self
                    .iter()
                    .map(String::from_utf8_lossy)
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}
