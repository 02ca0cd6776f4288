//! Linear memory management.
//!
//! The module and the host share one growable byte buffer. Allocation
//! requests from either side go through a single [`Heap`], which carves
//! regions out of the buffer above the heap base and grows the buffer page
//! by page up to the configured ceiling.
//!
//! ```text
//! 0            heap base                brk          len
//! ├─ static ───┼── live │ free │ live ──┼── unused ──┤
//! ```

mod buffer;
mod heap;

pub use buffer::{LinearBuffer, MAX_PAGES, PAGE_SIZE, VecBuffer};
pub use heap::Heap;
