pub mod fd_table;
pub mod ring_buffer;

pub use fd_table::{FdEntry, FdTable, ShardGuard};
pub use ring_buffer::{RingBuffer, RingBufferSnapshot};
