//! Resource Pools
//!
//! Recyclers shared by the storages: byte buffers for memory entries and
//! opened file handles for disk entries. Both are constructed explicitly,
//! started with `start()` and stopped with `stop()`.

pub mod buffer;
pub mod files;

pub use buffer::{BufferPool, BufferPoolConfig, BufferPoolStat};
pub use files::{FileHandle, FilePoolConfig, FilePoolStat, FilePreload, OpenFilePool, PooledFile};
