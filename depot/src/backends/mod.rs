//! Backends shipped with the crate.

pub use self::{directory::DirectoryBackend, directory::DirectoryOptions, memory::MemoryBackend};

mod directory;
mod memory;
