pub mod entry;
#[allow(clippy::module_inception)]
pub mod entryfile;

pub use entry::{entry_from_bytes, entry_to_bytes, Entry};
pub use entryfile::{EntryFile, EntryFileWriter};
