// kiln-aio/src/lib.rs
//! Blocking and async I/O primitives for kiln: digests, archives, processes
//! and the few filesystem helpers install and linking share.

pub mod checksum;
pub mod extract;
pub mod fs;
pub mod process;

pub use checksum::{sha256_file, sha256_file_async, verify_checksum_async};
pub use extract::{extract_archive, extract_archive_async, ArchiveType};
pub use process::run_command_async;
