// kiln-aio/src/lib.rs
//! IO operations for kiln (filesystem, json, git, checksums, archives, processes)

pub mod checksum;
pub mod extract;
pub mod fs;
pub mod git2;
pub mod json_io;
pub mod process;

pub use checksum::{sha256_file, verify_checksum, verify_checksum_async};
pub use extract::{extract_archive, extract_archive_async, ArchiveKind};
pub use fs::{atomic_write_file, stage_atomic_write, StagedWrite};
pub use json_io::{read_json, write_json};
pub use process::{run_command_async, run_command_with_timeout, ProcessOutput};
