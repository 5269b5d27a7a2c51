// SPDX-License-Identifier: AGPL-3.0-or-later
// Streaming tar extraction with a path reservation scheduler: many archive
// members unpack concurrently, but no two in-flight operations ever touch
// the same path or replace a directory another operation is working under.

// pure path transforms
pub mod files;

// the extraction engine
pub mod unpack;

pub use unpack::dircache::DirCache;
pub use unpack::entry::{Entry, EntryKind};
pub use unpack::error::UnpackError;
pub use unpack::events::{WarnCode, Warning};
pub use unpack::{SyncUnpacker, Transform, Unpacker, UnpackOptions, UnpackSummary};
