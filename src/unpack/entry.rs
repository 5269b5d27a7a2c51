// SPDX-License-Identifier: AGPL-3.0-or-later
// One record per archive member, as handed to the unpack state machine. The
// byte-level parsing itself belongs to the `tar` crate; this module only
// adapts its headers into the shape the sanitizer / reconciler / materializer
// operate on.

// File system
use std::path::PathBuf;
// Timestamps
use filetime::FileTime;
// Tar files
use tar::{EntryType, Header};

/// Closed sum of archive member kinds. Dispatch is an exhaustive match, not
/// polymorphism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    /// Pre-POSIX regular file (typeflag NUL). Behaves exactly like `File`.
    OldFile,
    ContiguousFile,
    Directory,
    /// GNU dump directory. Behaves exactly like `Directory`.
    GnuDumpDir,
    /// Hard link; `linkpath` is archive-relative.
    Link,
    /// Symbolic link; `linkpath` is the literal target.
    SymbolicLink,
    CharDevice,
    BlockDevice,
    Fifo,
    Unknown,
}

impl EntryKind {
    pub fn from_header(header: &Header) -> EntryKind {
        use tar::EntryType::*;
        match header.entry_type() {
            // the parser folds typeflag NUL and '0' into one variant; the
            // raw byte still tells the pre-POSIX shape apart
            Regular if header.as_bytes()[156] == 0 => EntryKind::OldFile,
            Regular | GNUSparse => EntryKind::File,
            Continuous => EntryKind::ContiguousFile,
            Directory => EntryKind::Directory,
            Link => EntryKind::Link,
            Symlink => EntryKind::SymbolicLink,
            Char => EntryKind::CharDevice,
            Block => EntryKind::BlockDevice,
            Fifo => EntryKind::Fifo,
            _ => {
                // GNU dump directories carry typeflag 'D' and unpack like
                // directories; anything else we cannot materialize
                if header.as_bytes()[156] == b'D' {
                    EntryKind::GnuDumpDir
                } else {
                    EntryKind::Unknown
                }
            }
        }
    }

    pub fn is_file(self) -> bool {
        matches!(
            self,
            EntryKind::File | EntryKind::OldFile | EntryKind::ContiguousFile
        )
    }

    pub fn is_dir(self) -> bool {
        matches!(self, EntryKind::Directory | EntryKind::GnuDumpDir)
    }

    /// Kinds this engine materializes. Devices, FIFOs and unknown typeflags
    /// are drained and warned about instead.
    pub fn is_supported(self) -> bool {
        self.is_file()
            || self.is_dir()
            || matches!(self, EntryKind::Link | EntryKind::SymbolicLink)
    }

    pub fn name(self) -> &'static str {
        match self {
            EntryKind::File           => "File",
            EntryKind::OldFile        => "OldFile",
            EntryKind::ContiguousFile => "ContiguousFile",
            EntryKind::Directory      => "Directory",
            EntryKind::GnuDumpDir     => "GNUDumpDir",
            EntryKind::Link           => "Link",
            EntryKind::SymbolicLink   => "SymbolicLink",
            EntryKind::CharDevice     => "CharacterDevice",
            EntryKind::BlockDevice    => "BlockDevice",
            EntryKind::Fifo           => "FIFO",
            EntryKind::Unknown        => "Unknown"
        }
    }
}

/// Header kinds the parser consumes for its own bookkeeping (long names, pax
/// attributes). They describe the member that follows and never materialize
/// themselves.
pub fn is_meta_type(t: EntryType) -> bool {
    matches!(
        t,
        EntryType::XHeader
            | EntryType::XGlobalHeader
            | EntryType::GNULongName
            | EntryType::GNULongLink
    )
}

/// One archive member. Mutated only by the sanitizer (which rewrites `path`
/// and fills `absolute`); the reconciler and materializer treat it as
/// immutable.
#[derive(Debug)]
pub struct Entry {
    pub kind: EntryKind,
    /// Archive-relative path, `/`-separated.
    pub path: String,
    /// Hard-link or symlink target.
    pub linkpath: Option<String>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mtime: Option<FileTime>,
    pub atime: Option<FileTime>,
    /// Payload byte length as declared by the header.
    pub size: u64,
    /// Fully resolved host path; set by the sanitizer before reservation.
    pub absolute: Option<PathBuf>,
    pub unsupported: bool,
    /// File payload, buffered off the archive stream by the driver so that
    /// unpacking can proceed while the parser advances.
    pub payload: Vec<u8>,
}

impl Entry {
    /// Adapt one parsed member. The payload is read separately by the driver
    /// (and only for entries that survive sanitation).
    pub fn from_tar<R: std::io::Read>(ent: &tar::Entry<'_, R>) -> Entry {
        let header = ent.header();
        let path = String::from_utf8_lossy(&ent.path_bytes()).into_owned();
        let linkpath = ent
            .link_name_bytes()
            .map(|b| String::from_utf8_lossy(&b).into_owned());
        let mtime = header
            .mtime()
            .ok()
            .map(|m| FileTime::from_unix_time(m as i64, 0));
        // atime only exists in the GNU header extension
        let atime = header
            .as_gnu()
            .and_then(|g| g.atime().ok())
            .map(|a| FileTime::from_unix_time(a as i64, 0));
        Entry {
            kind: EntryKind::from_header(header),
            path,
            linkpath,
            mode: header.mode().ok(),
            uid: header.uid().ok().map(|v| v as u32),
            gid: header.gid().ok().map(|v| v as u32),
            mtime,
            atime,
            size: ent.size(),
            absolute: None,
            unsupported: false,
            payload: Vec::new(),
        }
    }
}
