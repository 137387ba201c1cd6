//! Transparent virtual filesystem: the mount-resolving overlay FTP
//! sessions see
//!
//! Mount points map absolute virtual paths onto native directories with a
//! per-mount access mode and recursion policy. The resolver picks the most
//! specific mount for any virtual path, substitutes the `:u`/`:h`
//! placeholders, and guarantees the result stays inside the mount.

pub mod entry;
pub mod mount;
pub mod resolver;

pub use entry::{Entry, EntryKind};
pub use mount::{
    join_virtual, normalize_virtual, MountAccess, MountPoint, MountTable, PathFormat, Recursion,
};
pub use resolver::{NativeTarget, Resolution, Tvfs, WriteMode};
