//! Virtual path resolution and the filesystem facade sessions talk to
//!
//! A [`Tvfs`] is a mount table bound to one authenticated user: placeholders
//! substituted, autocreate applied, everything ready to resolve virtual
//! paths into native operations. Resolution never touches the filesystem;
//! only the operations themselves do.

use crate::error::{FtpdError, Result};
use crate::tvfs::entry::{Entry, EntryKind};
use crate::tvfs::mount::{
    normalize_virtual, substitute_placeholders, virtual_segments, MountAccess, MountTable,
    Recursion,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tracing::{debug, warn};

/// Outcome of resolving a virtual path
#[derive(Debug)]
pub enum Resolution {
    /// No mount serves the path
    NotFound,
    /// A browsable virtual directory with no native backing: the root, or
    /// an intermediate segment on the way to a deeper mount
    Virtual,
    /// A native target under some mount
    Native(NativeTarget),
}

/// A resolved native path with its effective permissions
#[derive(Debug)]
pub struct NativeTarget {
    /// The substituted, joined native path
    pub path: PathBuf,
    /// Effective access through the chosen mount
    pub access: MountAccess,
    /// Whether create/delete/rename/mkdir/rmdir are allowed here
    pub structure: bool,
    /// True when the path is the mount's own virtual path
    pub is_mount_root: bool,
}

/// How `open_write` should position and create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Truncate or create (STOR)
    Truncate,
    /// Append to the end (APPE)
    Append,
    /// Write starting at a byte offset (STOR after REST)
    Offset(u64),
}

#[derive(Debug)]
struct BoundMount {
    segments: Vec<String>,
    native: Option<PathBuf>,
    access: MountAccess,
    recursion: Recursion,
    autocreate: bool,
}

#[derive(Debug, Default)]
struct SyntheticChildren {
    /// Names masked off the native listing
    shadowed: BTreeSet<String>,
    /// Entries for direct child mounts, keyed by name
    direct: BTreeMap<String, Entry>,
    /// First segments of deeper mounts below the listed directory
    intermediate: BTreeSet<String>,
}

/// A mount table bound to one user
#[derive(Debug)]
pub struct Tvfs {
    mounts: Vec<BoundMount>,
}

impl Tvfs {
    /// Bind a table for `user`, substituting placeholders
    ///
    /// A mount whose template needs `:h` while the user has no
    /// impersonation home becomes inaccessible rather than an error.
    pub fn bind(table: &MountTable, user: &str, home: Option<&str>) -> Self {
        let mounts = table
            .mounts()
            .iter()
            .map(|m| BoundMount {
                segments: virtual_segments(&m.virtual_path),
                native: if m.access == MountAccess::Disabled {
                    None
                } else {
                    substitute_placeholders(&m.native_path, user, home).map(PathBuf::from)
                },
                access: m.access,
                recursion: m.recursion,
                autocreate: m.autocreate,
            })
            .collect();
        Self { mounts }
    }

    /// Create missing native directories for autocreate mounts
    ///
    /// A mount whose directory cannot be created is disabled for this
    /// session; the failure is logged, not fatal.
    pub async fn prepare(&mut self) {
        for m in &mut self.mounts {
            if !m.autocreate {
                continue;
            }
            let Some(native) = m.native.clone() else {
                continue;
            };
            if tokio::fs::metadata(&native).await.is_ok() {
                continue;
            }
            if let Err(e) = tokio::fs::create_dir_all(&native).await {
                warn!(path = %native.display(), "autocreate failed, disabling mount: {e}");
                m.native = None;
                m.access = MountAccess::Disabled;
            } else {
                debug!(path = %native.display(), "autocreated mount directory");
            }
        }
    }

    /// Resolve a virtual path without touching the filesystem
    pub fn resolve(&self, vpath: &str) -> Resolution {
        let normalized = normalize_virtual(vpath);
        let segs = virtual_segments(&normalized);

        // Most specific mount first; a `recursion = none` mount only serves
        // its own path, children fall through to shorter prefixes.
        let mut candidates: Vec<&BoundMount> = self
            .mounts
            .iter()
            .filter(|m| m.segments.len() <= segs.len() && segs[..m.segments.len()] == m.segments[..])
            .collect();
        candidates.sort_by(|a, b| b.segments.len().cmp(&a.segments.len()));

        for m in candidates {
            let exact = m.segments.len() == segs.len();
            if !exact && m.recursion == Recursion::None {
                continue;
            }
            if m.access == MountAccess::Disabled {
                return Resolution::NotFound;
            }
            let Some(native) = &m.native else {
                return Resolution::NotFound;
            };

            let residual = &segs[m.segments.len()..];
            let mut path = native.clone();
            for seg in residual {
                if !valid_native_segment(seg) {
                    return Resolution::NotFound;
                }
                path.push(seg);
            }

            return Resolution::Native(NativeTarget {
                path,
                access: m.access,
                structure: !exact
                    && m.recursion == Recursion::ApplyPermissionsAndAllowStructureModification,
                is_mount_root: exact,
            });
        }

        // The root and intermediate segments of deeper mounts are always
        // browsable.
        if segs.is_empty() || self.has_descendant_mount(&segs) {
            return Resolution::Virtual;
        }

        Resolution::NotFound
    }

    fn has_descendant_mount(&self, segs: &[String]) -> bool {
        self.mounts
            .iter()
            .any(|m| m.segments.len() > segs.len() && m.segments[..segs.len()] == *segs)
    }

    /// Synthetic children for a listing of `segs`
    ///
    /// Direct child mounts shadow native entries of the same name and, when
    /// not disabled, contribute an entry carrying the mount's access bits.
    /// Deeper mounts contribute a read-only intermediate directory unless
    /// something else already claims the name.
    fn synthetic_children(&self, segs: &[String]) -> SyntheticChildren {
        let mut out = SyntheticChildren::default();
        for m in &self.mounts {
            if m.segments.len() <= segs.len() || m.segments[..segs.len()] != *segs {
                continue;
            }
            let name = m.segments[segs.len()].clone();
            if m.segments.len() == segs.len() + 1 {
                out.shadowed.insert(name.clone());
                if m.access != MountAccess::Disabled {
                    out.direct.insert(
                        name.clone(),
                        Entry::synthetic_dir(name, m.access == MountAccess::ReadWrite),
                    );
                }
            } else {
                out.intermediate.insert(name);
            }
        }
        out
    }

    /// List a virtual directory: native entries plus synthetic child
    /// mounts, which shadow native entries of the same name
    pub async fn list(&self, vpath: &str) -> Result<Vec<Entry>> {
        let normalized = normalize_virtual(vpath);
        let segs = virtual_segments(&normalized);

        let synthetic = self.synthetic_children(&segs);
        let mut entries: Vec<Entry> = Vec::new();

        match self.resolve(&normalized) {
            Resolution::Native(target) => {
                let writable = target.access == MountAccess::ReadWrite;
                let meta = tokio::fs::metadata(&target.path)
                    .await
                    .map_err(|_| FtpdError::PathNotFound(normalized.clone()))?;
                if !meta.is_dir() {
                    return Err(FtpdError::PathNotFound(normalized.clone()));
                }
                let mut dir = tokio::fs::read_dir(&target.path).await?;
                while let Some(item) = dir.next_entry().await? {
                    let name = item.file_name().to_string_lossy().into_owned();
                    if synthetic.shadowed.contains(&name) {
                        continue; // shadowed by a mount
                    }
                    if let Ok(meta) = item.metadata().await {
                        entries.push(Entry::from_metadata(name, &meta, writable));
                    }
                }
            }
            Resolution::Virtual => {}
            Resolution::NotFound => return Err(FtpdError::PathNotFound(normalized)),
        }

        entries.extend(synthetic.direct.into_values());
        for name in synthetic.intermediate {
            if !entries.iter().any(|e| e.name == name) {
                entries.push(Entry::synthetic_dir(name, false));
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Stat one virtual path
    pub async fn stat(&self, vpath: &str) -> Result<Entry> {
        let normalized = normalize_virtual(vpath);
        match self.resolve(&normalized) {
            Resolution::Native(target) => {
                let meta = tokio::fs::metadata(&target.path)
                    .await
                    .map_err(|_| FtpdError::PathNotFound(normalized.clone()))?;
                let name = virtual_segments(&normalized)
                    .last()
                    .cloned()
                    .unwrap_or_else(|| "/".to_owned());
                Ok(Entry::from_metadata(
                    name,
                    &meta,
                    target.access == MountAccess::ReadWrite,
                ))
            }
            Resolution::Virtual => {
                let name = virtual_segments(&normalized)
                    .last()
                    .cloned()
                    .unwrap_or_else(|| "/".to_owned());
                Ok(Entry::synthetic_dir(name, false))
            }
            Resolution::NotFound => Err(FtpdError::PathNotFound(normalized)),
        }
    }

    /// Open a file for download, positioned at `offset`
    pub async fn open_read(&self, vpath: &str, offset: u64) -> Result<(File, Entry)> {
        let normalized = normalize_virtual(vpath);
        match self.resolve(&normalized) {
            Resolution::Native(target) => {
                let entry = self.stat(&normalized).await?;
                if entry.kind != EntryKind::File {
                    return Err(FtpdError::PathNotFound(normalized));
                }
                let mut file = File::open(&target.path).await?;
                if offset > 0 {
                    use tokio::io::AsyncSeekExt;
                    file.seek(std::io::SeekFrom::Start(offset)).await?;
                }
                Ok((file, entry))
            }
            Resolution::Virtual => Err(FtpdError::PathNotFound(normalized)),
            Resolution::NotFound => Err(FtpdError::PathNotFound(normalized)),
        }
    }

    /// Open a file for upload
    ///
    /// Overwriting an existing file needs read-write access; creating a new
    /// one additionally needs structure modification rights.
    pub async fn open_write(&self, vpath: &str, mode: WriteMode) -> Result<File> {
        let normalized = normalize_virtual(vpath);
        let target = match self.resolve(&normalized) {
            Resolution::Native(t) => t,
            _ => return Err(FtpdError::PathNotFound(normalized)),
        };
        if target.access != MountAccess::ReadWrite || target.is_mount_root {
            return Err(FtpdError::AccessDenied(normalized));
        }

        let exists = tokio::fs::metadata(&target.path).await.is_ok();
        if !exists && !target.structure {
            return Err(FtpdError::AccessDenied(normalized));
        }

        let mut opts = OpenOptions::new();
        opts.write(true).create(true);
        if mode == WriteMode::Truncate {
            opts.truncate(true);
        }
        let mut file = opts.open(&target.path).await?;

        use tokio::io::AsyncSeekExt;
        match mode {
            WriteMode::Truncate => {}
            WriteMode::Append => {
                file.seek(std::io::SeekFrom::End(0)).await?;
            }
            WriteMode::Offset(off) => {
                file.seek(std::io::SeekFrom::Start(off)).await?;
            }
        }
        Ok(file)
    }

    /// Create a directory
    pub async fn make_dir(&self, vpath: &str) -> Result<()> {
        let target = self.structure_target(vpath)?;
        tokio::fs::create_dir(&target.path).await?;
        Ok(())
    }

    /// Remove an empty directory
    pub async fn remove_dir(&self, vpath: &str) -> Result<()> {
        let target = self.structure_target(vpath)?;
        tokio::fs::remove_dir(&target.path).await?;
        Ok(())
    }

    /// Delete a file
    pub async fn remove_file(&self, vpath: &str) -> Result<()> {
        let target = self.structure_target(vpath)?;
        tokio::fs::remove_file(&target.path).await?;
        Ok(())
    }

    /// Rename within the virtual tree; both ends need structure rights
    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let src = self.structure_target(from)?;
        let dst = self.structure_target(to)?;
        tokio::fs::rename(&src.path, &dst.path).await?;
        Ok(())
    }

    fn structure_target(&self, vpath: &str) -> Result<NativeTarget> {
        let normalized = normalize_virtual(vpath);
        match self.resolve(&normalized) {
            Resolution::Native(t) => {
                if t.is_mount_root {
                    // Mount roots are configuration, not data.
                    return Err(FtpdError::AccessDenied(normalized));
                }
                if t.access != MountAccess::ReadWrite || !t.structure {
                    return Err(FtpdError::AccessDenied(normalized));
                }
                Ok(t)
            }
            Resolution::Virtual => Err(FtpdError::AccessDenied(normalized)),
            Resolution::NotFound => Err(FtpdError::PathNotFound(normalized)),
        }
    }
}

// Residual virtual segments become native path components verbatim; anything
// that could re-route the join is refused before any filesystem call.
fn valid_native_segment(seg: &str) -> bool {
    !(seg.is_empty()
        || seg == "."
        || seg == ".."
        || seg.contains('/')
        || seg.contains('\\')
        || seg.contains('\0'))
}
