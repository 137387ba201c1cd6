//! Mount points: virtual-path-to-native-path mappings with access policy

use crate::error::{FtpdError, Result};

/// Access mode granted by a mount point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MountAccess {
    /// The mount exists in configuration but serves nothing
    #[default]
    Disabled,
    /// Reads and listings only
    ReadOnly,
    /// Reads and writes
    ReadWrite,
}

/// How a mount applies to paths below its own virtual path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Recursion {
    /// The mount serves only its own virtual path; children fall through to
    /// shorter mounts
    #[default]
    None,
    /// The mount's access mode applies to everything below it
    ApplyPermissions,
    /// Like `ApplyPermissions`, plus create/delete/rename/mkdir/rmdir
    ApplyPermissionsAndAllowStructureModification,
}

/// Native path syntax rules to validate against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathFormat {
    /// Absolute Unix path, no embedded NUL
    Unix,
    /// Absolute Windows path (drive or UNC), no controls, no stray `:`,
    /// no trailing space or dot in any component
    Windows,
}

impl PathFormat {
    /// The format of the OS the server runs on
    pub fn host() -> Self {
        if cfg!(windows) {
            PathFormat::Windows
        } else {
            PathFormat::Unix
        }
    }
}

/// One virtual-to-native mapping
///
/// The native path may contain the placeholders `:u` (authenticated user
/// name) and `:h` (impersonation home directory). Substitution happens when
/// the mount table is bound to a logged-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    /// Absolute virtual path in Unix form, normalized at load time
    pub virtual_path: String,
    /// Native path template; may be empty only for disabled mounts
    pub native_path: String,
    /// Access granted through this mount
    pub access: MountAccess,
    /// Recursion policy
    pub recursion: Recursion,
    /// Create the native directory at bind time if it does not exist;
    /// failure disables the mount
    pub autocreate: bool,
}

/// A validated, conflict-free set of mount points
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountTable {
    mounts: Vec<MountPoint>,
}

impl MountTable {
    /// Build a table, normalizing virtual paths and rejecting duplicates
    /// and invalid native paths
    pub fn new(mounts: Vec<MountPoint>) -> Result<Self> {
        Self::with_format(mounts, PathFormat::host())
    }

    /// Like [`new`](Self::new) with an explicit native path format, so both
    /// syntaxes stay testable on any host
    pub fn with_format(mut mounts: Vec<MountPoint>, format: PathFormat) -> Result<Self> {
        for m in &mut mounts {
            m.virtual_path = normalize_virtual(&m.virtual_path);

            if m.access == MountAccess::Disabled && m.native_path.is_empty() {
                continue;
            }
            validate_native_path(&m.native_path, format)
                .map_err(|e| FtpdError::Config(format!("mount {:?}: {e}", m.virtual_path)))?;
        }

        for (i, a) in mounts.iter().enumerate() {
            if mounts[..i].iter().any(|b| b.virtual_path == a.virtual_path) {
                return Err(FtpdError::Config(format!(
                    "duplicate virtual path: {}",
                    a.virtual_path
                )));
            }
        }

        Ok(Self { mounts })
    }

    /// The validated mount points
    pub fn mounts(&self) -> &[MountPoint] {
        &self.mounts
    }

    /// Whether the table has no mounts at all
    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    /// Merge another table after this one; mappings already present win
    pub fn merge(&mut self, other: &MountTable) {
        for m in &other.mounts {
            if !self
                .mounts
                .iter()
                .any(|own| own.virtual_path == m.virtual_path)
            {
                self.mounts.push(m.clone());
            }
        }
    }
}

/// Normalize a virtual path to absolute Unix form
///
/// Collapses repeated slashes and `.` segments and resolves `..`
/// lexically, clamping at the root. Returns an empty string only for
/// input that is not absolute after trimming.
pub fn normalize_virtual(path: &str) -> String {
    let path = path.trim();
    let mut segments: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        "/".to_owned()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// Join a path argument against a current directory and normalize
pub fn join_virtual(cwd: &str, arg: &str) -> String {
    if arg.starts_with('/') {
        normalize_virtual(arg)
    } else {
        normalize_virtual(&format!("{cwd}/{arg}"))
    }
}

/// Split a normalized virtual path into its segments
pub fn virtual_segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Substitute the `:u` and `:h` placeholders in a native path template
///
/// Returns `None` when the template needs `:h` and no impersonation home
/// exists; such a mount is inaccessible for this user.
pub fn substitute_placeholders(template: &str, user: &str, home: Option<&str>) -> Option<String> {
    let mut out = template.replace(":u", user);
    if out.contains(":h") {
        let home = home?;
        if home.is_empty() {
            return None;
        }
        out = out.replace(":h", home);
    }
    Some(out)
}

fn validate_native_path(path: &str, format: PathFormat) -> std::result::Result<(), String> {
    match format {
        PathFormat::Unix => {
            if !path.starts_with('/') {
                return Err(format!("native path is not absolute: {path}"));
            }
            if path.contains('\0') {
                return Err("native path contains NUL".to_owned());
            }
            Ok(())
        }
        PathFormat::Windows => {
            let absolute = {
                let bytes = path.as_bytes();
                let drive = bytes.len() >= 3
                    && bytes[0].is_ascii_alphabetic()
                    && bytes[1] == b':'
                    && (bytes[2] == b'\\' || bytes[2] == b'/');
                let unc = path.starts_with("\\\\");
                drive || unc
            };
            if !absolute {
                return Err(format!("native path is not absolute: {path}"));
            }
            if path.chars().any(|c| (c as u32) < 0x20) {
                return Err("native path contains control characters".to_owned());
            }
            // Skip the drive designator when checking for stray colons.
            let body = if path.len() >= 2 && &path[1..2] == ":" {
                &path[2..]
            } else {
                path
            };
            if body.contains(':') {
                return Err("native path contains ':' inside a name".to_owned());
            }
            for component in body.split(['\\', '/']) {
                if component.ends_with(' ') || (component.ends_with('.') && component != ".") {
                    return Err(format!(
                        "native path component has a trailing space or dot: {component:?}"
                    ));
                }
            }
            Ok(())
        }
    }
}
