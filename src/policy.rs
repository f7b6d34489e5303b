//! Per-entry decisions: whether an entry goes into the archive, under which name, and with
//! which mode.
//!
//! Names are computed on raw bytes so that file names which aren't valid UTF-8 survive
//! unchanged.

use std::{
    ffi::OsString,
    os::unix::ffi::{OsStrExt, OsStringExt},
    path::{Path, PathBuf},
};

use log::debug;

use crate::config::{ModeOverride, ServeConfig};

/// Outcome of [`EntryPolicy::decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Included { emitted_name: PathBuf, mode: u32 },
    Excluded,
}

#[derive(Debug, Clone, Default)]
pub struct EntryPolicy {
    base_dir: PathBuf,
    rewrite_base_dir: Option<String>,
    exclude_extensions: Vec<String>,
    dir_mode: ModeOverride,
    file_mode: ModeOverride,
}

impl EntryPolicy {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    pub fn from_config(config: &ServeConfig) -> Self {
        Self {
            base_dir: config.root.clone(),
            rewrite_base_dir: config.rewrite_base_dir.clone(),
            exclude_extensions: config.exclude_extensions.clone(),
            dir_mode: config.dir_mode,
            file_mode: config.file_mode,
        }
    }

    pub fn with_rewrite(mut self, rewrite: impl Into<String>) -> Self {
        self.rewrite_base_dir = Some(rewrite.into());
        self
    }

    /// Extensions are matched including their leading dot, e.g. `.tmp`.
    pub fn with_excluded_extensions(
        mut self,
        extensions: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.exclude_extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_modes(mut self, dir_mode: ModeOverride, file_mode: ModeOverride) -> Self {
        self.dir_mode = dir_mode;
        self.file_mode = file_mode;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Decides how `path` appears in the archive.
    ///
    /// Rules, in order: files (never directories) whose extension is excluded are dropped; the
    /// name has the base directory replaced by the rewrite target, if any, and loses one
    /// leading `/`; the mode comes from the matching override or else from `fs_mode`.
    ///
    /// An entry whose name would end up empty is dropped too, since tar can't represent it.
    /// That happens for the root itself when serving `/` without a rewrite.
    pub fn decide(&self, path: &Path, is_dir: bool, fs_mode: u32) -> Decision {
        if !is_dir && self.is_excluded(path) {
            debug!("file '{}' excluded by file extension", path.display());
            return Decision::Excluded;
        }

        let emitted_name = self.emitted_name(path);
        if emitted_name.as_os_str().is_empty() {
            debug!("'{}' has no name inside the archive", path.display());
            return Decision::Excluded;
        }

        let mode = if is_dir {
            self.dir_mode.apply(fs_mode)
        } else {
            self.file_mode.apply(fs_mode)
        };

        Decision::Included { emitted_name, mode }
    }

    fn is_excluded(&self, path: &Path) -> bool {
        let Some(ext) = extension(path) else {
            return false;
        };
        self.exclude_extensions
            .iter()
            .any(|excluded| excluded.as_bytes() == ext)
    }

    /// Swaps the base directory for the rewrite target component-wise, so a base given as
    /// `/data/shared/` or `/data/./shared` matches the walked paths under it.
    fn emitted_name(&self, path: &Path) -> PathBuf {
        let renamed = match (&self.rewrite_base_dir, path.strip_prefix(&self.base_dir)) {
            (Some(rewrite), Ok(rest)) => {
                let mut name: PathBuf = Path::new(rewrite).components().collect();
                if !rest.as_os_str().is_empty() {
                    name.push(rest);
                }
                name
            }
            _ => path.to_path_buf(),
        };

        let mut bytes = renamed.into_os_string().into_vec();
        if bytes.first() == Some(&b'/') {
            bytes.remove(0);
        }
        PathBuf::from(OsString::from_vec(bytes))
    }
}

/// The last extension of the file name, dot included: `a.tar.gz` gives `.gz` and a dotfile
/// like `.log` counts as its own extension.
fn extension(path: &Path) -> Option<&[u8]> {
    let name = path.file_name()?.as_bytes();
    let dot = name.iter().rposition(|&b| b == b'.')?;
    Some(&name[dot..])
}
