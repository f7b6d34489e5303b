//! Service configuration.
//!
//! [`ServeConfig`] is built once at startup (by the `tarserve` binary from its command line, or
//! directly by tests) and checked with [`ServeConfig::validate`].  Every malformed value is
//! reported there as [`Error::Config`]; nothing in here is re-checked per request.

use std::{
    fmt,
    num::NonZeroU64,
    path::{Component, Path, PathBuf},
    str::FromStr,
};

use crate::{Error, Result};

/// Highest permission value a tar header mode override may carry.
const MODE_MASK: u32 = 0o7777;

/// The single username/password pair accepted by the service.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Parses the `--basic-auth` value.  An empty string disables authentication.
    pub fn parse_optional(value: &str) -> Result<Option<Self>> {
        if value.is_empty() {
            Ok(None)
        } else {
            value.parse().map(Some)
        }
    }
}

impl FromStr for Credentials {
    type Err = Error;

    /// Splits `user:password` on the first colon; the password may contain more colons.
    fn from_str(value: &str) -> Result<Self> {
        let Some((username, password)) = value.split_once(':') else {
            return Err(Error::Config(
                "basic auth credentials must be in the format `user:password`".into(),
            ));
        };
        Ok(Self::new(username, password))
    }
}

// Keep the password out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A forced permission mode for directories or files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModeOverride {
    /// Report whatever the filesystem says.
    #[default]
    Keep,
    /// Report this mode for every entry of the kind.
    Force(u32),
}

impl ModeOverride {
    /// Converts a signed flag value: negative means [`ModeOverride::Keep`].
    pub fn from_raw(raw: i64) -> Result<Self> {
        if raw < 0 {
            return Ok(ModeOverride::Keep);
        }
        match u32::try_from(raw) {
            Ok(mode) if mode <= MODE_MASK => Ok(ModeOverride::Force(mode)),
            _ => Err(Error::Config(format!(
                "mode {raw:#o} is out of range (maximum {MODE_MASK:#o})"
            ))),
        }
    }

    /// Applies the override to a mode read from the filesystem.
    pub fn apply(self, fs_mode: u32) -> u32 {
        match self {
            ModeOverride::Keep => fs_mode & MODE_MASK,
            ModeOverride::Force(mode) => mode,
        }
    }
}

/// Parses an integer flag the way C-style flag parsers do: `0x` is hex, `0o` or a bare leading
/// `0` is octal, anything else decimal.  An optional sign comes first.
pub fn parse_int_flag(value: &str) -> Result<i64> {
    let trimmed = value.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };

    let parsed = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16)
    } else if let Some(oct) = digits
        .strip_prefix("0o")
        .or_else(|| digits.strip_prefix("0O"))
    {
        i64::from_str_radix(oct, 8)
    } else if digits.len() > 1 && digits.starts_with('0') {
        i64::from_str_radix(&digits[1..], 8)
    } else {
        digits.parse::<i64>()
    };

    let magnitude =
        parsed.map_err(|err| Error::Config(format!("invalid integer {value:?}: {err}")))?;
    Ok(if negative { -magnitude } else { magnitude })
}

/// Everything the service needs to know, validated once at startup.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    /// Directory whose subtree is archived.
    pub root: PathBuf,
    /// HTTP path the archive is served on.
    pub url_path: String,
    /// Address to listen on.
    pub listen: String,
    pub port: u16,
    pub dir_mode: ModeOverride,
    pub file_mode: ModeOverride,
    /// `None` disables authentication.
    pub credentials: Option<Credentials>,
    /// Client-facing replacement for `root` in emitted names.
    pub rewrite_base_dir: Option<String>,
    pub exclude_extensions: Vec<String>,
    /// Shut down after this many completed downloads.
    pub quit_after: Option<NonZeroU64>,
}

impl ServeConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            url_path: "/".into(),
            listen: "0.0.0.0".into(),
            port: 8080,
            dir_mode: ModeOverride::Keep,
            file_mode: ModeOverride::Keep,
            credentials: None,
            rewrite_base_dir: None,
            exclude_extensions: Vec::new(),
            quit_after: None,
        }
    }

    /// Checks the configuration.  The root loses trailing separators and `.` components, and
    /// the extension list is normalized to `.ext` form.
    pub fn validate(mut self) -> Result<Self> {
        check_url_path(&self.url_path)?;

        self.root = self.root.components().collect();

        let metadata = std::fs::metadata(&self.root).map_err(|err| {
            Error::Config(format!("cannot serve {}: {err}", self.root.display()))
        })?;
        if !metadata.is_dir() {
            return Err(Error::Config(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }

        if self.rewrite_base_dir.is_none() && has_parent_component(&self.root) {
            return Err(Error::Config(format!(
                "{} contains '..', which cannot appear in archive names; use --rewrite-base-dir",
                self.root.display()
            )));
        }

        if let Some(rewrite) = &self.rewrite_base_dir {
            if has_parent_component(Path::new(rewrite)) {
                return Err(Error::Config(format!(
                    "rewrite target {rewrite:?} must not contain '..'"
                )));
            }
        }

        self.exclude_extensions = self
            .exclude_extensions
            .into_iter()
            .map(|ext| normalize_extension(&ext))
            .collect::<Result<_>>()?;

        Ok(self)
    }
}

/// The url is mounted as a fixed route, so it must not contain anything the router would read
/// as a parameter or wildcard.
fn check_url_path(url_path: &str) -> Result<()> {
    if !url_path.starts_with('/') {
        return Err(Error::Config(format!("url {url_path:?} must start with '/'")));
    }
    if url_path.contains([':', '*', '{', '}']) {
        return Err(Error::Config(format!(
            "url {url_path:?} must be a plain path without ':', '*', '{{' or '}}'"
        )));
    }
    Ok(())
}

fn has_parent_component(path: &Path) -> bool {
    path.components().any(|c| c == Component::ParentDir)
}

fn normalize_extension(ext: &str) -> Result<String> {
    let bare = ext.strip_prefix('.').unwrap_or(ext);
    if bare.is_empty() || bare.contains(['.', '/']) {
        return Err(Error::Config(format!("invalid extension {ext:?}")));
    }
    Ok(format!(".{bare}"))
}
