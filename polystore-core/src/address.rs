//! Uniform address abstraction across storage backends
//!
//! An [`Address`] is an immutable `{scheme, authority, segments}` value.
//! Three schemes exist: plain local paths (optionally written `file://...`),
//! flat object paths (`obs://bucket/key`), and dual-identity platform paths
//! (`plat://Project:/folder/name`). Dual-identity addresses are additionally
//! tagged [`Identity::Virtual`] or [`Identity::Canonical`]; converting
//! between the two is a backend lookup, never a parse.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::{StoreError, StoreResult};

/// Length of the opaque id portion of canonical identifiers
/// (`proj-<id>` / `obj-<id>`).
const CANONICAL_ID_LEN: usize = 24;

/// Storage scheme discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    Local,
    FlatObject,
    DualIdentity,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Local => "file",
            Scheme::FlatObject => "obs",
            Scheme::DualIdentity => "plat",
        }
    }
}

/// Identity tag for dual-identity addresses.
///
/// Exactly one tag holds at a time. A canonical project combined with a
/// virtual resource still counts as `Virtual` because resolving the
/// resource requires a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    Virtual,
    Canonical,
}

/// An address on one of the supported backends
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    scheme: Scheme,
    /// Bucket for flat-object addresses, project for dual-identity ones,
    /// empty for local paths.
    authority: String,
    segments: Vec<String>,
    /// Trailing-slash folder hint. Folders on the dual-identity backend
    /// are metadata only; a hinted address never canonicalizes.
    dir_hint: bool,
    /// Local paths only: whether the path is anchored at the filesystem root.
    absolute: bool,
}

/// Returns true when `s` has the shape of a canonical id with the given
/// prefix, e.g. `proj-` followed by 24 alphanumerics.
pub fn is_canonical_id(s: &str, prefix: &str) -> bool {
    match s.strip_prefix(prefix).and_then(|r| r.strip_prefix('-')) {
        Some(id) => id.len() == CANONICAL_ID_LEN && id.chars().all(|c| c.is_ascii_alphanumeric()),
        None => false,
    }
}

fn split_segments(path: &str) -> Vec<String> {
    let mut segments: Vec<String> = Vec::new();
    for part in path.split('/').filter(|s| !s.is_empty()) {
        if part == ".." {
            segments.pop();
        } else if part != "." {
            segments.push(part.to_string());
        }
    }
    segments
}

impl Address {
    fn build(
        scheme: Scheme,
        authority: impl Into<String>,
        path: &str,
        absolute: bool,
    ) -> Self {
        let segments = split_segments(path);
        // Roots are never folder-hinted; the hint only disambiguates
        // resource-bearing paths.
        let dir_hint = !segments.is_empty() && path.ends_with('/');
        Self {
            scheme,
            authority: authority.into(),
            segments,
            dir_hint,
            absolute,
        }
    }

    /// Local filesystem address
    pub fn local(path: impl AsRef<str>) -> Self {
        let path = path.as_ref();
        Self::build(Scheme::Local, "", path, path.starts_with('/'))
    }

    /// Flat object-store address (`obs://bucket/key`)
    pub fn flat(bucket: impl Into<String>, key: impl AsRef<str>) -> Self {
        Self::build(Scheme::FlatObject, bucket, key.as_ref(), false)
    }

    /// Dual-identity platform address (`plat://Project:/resource`)
    pub fn dual(project: impl Into<String>, resource: impl AsRef<str>) -> Self {
        Self::build(Scheme::DualIdentity, project, resource.as_ref(), false)
    }

    /// Parses a raw string into an address.
    ///
    /// Fails with [`StoreError::MalformedAddress`] when a flat-object
    /// address has no bucket, a dual-identity address lacks its `:`
    /// project delimiter, or the scheme is unknown.
    pub fn parse(raw: &str) -> StoreResult<Self> {
        if let Some(rest) = raw.strip_prefix("obs://") {
            let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(StoreError::MalformedAddress(format!(
                    "flat-object address has no bucket: {raw}"
                )));
            }
            return Ok(Self::build(Scheme::FlatObject, bucket, key, false));
        }

        if let Some(rest) = raw.strip_prefix("plat://") {
            let Some((project, resource)) = rest.split_once(':') else {
                return Err(StoreError::MalformedAddress(format!(
                    "dual-identity address has no project delimiter: {raw}"
                )));
            };
            if project.is_empty() {
                return Err(StoreError::MalformedAddress(format!(
                    "dual-identity address has no project: {raw}"
                )));
            }
            return Ok(Self::build(Scheme::DualIdentity, project, resource, false));
        }

        if let Some(rest) = raw.strip_prefix("file://") {
            return Ok(Self::local(rest));
        }

        if raw.contains("://") {
            return Err(StoreError::MalformedAddress(format!(
                "unknown scheme: {raw}"
            )));
        }

        Ok(Self::local(raw))
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Bucket or project component; empty for local paths.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Final path component, if any
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(|s| s.as_str())
    }

    pub fn ext(&self) -> Option<&str> {
        self.name().and_then(|n| n.rsplit_once('.')).map(|(_, e)| e)
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Whether the raw form carried a trailing slash
    pub fn is_dir_hint(&self) -> bool {
        self.dir_hint
    }

    /// A copy of this address with the folder hint set
    pub fn as_folder(&self) -> Self {
        let mut a = self.clone();
        a.dir_hint = !a.segments.is_empty();
        a
    }

    /// Object key within the bucket (flat-object addresses)
    pub fn key(&self) -> String {
        self.segments.join("/")
    }

    /// Resource path within the project (dual-identity addresses)
    pub fn resource(&self) -> String {
        self.segments.join("/")
    }

    /// Folder portion of a dual-identity resource, as `/a/b` (`/` at root)
    pub fn folder(&self) -> String {
        if self.segments.len() <= 1 {
            "/".to_string()
        } else {
            format!("/{}", self.segments[..self.segments.len() - 1].join("/"))
        }
    }

    /// Identity tag; `None` for non-dual schemes.
    pub fn identity(&self) -> Option<Identity> {
        if self.scheme != Scheme::DualIdentity {
            return None;
        }
        let project_canonical = is_canonical_id(&self.authority, "proj");
        let resource_canonical = match self.segments.as_slice() {
            [] => true,
            [only] => !self.dir_hint && is_canonical_id(only, "obj"),
            _ => false,
        };
        if project_canonical && resource_canonical {
            Some(Identity::Canonical)
        } else {
            Some(Identity::Virtual)
        }
    }

    /// Joins path components onto this address. Pure; performs no I/O.
    pub fn join(&self, part: impl AsRef<str>) -> Self {
        let part = part.as_ref();
        let mut joined = self.clone();
        for piece in part.split('/').filter(|s| !s.is_empty()) {
            if piece == ".." {
                joined.segments.pop();
            } else if piece != "." {
                joined.segments.push(piece.to_string());
            }
        }
        joined.dir_hint = !joined.segments.is_empty() && part.ends_with('/');
        joined
    }

    /// Parent address. The parent of a scheme root is the root itself.
    pub fn parent(&self) -> Self {
        let mut parent = self.clone();
        parent.segments.pop();
        parent.dir_hint = false;
        parent
    }

    /// Local addresses as a real filesystem path
    pub fn to_path_buf(&self) -> PathBuf {
        let mut p = PathBuf::new();
        if self.absolute {
            p.push("/");
        }
        for seg in &self.segments {
            p.push(seg);
        }
        p
    }

    /// Normalized string form. Equality and ordering are defined on this.
    pub fn normalized(&self) -> String {
        let hint = if self.dir_hint { "/" } else { "" };
        match self.scheme {
            Scheme::Local => {
                let body = self.segments.join("/");
                if self.absolute {
                    format!("/{body}{hint}")
                } else if body.is_empty() {
                    ".".to_string()
                } else {
                    format!("{body}{hint}")
                }
            }
            Scheme::FlatObject => {
                if self.segments.is_empty() {
                    format!("obs://{}", self.authority)
                } else {
                    format!("obs://{}/{}{hint}", self.authority, self.key())
                }
            }
            Scheme::DualIdentity => {
                format!("plat://{}:/{}{hint}", self.authority, self.resource())
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.normalized())
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.normalized().cmp(&other.normalized())
    }
}
