//! Absolute namespace paths.
//!
//! A [`Path`] is an immutable sequence of name components; the root is the
//! empty sequence. Paths are only ever interpreted relative to the namespace
//! root, never to a local directory, so `.` and `..` are not accepted.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::status::Status;
use crate::status_code::StatusCode;

/// Separator between components in the textual form.
pub const SEPARATOR: char = '/';

/// An absolute path in the namespace.
///
/// Ordering is component-wise lexicographic, so a directory sorts before
/// everything underneath it.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Path {
    components: Vec<String>,
}

/// Errors produced when building a [`Path`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathParseError {
    #[error("path must start with '/': {0:?}")]
    NotAbsolute(String),
    #[error("invalid path component: {0:?}")]
    InvalidComponent(String),
}

impl From<PathParseError> for Status {
    fn from(err: PathParseError) -> Self {
        Status::with_message(StatusCode::INVALID_ARG, err.to_string())
    }
}

fn check_component(name: &str) -> Result<(), PathParseError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(SEPARATOR)
        || name.contains('\0')
    {
        return Err(PathParseError::InvalidComponent(name.to_string()));
    }
    Ok(())
}

impl Path {
    /// The root directory `/`.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse the textual form `/a/b/c`. Repeated and trailing separators are
    /// collapsed, so `//a//b/` is `/a/b`.
    pub fn parse(s: &str) -> Result<Self, PathParseError> {
        let rest = s
            .strip_prefix(SEPARATOR)
            .ok_or_else(|| PathParseError::NotAbsolute(s.to_string()))?;
        let mut components = Vec::new();
        for part in rest.split(SEPARATOR).filter(|p| !p.is_empty()) {
            check_component(part)?;
            components.push(part.to_string());
        }
        Ok(Self { components })
    }

    /// Build a path from already-split components.
    pub fn from_components<I, S>(parts: I) -> Result<Self, PathParseError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut components = Vec::new();
        for part in parts {
            let part = part.into();
            check_component(&part)?;
            components.push(part);
        }
        Ok(Self { components })
    }

    /// The path of `name` inside this directory.
    pub fn child(&self, name: &str) -> Result<Self, PathParseError> {
        check_component(name)?;
        let mut components = self.components.clone();
        components.push(name.to_string());
        Ok(Self { components })
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Number of components; the root has depth 0.
    pub fn depth(&self) -> usize {
        self.components.len()
    }

    /// The containing directory, or `None` for the root.
    pub fn parent(&self) -> Option<Path> {
        let (_, init) = self.components.split_last()?;
        Some(Self {
            components: init.to_vec(),
        })
    }

    /// The final component, or `None` for the root.
    pub fn last(&self) -> Option<&str> {
        self.components.last().map(String::as_str)
    }

    pub fn components(&self) -> impl ExactSizeIterator<Item = &str> + DoubleEndedIterator {
        self.components.iter().map(String::as_str)
    }

    /// The first `len` components of this path.
    pub fn prefix(&self, len: usize) -> Path {
        Self {
            components: self.components[..len.min(self.components.len())].to_vec(),
        }
    }

    /// Strict ancestors, root first: `/a/b/c` yields `/`, `/a`, `/a/b`.
    pub fn ancestors(&self) -> Vec<Path> {
        (0..self.depth()).map(|len| self.prefix(len)).collect()
    }

    /// Concatenate `other` below this path.
    pub fn join(&self, other: &Path) -> Path {
        let mut components = self.components.clone();
        components.extend(other.components.iter().cloned());
        Self { components }
    }

    /// Whether this path equals `other` or lies underneath it.
    pub fn is_subpath_of(&self, other: &Path) -> bool {
        self.components.starts_with(&other.components)
    }
}

impl<'a> IntoIterator for &'a Path {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.components.iter()
    }
}

impl FromStr for Path {
    type Err = PathParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Path::parse(s)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str("/");
        }
        for c in &self.components {
            write!(f, "/{}", c)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({})", self)
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Path::parse(&s).map_err(serde::de::Error::custom)
    }
}
