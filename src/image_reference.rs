use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_NAMESPACE: &str = "library";
pub const DEFAULT_TAG: &str = "latest";

/// Tag or digest part of an image reference. Exactly one is present after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Tag(String),
    Digest(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// `None` means the default public registry (Docker Hub)
    pub registry: Option<String>,
    pub namespace: String,
    pub repository: String,
    pub reference: Reference,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    InvalidFormat(String),
    EmptySegment(String),
    MissingRepository(String),
    MissingTag(String),
    MissingDigest(String),
}

impl std::error::Error for ParseError {}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::InvalidFormat(image) => write!(f, "invalid image format: {:?}", image),
            ParseError::EmptySegment(image) => {
                write!(f, "image {:?} contains an empty path segment", image)
            }
            ParseError::MissingRepository(image) => {
                write!(f, "repository is missing in image {:?}", image)
            }
            ParseError::MissingTag(image) => write!(f, "tag is empty in image {:?}", image),
            ParseError::MissingDigest(image) => write!(f, "digest is empty in image {:?}", image),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(registry) = self.registry.as_deref().filter(|r| !r.is_empty()) {
            write!(f, "{}/", registry)?;
        }
        if !self.namespace.is_empty() {
            write!(f, "{}/", self.namespace)?;
        }
        write!(f, "{}", self.repository)?;
        match &self.reference {
            Reference::Digest(digest) => write!(f, "@{}", digest),
            Reference::Tag(tag) => write!(f, ":{}", tag),
        }
    }
}

impl Serialize for ImageReference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromStr for ImageReference {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl ImageReference {
    /// Parses `[registry/][namespace/]repository[(@digest|:tag)]`.
    ///
    /// With two path segments the first one is taken as a registry host when it contains
    /// a `:` or `.`, otherwise as a namespace. This is a heuristic: a namespace containing
    /// a dot (`my.team/app`) is read as a registry host.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let segments: Vec<&str> = s.split('/').collect();

        let (registry, namespace, name) = match segments.as_slice() {
            [name] => (None, DEFAULT_NAMESPACE, *name),
            [first, name] if first.contains([':', '.']) => {
                (Some(*first), DEFAULT_NAMESPACE, *name)
            }
            [namespace, name] => (None, *namespace, *name),
            [registry, namespace, name] => (Some(*registry), *namespace, *name),
            _ => return Err(ParseError::InvalidFormat(s.to_string())),
        };

        if s.is_empty() {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }
        if registry.is_some_and(str::is_empty) || namespace.is_empty() {
            return Err(ParseError::EmptySegment(s.to_string()));
        }

        // digest wins over tag: "app:1.0@sha256:..." keeps "app:1.0" as repository candidate
        let (repository, reference) = if let Some((repository, digest)) = name.split_once('@') {
            if digest.is_empty() {
                return Err(ParseError::MissingDigest(s.to_string()));
            }
            (repository, Reference::Digest(digest.to_string()))
        } else if let Some((repository, tag)) = name.split_once(':') {
            if tag.is_empty() {
                return Err(ParseError::MissingTag(s.to_string()));
            }
            (repository, Reference::Tag(tag.to_string()))
        } else {
            (name, Reference::Tag(DEFAULT_TAG.to_string()))
        };

        if repository.is_empty() {
            return Err(ParseError::MissingRepository(s.to_string()));
        }

        Ok(Self {
            registry: registry.map(str::to_string),
            namespace: namespace.to_string(),
            repository: repository.to_string(),
            reference,
        })
    }

    /// Registry host used as cache key, empty for the default registry
    pub fn registry_host(&self) -> &str {
        self.registry.as_deref().unwrap_or("")
    }

    /// Repository path as used by the registry API, e.g. `library/nginx`
    pub fn repository_path(&self) -> String {
        format!("{}/{}", self.namespace, self.repository)
    }
}
