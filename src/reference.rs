use snafu::OptionExt;
use std::fmt;
use std::fmt::Formatter;
use std::str::FromStr;

use crate::error;

/// Represents a fully qualified pointer to one image on the registry:
/// namespace, repository, and a tag or digest reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Namespace the repository lives under, `library` for official images
    pub namespace: String,
    /// Repository name
    pub repository: String,
    /// Reference to the object, usually a tag ':tag' or digest '@digest'
    pub reference: Reference,
}

impl FromStr for ImageRef {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, reference) = if let Some((path, digest)) = s.split_once('@') {
            (path, Reference::from_str(digest)?)
        } else if let Some((path, tag)) = s.split_once(':') {
            (path, Reference::Tag(tag.to_string()))
        } else {
            (s, Reference::Tag("latest".to_string()))
        };
        snafu::ensure!(
            !path.is_empty(),
            error::MalformedReferenceSnafu {
                reason: "no repository was provided",
            }
        );
        let (namespace, repository) = match path.split_once('/') {
            Some((namespace, repository)) => (namespace.to_string(), repository.to_string()),
            // Bare names resolve under the official images namespace
            None => ("library".to_string(), path.to_string()),
        };
        snafu::ensure!(
            !repository.is_empty() && !namespace.is_empty(),
            error::MalformedReferenceSnafu {
                reason: "namespace and repository must both be non-empty",
            }
        );
        Ok(Self {
            namespace,
            repository,
            reference,
        })
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "{}/{}{}",
            self.namespace,
            self.repository,
            match &self.reference {
                Reference::Tag(tag) => format!(":{tag}"),
                Reference::Digest { algorithm, value } => format!("@{algorithm}:{value}"),
            }
        ))
    }
}

/// Represents a reference to a specific object via a tag or digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Tag(String),
    Digest { algorithm: Algorithm, value: String },
}

impl FromStr for Reference {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(':') {
            let (algorithm, value) = s.split_once(':').context(
                error::MalformedReferenceSnafu {
                    reason: "no algorithm was provided for the digest",
                },
            )?;
            Ok(Self::Digest {
                algorithm: Algorithm::from_str(algorithm)?,
                value: value.to_string(),
            })
        } else {
            Ok(Self::Tag(s.to_string()))
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tag(tag) => f.write_str(tag),
            Self::Digest { algorithm, value } => {
                f.write_fmt(format_args!("{}:{}", algorithm, value))
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Algorithm {
    #[default]
    Sha256,
    Sha512,
}

impl FromStr for Algorithm {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            _ => crate::error::InvalidAlgorithmSnafu {
                algorithm: s.to_string(),
            }
            .fail(),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => f.write_str("sha256"),
            Self::Sha512 => f.write_str("sha512"),
        }
    }
}
