//! Instance snapshots and target resolution.
//!
//! Targets are named on the command line either by instance identifier
//! (`i-0abc…`) or by their `Name` tag. Name lookups can be ambiguous; the
//! choice is delegated to a [`Selector`] so the resolution logic never
//! depends on how the operator is asked.

use std::fmt;
use std::net::IpAddr;

use thiserror::Error;

use crate::cloud::{CloudError, InstanceCatalog};

/// Agent reachability as reported by the session broker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Reachability {
    /// The agent is connected and accepting commands.
    Online,
    /// The agent was registered but has stopped responding.
    ConnectionLost,
    /// No agent is registered for the instance.
    NoAgent,
    /// A status value this crate does not recognise.
    Unknown(String),
}

impl Reachability {
    /// Maps a raw ping status onto a variant, preserving unexpected values.
    #[must_use]
    pub fn from_raw(raw: &str) -> Self {
        match raw {
            "Online" => Self::Online,
            "ConnectionLost" => Self::ConnectionLost,
            "" => Self::NoAgent,
            other => Self::Unknown(other.to_owned()),
        }
    }
}

impl fmt::Display for Reachability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => f.write_str("online"),
            Self::ConnectionLost => f.write_str("connection-lost"),
            Self::NoAgent => f.write_str("no-agent"),
            Self::Unknown(raw) => write!(f, "unknown({raw})"),
        }
    }
}

/// Operating system family of an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Platform {
    /// Linux and other POSIX shells.
    Linux,
    /// Windows (PowerShell agent documents).
    Windows,
    /// A platform string this crate does not recognise.
    Other(String),
}

impl Platform {
    /// Maps a raw platform string onto a variant.
    #[must_use]
    pub fn from_raw(raw: &str) -> Self {
        let lowered = raw.to_ascii_lowercase();
        if lowered.contains("windows") {
            Self::Windows
        } else if lowered.contains("linux")
            || lowered.contains("ubuntu")
            || lowered.contains("red hat")
        {
            Self::Linux
        } else {
            Self::Other(raw.to_owned())
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linux => f.write_str("linux"),
            Self::Windows => f.write_str("windows"),
            Self::Other(raw) => f.write_str(raw),
        }
    }
}

/// Read-only snapshot of a compute instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instance {
    /// Provider instance identifier.
    pub id: String,
    /// Value of the `Name` tag, when present.
    pub name: Option<String>,
    /// Agent reachability.
    pub reachability: Reachability,
    /// Operating system family.
    pub platform: Platform,
    /// Private address, when known.
    pub address: Option<IpAddr>,
    /// Role assumed by the instance; ephemeral grants are attached to it.
    pub iam_role: Option<String>,
}

impl Instance {
    /// Display label combining the name tag and identifier.
    #[must_use]
    pub fn label(&self) -> String {
        self.name
            .as_ref()
            .map_or_else(|| self.id.clone(), |name| format!("{name} ({})", self.id))
    }
}

/// Raised when the operator declines to choose between candidates.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("selection cancelled")]
pub struct SelectionCancelled;

/// Chooses one instance out of several matching candidates.
pub trait Selector {
    /// Returns the index of the chosen item.
    ///
    /// # Errors
    ///
    /// Returns [`SelectionCancelled`] when no choice was made.
    fn select(&self, items: &[Instance]) -> Result<usize, SelectionCancelled>;
}

/// Errors raised while resolving a target.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Raised when no instance matches the target.
    #[error("no instance matches '{target}'")]
    NotFound {
        /// Identifier or name supplied by the caller.
        target: String,
    },
    /// Raised when the selector was cancelled.
    #[error("target '{target}' is ambiguous and no instance was chosen")]
    Cancelled {
        /// Identifier or name supplied by the caller.
        target: String,
    },
    /// Raised when the selector returns an index out of range.
    #[error("selector returned index {index} for {count} candidates")]
    InvalidSelection {
        /// Returned index.
        index: usize,
        /// Number of candidates offered.
        count: usize,
    },
    /// Raised when the catalog fails.
    #[error("instance catalog failed: {0}")]
    Catalog(#[from] CloudError),
}

/// Returns `true` when `target` looks like a provider instance identifier.
#[must_use]
pub fn is_instance_id(target: &str) -> bool {
    target
        .strip_prefix("i-")
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|ch| ch.is_ascii_hexdigit()))
}

/// Resolves `target` to a fully described instance.
///
/// # Errors
///
/// Returns [`ResolveError`] when nothing matches, the selection is cancelled,
/// or the catalog fails.
pub async fn resolve_target<C, S>(
    catalog: &C,
    selector: &S,
    target: &str,
) -> Result<Instance, ResolveError>
where
    C: InstanceCatalog + ?Sized,
    S: Selector + ?Sized,
{
    let trimmed = target.trim();
    let chosen_id = if is_instance_id(trimmed) {
        trimmed.to_owned()
    } else {
        let mut candidates = catalog
            .list_instances()
            .await?
            .into_iter()
            .filter(|instance| instance.name.as_deref() == Some(trimmed))
            .collect::<Vec<_>>();
        match candidates.len() {
            0 => {
                return Err(ResolveError::NotFound {
                    target: trimmed.to_owned(),
                });
            }
            1 => candidates.remove(0).id,
            count => {
                let index = selector
                    .select(&candidates)
                    .map_err(|SelectionCancelled| ResolveError::Cancelled {
                        target: trimmed.to_owned(),
                    })?;
                if index >= count {
                    return Err(ResolveError::InvalidSelection { index, count });
                }
                candidates.swap_remove(index).id
            }
        }
    };

    catalog
        .describe_instance(&chosen_id)
        .await?
        .ok_or(ResolveError::NotFound { target: chosen_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeCloud, instance};
    use rstest::rstest;

    struct PickSecond;

    impl Selector for PickSecond {
        fn select(&self, _items: &[Instance]) -> Result<usize, SelectionCancelled> {
            Ok(1)
        }
    }

    struct Decline;

    impl Selector for Decline {
        fn select(&self, _items: &[Instance]) -> Result<usize, SelectionCancelled> {
            Err(SelectionCancelled)
        }
    }

    #[rstest]
    #[case("Online", Reachability::Online)]
    #[case("ConnectionLost", Reachability::ConnectionLost)]
    #[case("", Reachability::NoAgent)]
    #[case("Inactive", Reachability::Unknown(String::from("Inactive")))]
    fn reachability_preserves_unknown_values(#[case] raw: &str, #[case] expected: Reachability) {
        assert_eq!(Reachability::from_raw(raw), expected);
    }

    #[rstest]
    #[case("i-0123abcd", true)]
    #[case("i-", false)]
    #[case("web-1", false)]
    #[case("i-zz", false)]
    fn instance_id_detection(#[case] target: &str, #[case] expected: bool) {
        assert_eq!(is_instance_id(target), expected);
    }

    #[tokio::test]
    async fn resolves_unique_name_tag() {
        let cloud = FakeCloud::new();
        cloud.add_instance(instance("i-0001", Some("web")));
        cloud.add_instance(instance("i-0002", Some("db")));

        let resolved = resolve_target(&cloud, &Decline, "db")
            .await
            .expect("db should resolve");
        assert_eq!(resolved.id, "i-0002");
    }

    #[tokio::test]
    async fn ambiguous_names_defer_to_selector() {
        let cloud = FakeCloud::new();
        cloud.add_instance(instance("i-0001", Some("web")));
        cloud.add_instance(instance("i-0002", Some("web")));

        let resolved = resolve_target(&cloud, &PickSecond, "web")
            .await
            .expect("selector should choose");
        assert_eq!(resolved.id, "i-0002");

        let err = resolve_target(&cloud, &Decline, "web")
            .await
            .expect_err("declined selection should fail");
        assert!(matches!(err, ResolveError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn unknown_identifier_is_not_found() {
        let cloud = FakeCloud::new();
        let err = resolve_target(&cloud, &Decline, "i-00ff")
            .await
            .expect_err("missing id should fail");
        assert!(matches!(err, ResolveError::NotFound { .. }));
    }
}
