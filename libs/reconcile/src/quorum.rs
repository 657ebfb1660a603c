//! Quorum predicates over achieved versus target size.

use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

/// Decides whether `current` members are enough for a `target` size.
///
/// Used twice by a cluster: once after start ("initial quorum", failing the
/// start when not met) and continuously for the derived `service.up` signal
/// ("up quorum").
#[derive(Clone, Default)]
pub enum QuorumCheck {
    /// Every requested member is present.
    #[default]
    All,

    /// At least this many members, regardless of target.
    AtLeast(usize),

    AtLeastOne,

    /// At least one member, or an empty target.
    AtLeastOneUnlessEmpty,

    AlwaysTrue,

    Custom(Arc<dyn Fn(usize, usize) -> bool + Send + Sync>),
}

impl QuorumCheck {
    pub fn custom<F>(check: F) -> Self
    where
        F: Fn(usize, usize) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(check))
    }

    pub fn is_quorate(&self, current: usize, target: usize) -> bool {
        match self {
            QuorumCheck::All => current == target,
            QuorumCheck::AtLeast(min) => current >= *min,
            QuorumCheck::AtLeastOne => current >= 1,
            QuorumCheck::AtLeastOneUnlessEmpty => target == 0 || current >= 1,
            QuorumCheck::AlwaysTrue => true,
            QuorumCheck::Custom(check) => check(current, target),
        }
    }
}

impl std::fmt::Debug for QuorumCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuorumCheck::All => write!(f, "All"),
            QuorumCheck::AtLeast(n) => write!(f, "AtLeast({})", n),
            QuorumCheck::AtLeastOne => write!(f, "AtLeastOne"),
            QuorumCheck::AtLeastOneUnlessEmpty => write!(f, "AtLeastOneUnlessEmpty"),
            QuorumCheck::AlwaysTrue => write!(f, "AlwaysTrue"),
            QuorumCheck::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Error parsing a quorum check name.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown quorum check '{0}' (expected all, at_least_one, at_least_one_unless_empty, always_true or at_least:N)")]
pub struct QuorumParseError(pub String);

impl FromStr for QuorumCheck {
    type Err = QuorumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "all" => Ok(QuorumCheck::All),
            "at_least_one" => Ok(QuorumCheck::AtLeastOne),
            "at_least_one_unless_empty" => Ok(QuorumCheck::AtLeastOneUnlessEmpty),
            "always_true" => Ok(QuorumCheck::AlwaysTrue),
            other => other
                .strip_prefix("at_least:")
                .and_then(|n| n.parse().ok())
                .map(QuorumCheck::AtLeast)
                .ok_or_else(|| QuorumParseError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_requires_exact_size() {
        let q = QuorumCheck::All;
        assert!(q.is_quorate(3, 3));
        assert!(!q.is_quorate(2, 3));
        assert!(q.is_quorate(0, 0));
    }

    #[test]
    fn at_least_ignores_target() {
        let q = QuorumCheck::AtLeast(2);
        assert!(q.is_quorate(2, 10));
        assert!(!q.is_quorate(1, 1));
    }

    #[test]
    fn unless_empty_accepts_zero_target() {
        let q = QuorumCheck::AtLeastOneUnlessEmpty;
        assert!(q.is_quorate(0, 0));
        assert!(!q.is_quorate(0, 2));
        assert!(q.is_quorate(1, 2));
    }

    #[test]
    fn custom_predicate() {
        let majority = QuorumCheck::custom(|current, target| current * 2 > target);
        assert!(majority.is_quorate(2, 3));
        assert!(!majority.is_quorate(1, 3));
        assert_eq!(format!("{:?}", majority), "Custom(..)");
    }

    #[test]
    fn parse_names() {
        assert!(matches!("all".parse::<QuorumCheck>(), Ok(QuorumCheck::All)));
        assert!(matches!(
            "At-Least-One".parse::<QuorumCheck>(),
            Ok(QuorumCheck::AtLeastOne)
        ));
        assert!(matches!(
            "at_least:4".parse::<QuorumCheck>(),
            Ok(QuorumCheck::AtLeast(4))
        ));
        assert!("most".parse::<QuorumCheck>().is_err());
        assert!("at_least:x".parse::<QuorumCheck>().is_err());
    }
}
