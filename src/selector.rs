//! Ownership and disregard-status predicates
//!
//! Nodes are claimed either unconditionally (`--manage-all-nodes`) or by
//! equality-based selectors over annotations and labels. The same selector
//! grammar drives the disregard-status predicate that freezes status writes
//! for matching objects.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::Error;

/// A single parsed selector requirement
#[derive(Clone, Debug, PartialEq, Eq)]
enum Requirement {
    /// `key=value` or `key==value`
    Eq(String, String),
    /// `key!=value`
    NotEq(String, String),
    /// bare `key`
    Exists(String),
    /// `!key`
    NotExists(String),
}

/// An equality-based selector over a string-to-string map
///
/// Grammar: comma-separated requirements of the forms `k=v`, `k==v`,
/// `k!=v`, `k` (exists) and `!k` (not exists). An empty selector matches
/// everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// Parse a selector string.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for malformed requirements (empty
    /// keys, stray operators).
    pub fn parse(input: &str) -> Result<Self, Error> {
        let mut requirements = Vec::new();

        for raw in input.split(',') {
            let part = raw.trim();
            if part.is_empty() {
                continue;
            }

            if let Some((key, value)) = part.split_once("!=") {
                let key = key.trim();
                if key.is_empty() {
                    return Err(Error::config(format!("invalid selector term {part:?}")));
                }
                requirements.push(Requirement::NotEq(key.to_string(), value.trim().to_string()));
            } else if let Some((key, value)) = part.split_once("==") {
                let key = key.trim();
                if key.is_empty() {
                    return Err(Error::config(format!("invalid selector term {part:?}")));
                }
                requirements.push(Requirement::Eq(key.to_string(), value.trim().to_string()));
            } else if let Some((key, value)) = part.split_once('=') {
                let key = key.trim();
                if key.is_empty() {
                    return Err(Error::config(format!("invalid selector term {part:?}")));
                }
                requirements.push(Requirement::Eq(key.to_string(), value.trim().to_string()));
            } else if let Some(key) = part.strip_prefix('!') {
                let key = key.trim();
                if key.is_empty() {
                    return Err(Error::config(format!("invalid selector term {part:?}")));
                }
                requirements.push(Requirement::NotExists(key.to_string()));
            } else {
                requirements.push(Requirement::Exists(part.to_string()));
            }
        }

        Ok(Self { requirements })
    }

    /// True when every requirement holds for the given map
    pub fn matches(&self, map: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| match req {
            Requirement::Eq(k, v) => map.get(k).is_some_and(|have| have == v),
            Requirement::NotEq(k, v) => map.get(k).is_none_or(|have| have != v),
            Requirement::Exists(k) => map.contains_key(k),
            Requirement::NotExists(k) => !map.contains_key(k),
        })
    }

    /// True when the selector carries no requirements
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for req in &self.requirements {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            match req {
                Requirement::Eq(k, v) => write!(f, "{k}={v}")?,
                Requirement::NotEq(k, v) => write!(f, "{k}!={v}")?,
                Requirement::Exists(k) => write!(f, "{k}")?,
                Requirement::NotExists(k) => write!(f, "!{k}")?,
            }
        }
        Ok(())
    }
}

/// Decides whether this process is responsible for a Node.
///
/// Exactly one of the two forms is active: match-all, or selector-based
/// over annotations and/or labels. The constructor enforces that.
#[derive(Clone, Debug)]
pub enum OwnershipPredicate {
    /// Every node belongs to this process
    All,
    /// Nodes matching all present selectors belong to this process
    Selectors {
        /// Selector evaluated against node annotations
        annotations: Option<Selector>,
        /// Selector evaluated against node labels
        labels: Option<Selector>,
    },
}

impl OwnershipPredicate {
    /// Build the predicate from the three ownership options.
    ///
    /// # Errors
    ///
    /// Rejects `manage_all` combined with any selector, and the inverse
    /// case where nothing at all is selected.
    pub fn from_options(
        manage_all: bool,
        annotation_selector: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Self, Error> {
        let annotation_selector = annotation_selector.filter(|s| !s.is_empty());
        let label_selector = label_selector.filter(|s| !s.is_empty());

        if manage_all {
            if annotation_selector.is_some() || label_selector.is_some() {
                return Err(Error::config(
                    "manage-all-nodes is conflicted with manage-nodes-with-annotation-selector \
                     and manage-nodes-with-label-selector",
                ));
            }
            return Ok(Self::All);
        }

        if annotation_selector.is_none() && label_selector.is_none() {
            return Err(Error::config(
                "no nodes selected: set manage-all-nodes or one of the node selectors",
            ));
        }

        Ok(Self::Selectors {
            annotations: annotation_selector.map(Selector::parse).transpose()?,
            labels: label_selector.map(Selector::parse).transpose()?,
        })
    }

    /// Evaluate the predicate against an object's labels and annotations
    pub fn matches(
        &self,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> bool {
        match self {
            Self::All => true,
            Self::Selectors {
                annotations: ann_sel,
                labels: lab_sel,
            } => {
                ann_sel.as_ref().is_none_or(|s| s.matches(annotations))
                    && lab_sel.as_ref().is_none_or(|s| s.matches(labels))
            }
        }
    }
}

/// Freezes status writes for matching objects while lifecycle handling
/// (node binding, deletion) continues to run.
#[derive(Clone, Debug, Default)]
pub struct DisregardPredicate {
    annotations: Option<Selector>,
    labels: Option<Selector>,
}

impl DisregardPredicate {
    /// Build the predicate from the two disregard-status options.
    ///
    /// # Errors
    ///
    /// Propagates selector parse errors.
    pub fn from_options(
        annotation_selector: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Self, Error> {
        Ok(Self {
            annotations: annotation_selector
                .filter(|s| !s.is_empty())
                .map(Selector::parse)
                .transpose()?,
            labels: label_selector
                .filter(|s| !s.is_empty())
                .map(Selector::parse)
                .transpose()?,
        })
    }

    /// True when the object's status must not be written.
    ///
    /// With no selectors configured nothing is frozen; with both
    /// configured, both must match.
    pub fn matches(
        &self,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> bool {
        if self.annotations.is_none() && self.labels.is_none() {
            return false;
        }
        self.annotations
            .as_ref()
            .is_none_or(|s| s.matches(annotations))
            && self.labels.as_ref().is_none_or(|s| s.matches(labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    // =========================================================================
    // Selector grammar
    // =========================================================================

    #[test]
    fn test_equality_requirement() {
        let sel = Selector::parse("type=virtual").unwrap();
        assert!(sel.matches(&map(&[("type", "virtual")])));
        assert!(!sel.matches(&map(&[("type", "real")])));
        assert!(!sel.matches(&map(&[])));
    }

    #[test]
    fn test_double_equals_is_equality() {
        let sel = Selector::parse("type==virtual").unwrap();
        assert!(sel.matches(&map(&[("type", "virtual")])));
        assert!(!sel.matches(&map(&[("type", "real")])));
    }

    #[test]
    fn test_inequality_requirement() {
        let sel = Selector::parse("type!=real").unwrap();
        assert!(sel.matches(&map(&[("type", "virtual")])));
        assert!(sel.matches(&map(&[])), "absent key satisfies !=");
        assert!(!sel.matches(&map(&[("type", "real")])));
    }

    #[test]
    fn test_exists_and_not_exists() {
        let sel = Selector::parse("managed").unwrap();
        assert!(sel.matches(&map(&[("managed", "")])));
        assert!(!sel.matches(&map(&[])));

        let sel = Selector::parse("!managed").unwrap();
        assert!(sel.matches(&map(&[])));
        assert!(!sel.matches(&map(&[("managed", "yes")])));
    }

    #[test]
    fn test_conjunction() {
        let sel = Selector::parse("type=virtual,zone!=eu,ready").unwrap();
        assert!(sel.matches(&map(&[("type", "virtual"), ("zone", "us"), ("ready", "1")])));
        assert!(!sel.matches(&map(&[("type", "virtual"), ("zone", "eu"), ("ready", "1")])));
        assert!(!sel.matches(&map(&[("type", "virtual"), ("zone", "us")])));
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let sel = Selector::parse("").unwrap();
        assert!(sel.is_empty());
        assert!(sel.matches(&map(&[])));
        assert!(sel.matches(&map(&[("anything", "at-all")])));
    }

    #[test]
    fn test_malformed_terms_rejected() {
        assert!(Selector::parse("=value").is_err());
        assert!(Selector::parse("!").is_err());
        assert!(Selector::parse("!=x").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        let input = "type=virtual,zone!=eu,ready,!cordoned";
        let sel = Selector::parse(input).unwrap();
        assert_eq!(sel.to_string(), input);
    }

    // =========================================================================
    // Ownership predicate
    // =========================================================================

    #[test]
    fn test_manage_all_matches_everything() {
        let pred = OwnershipPredicate::from_options(true, None, None).unwrap();
        assert!(pred.matches(&map(&[]), &map(&[])));
        assert!(pred.matches(&map(&[("a", "b")]), &map(&[("c", "d")])));
    }

    #[test]
    fn test_manage_all_conflicts_with_selectors() {
        let err = OwnershipPredicate::from_options(true, Some("fake=true"), None).unwrap_err();
        assert!(err.is_fatal());

        let err = OwnershipPredicate::from_options(true, None, Some("type=virtual")).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_no_selection_is_rejected() {
        let err = OwnershipPredicate::from_options(false, None, None).unwrap_err();
        assert!(err.is_fatal());

        // Empty strings count as unset, not as selectors
        let err = OwnershipPredicate::from_options(false, Some(""), Some("")).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_label_selector_ownership() {
        let pred =
            OwnershipPredicate::from_options(false, None, Some("type=virtual")).unwrap();
        assert!(pred.matches(&map(&[("type", "virtual")]), &map(&[])));
        assert!(!pred.matches(&map(&[("type", "real")]), &map(&[])));
        assert!(!pred.matches(&map(&[]), &map(&[("type", "virtual")])));
    }

    #[test]
    fn test_annotation_and_label_selectors_conjoin() {
        let pred = OwnershipPredicate::from_options(
            false,
            Some("owner=phantomlet"),
            Some("type=virtual"),
        )
        .unwrap();
        assert!(pred.matches(
            &map(&[("type", "virtual")]),
            &map(&[("owner", "phantomlet")])
        ));
        assert!(!pred.matches(&map(&[("type", "virtual")]), &map(&[])));
        assert!(!pred.matches(&map(&[]), &map(&[("owner", "phantomlet")])));
    }

    // =========================================================================
    // Disregard-status predicate
    // =========================================================================

    #[test]
    fn test_disregard_unset_freezes_nothing() {
        let pred = DisregardPredicate::from_options(None, None).unwrap();
        assert!(!pred.matches(&map(&[("a", "b")]), &map(&[("c", "d")])));
    }

    #[test]
    fn test_disregard_annotation_selector() {
        let pred = DisregardPredicate::from_options(Some("fake=custom"), None).unwrap();
        assert!(pred.matches(&map(&[]), &map(&[("fake", "custom")])));
        assert!(!pred.matches(&map(&[("fake", "custom")]), &map(&[])));
        assert!(!pred.matches(&map(&[]), &map(&[])));
    }
}
