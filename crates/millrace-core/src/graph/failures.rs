//! The per-flow failure tree: a trie mapping combinations of failed-node
//! names to a fallback specification.
//!
//! Combinations are stored and looked up in sorted name order, so the
//! fallback search (which sorts failed names before enumerating
//! combinations) hits deterministically regardless of failure order.

use std::collections::HashMap;

use crate::graph::Node;

/// What to do when a registered combination of nodes has failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fallback {
    /// Schedule these nodes, in declaration order, with the failed ids as
    /// parent. The flow then waits for them before evaluating further
    /// failures.
    Run(Vec<Node>),
    /// Consume one failure record per name without scheduling anything.
    Drop,
}

#[derive(Debug, Clone, Default)]
struct TrieNode {
    fallback: Option<Fallback>,
    next: HashMap<String, TrieNode>,
}

/// Trie over sorted failed-node name combinations.
#[derive(Debug, Clone, Default)]
pub struct FailureTree {
    roots: HashMap<String, TrieNode>,
}

impl FailureTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Register a fallback for a combination of node names.
    ///
    /// The combination is sorted internally; callers may pass names in
    /// any order. Registering the same combination twice replaces the
    /// earlier fallback.
    pub fn insert(&mut self, combination: &[String], fallback: Fallback) {
        let mut names: Vec<&String> = combination.iter().collect();
        names.sort();
        names.dedup();

        let Some((first, rest)) = names.split_first() else {
            return;
        };

        let mut node = self.roots.entry((*first).clone()).or_default();
        for name in rest {
            node = node.next.entry((*name).clone()).or_default();
        }
        node.fallback = Some(fallback);
    }

    /// Look up the fallback for an exact combination of names.
    ///
    /// `combination` must already be sorted -- the fallback search
    /// enumerates combinations of an alphabetically sorted name list, so
    /// this holds by construction there.
    pub fn lookup(&self, combination: &[&str]) -> Option<&Fallback> {
        let (first, rest) = combination.split_first()?;
        let mut node = self.roots.get(*first)?;
        for name in rest {
            node = node.next.get(*name)?;
        }
        node.fallback.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tree_has_no_fallbacks() {
        let tree = FailureTree::new();
        assert!(tree.is_empty());
        assert!(tree.lookup(&["T1"]).is_none());
    }

    #[test]
    fn single_name_lookup() {
        let mut tree = FailureTree::new();
        tree.insert(
            &["T1".to_string()],
            Fallback::Run(vec![Node::task("Recover")]),
        );

        match tree.lookup(&["T1"]) {
            Some(Fallback::Run(nodes)) => assert_eq!(nodes, &[Node::task("Recover")]),
            other => panic!("expected Run fallback, got {other:?}"),
        }
        assert!(tree.lookup(&["T2"]).is_none());
    }

    #[test]
    fn combination_is_sorted_on_insert() {
        let mut tree = FailureTree::new();
        tree.insert(&["B".to_string(), "A".to_string()], Fallback::Drop);

        // Lookups use sorted order.
        assert_eq!(tree.lookup(&["A", "B"]), Some(&Fallback::Drop));
        // The unsorted permutation is not a registered path.
        assert!(tree.lookup(&["B", "A"]).is_none());
    }

    #[test]
    fn prefix_of_combination_is_not_a_match() {
        let mut tree = FailureTree::new();
        tree.insert(
            &["A".to_string(), "B".to_string()],
            Fallback::Run(vec![Node::task("R")]),
        );

        assert!(tree.lookup(&["A"]).is_none());
        assert!(tree.lookup(&["A", "B"]).is_some());
    }

    #[test]
    fn distinct_combinations_coexist() {
        let mut tree = FailureTree::new();
        tree.insert(&["A".to_string()], Fallback::Run(vec![Node::task("Ra")]));
        tree.insert(
            &["A".to_string(), "B".to_string()],
            Fallback::Run(vec![Node::task("Rab")]),
        );
        tree.insert(&["C".to_string()], Fallback::Drop);

        assert!(matches!(tree.lookup(&["A"]), Some(Fallback::Run(_))));
        assert!(matches!(tree.lookup(&["A", "B"]), Some(Fallback::Run(_))));
        assert_eq!(tree.lookup(&["C"]), Some(&Fallback::Drop));
    }
}
