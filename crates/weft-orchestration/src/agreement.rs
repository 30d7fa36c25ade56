//! Textual agreement between debate positions.

use std::collections::BTreeSet;

/// Groups positions into clusters of agreeing text.
///
/// Debate consensus compares the share of positions in the largest cluster
/// against the pattern's threshold.
pub trait AgreementCheck: Send + Sync {
    /// Whether two positions say the same thing.
    fn agrees(&self, a: &str, b: &str) -> bool;

    /// Cluster positions; each cluster lists indices into `positions` in
    /// ascending order, and clusters are ordered by their first index.
    fn clusters(&self, positions: &[&str]) -> Vec<Vec<usize>> {
        let mut clusters: Vec<Vec<usize>> = Vec::new();
        for (i, position) in positions.iter().enumerate() {
            match clusters
                .iter_mut()
                .find(|cluster| self.agrees(positions[cluster[0]], position))
            {
                Some(cluster) => cluster.push(i),
                None => clusters.push(vec![i]),
            }
        }
        clusters
    }

    /// Share of positions in the largest cluster, `0.0` when empty.
    fn agreement(&self, positions: &[&str]) -> f64 {
        if positions.is_empty() {
            return 0.0;
        }
        let largest = self
            .clusters(positions)
            .iter()
            .map(Vec::len)
            .max()
            .unwrap_or(0);
        largest as f64 / positions.len() as f64
    }
}

/// The largest cluster; on equal sizes the one containing the earliest
/// position wins.
pub fn majority_cluster(clusters: &[Vec<usize>]) -> Option<&Vec<usize>> {
    clusters
        .iter()
        .fold(None, |best: Option<&Vec<usize>>, cluster| match best {
            Some(b) if b.len() >= cluster.len() => Some(b),
            _ => Some(cluster),
        })
}

/// Word-set Jaccard similarity at or above a threshold.
#[derive(Debug, Clone, Copy)]
pub struct JaccardAgreement {
    pub similarity: f64,
}

impl Default for JaccardAgreement {
    fn default() -> Self {
        Self { similarity: 0.8 }
    }
}

impl JaccardAgreement {
    pub fn new(similarity: f64) -> Self {
        Self { similarity }
    }

    fn words(text: &str) -> BTreeSet<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect()
    }

    pub fn similarity(a: &str, b: &str) -> f64 {
        let (a, b) = (Self::words(a), Self::words(b));
        if a.is_empty() && b.is_empty() {
            return 1.0;
        }
        let shared = a.intersection(&b).count();
        let total = a.union(&b).count();
        shared as f64 / total as f64
    }
}

impl AgreementCheck for JaccardAgreement {
    fn agrees(&self, a: &str, b: &str) -> bool {
        Self::similarity(a, b) >= self.similarity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_positions_fully_agree() {
        let check = JaccardAgreement::default();
        assert_eq!(check.agreement(&["Use Rust.", "use rust", "USE RUST!"]), 1.0);
    }

    #[test]
    fn test_clusters_and_majority() {
        let check = JaccardAgreement::default();
        let positions = ["use rust", "use go", "use rust", "use go"];
        let clusters = check.clusters(&positions);
        assert_eq!(clusters, vec![vec![0, 2], vec![1, 3]]);
        assert_eq!(check.agreement(&positions), 0.5);
        // even split goes to the cluster holding the earliest position
        assert_eq!(majority_cluster(&clusters), Some(&vec![0, 2]));
    }

    #[test]
    fn test_similarity_bounds() {
        assert_eq!(JaccardAgreement::similarity("a b", "c d"), 0.0);
        assert_eq!(JaccardAgreement::similarity("", ""), 1.0);
        assert!((JaccardAgreement::similarity("a b c", "a b d") - 0.5).abs() < 1e-9);
        assert_eq!(JaccardAgreement::default().agreement(&[]), 0.0);
    }
}
