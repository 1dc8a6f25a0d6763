//! Weighted PageRank by power iteration.

/// Compute PageRank scores for a weighted directed graph given as an
/// adjacency list of `(target, weight)` pairs per node. Dangling nodes
/// distribute their mass uniformly. Iteration stops when the L1 delta falls
/// under `tolerance` or after `max_iterations`.
pub fn power_iteration(
    links: &[Vec<(usize, f64)>],
    damping: f64,
    tolerance: f64,
    max_iterations: usize,
) -> Vec<f64> {
    let n = links.len();
    if n == 0 {
        return Vec::new();
    }
    let uniform = 1.0 / n as f64;
    let mut scores = vec![uniform; n];

    let out_weight: Vec<f64> = links
        .iter()
        .map(|targets| targets.iter().map(|(_, w)| w).sum())
        .collect();

    for _ in 0..max_iterations {
        let mut next = vec![(1.0 - damping) * uniform; n];

        let mut dangling_mass = 0.0;
        for (node, targets) in links.iter().enumerate() {
            if out_weight[node] <= 0.0 {
                dangling_mass += scores[node];
                continue;
            }
            let share = damping * scores[node] / out_weight[node];
            for (target, weight) in targets {
                next[*target] += share * weight;
            }
        }
        if dangling_mass > 0.0 {
            let share = damping * dangling_mass * uniform;
            for value in &mut next {
                *value += share;
            }
        }

        let delta: f64 = next
            .iter()
            .zip(scores.iter())
            .map(|(a, b)| (a - b).abs())
            .sum();
        scores = next;
        if delta < tolerance {
            break;
        }
    }
    scores
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_graph_yields_no_scores() {
        assert!(power_iteration(&[], 0.85, 1e-6, 50).is_empty());
    }

    #[test]
    fn scores_sum_to_one() {
        let links = vec![vec![(1, 1.0)], vec![(2, 1.0)], vec![(0, 1.0)]];
        let scores = power_iteration(&links, 0.85, 1e-6, 50);
        let total: f64 = scores.iter().sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn sink_of_many_links_ranks_highest() {
        // 0, 1, 2 all point at 3.
        let links = vec![vec![(3, 1.0)], vec![(3, 1.0)], vec![(3, 1.0)], vec![]];
        let scores = power_iteration(&links, 0.85, 1e-6, 50);
        assert!(scores[3] > scores[0]);
        assert!(scores[3] > scores[1]);
    }

    #[test]
    fn heavier_edges_transfer_more_mass() {
        // 0 links to 1 (weight 3) and 2 (weight 1).
        let links = vec![vec![(1, 3.0), (2, 1.0)], vec![], vec![]];
        let scores = power_iteration(&links, 0.85, 1e-6, 50);
        assert!(scores[1] > scores[2]);
    }

    #[test]
    fn converges_on_cycles() {
        let links = vec![vec![(1, 1.0)], vec![(0, 1.0)]];
        let scores = power_iteration(&links, 0.85, 1e-6, 50);
        assert!((scores[0] - scores[1]).abs() < 1e-6);
    }
}
