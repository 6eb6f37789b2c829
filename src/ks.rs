//! Two-sample Kolmogorov-Smirnov comparison and Ward-linkage clustering of
//! histograms (spec.md §4.6, component C6).
//!
//! Hand-rolled rather than delegated to an external statistics crate: flow
//! counts in a fleet run are small (tens, not thousands), so the textbook
//! O(n^2 log n) agglomeration below is more than adequate, and it keeps the
//! dependency footprint aligned with the rest of this crate, which similarly
//! hand-rolls its own parsing and statistics (`histogram.rs`, `parser.rs`)
//! rather than reaching for a heavyweight crate to cover a bounded problem.

use crate::histogram::Histogram;

/// A fleet-wide comparison of every pairwise combination of histograms.
pub struct Comparison {
    /// Histogram names in dense-index order (spec.md §4.6 "dense per-name KS
    /// index").
    pub names: Vec<String>,
    /// Condensed upper-triangular KS-statistic distance vector, in the usual
    /// row-major `(i, j)` for `i < j` order.
    pub distances: Vec<f64>,
    /// `names.len()` rows, each of length N: positions `[0, i)` are `'x'`
    /// placeholders, positions `[i, N)` are `'1'` if `p > critical_p` else
    /// `'0'` (spec.md §4.6).
    pub similarity_rows: Vec<String>,
    /// Per-row minimum p-value across all other histograms.
    pub min_p: Vec<f64>,
    /// Per-row maximum p-value across all other histograms, excluding exact
    /// self-comparisons (`p == 1.0`) per spec.md §4.6 edge case.
    pub max_p: Vec<f64>,
    /// Flat cluster assignment per histogram, in `names` order (spec.md §4.6
    /// "flattened at `0.5 * max(D)`").
    pub clusters: Vec<usize>,
}

/// Compare every histogram pairwise and cluster the result.
///
/// `critical_p` is the significance threshold below which two histograms are
/// considered drawn from different distributions (spec.md default `0.01`).
pub fn compare(histograms: &mut [Histogram], critical_p: f64) -> Comparison {
    let names: Vec<String> = histograms.iter().map(|h| h.name.clone()).collect();
    for (i, h) in histograms.iter_mut().enumerate() {
        h.ks_index = Some(i);
    }
    let n = histograms.len();

    let mut p_matrix = vec![vec![1.0f64; n]; n];
    let mut d_matrix = vec![vec![0.0f64; n]; n];
    let mut distances = Vec::with_capacity(n * n.saturating_sub(1) / 2);

    for i in 0..n {
        for j in (i + 1)..n {
            let (d, p) = two_sample_ks(&histograms[i].samples, &histograms[j].samples);
            d_matrix[i][j] = d;
            d_matrix[j][i] = d;
            p_matrix[i][j] = p;
            p_matrix[j][i] = p;
            distances.push(d);
        }
    }

    let mut similarity_rows = Vec::with_capacity(n);
    let mut min_p = Vec::with_capacity(n);
    let mut max_p = Vec::with_capacity(n);

    for i in 0..n {
        let mut row = String::with_capacity(n);
        let mut row_min = 1.0f64;
        let mut row_max = 0.0f64;
        for j in 0..n {
            if j < i {
                row.push('x');
                continue;
            }
            let p = p_matrix[i][j];
            row.push(if p > critical_p { '1' } else { '0' });
            row_min = row_min.min(p);
            // exact self-like comparisons (p == 1.0) don't count toward the
            // row's max-p (spec.md §4.6 edge case).
            if p < 1.0 {
                row_max = row_max.max(p);
            }
        }
        similarity_rows.push(row);
        min_p.push(row_min);
        max_p.push(row_max);
    }

    let clusters = if n <= 1 {
        vec![0; n]
    } else {
        ward_cluster(&d_matrix)
    };

    Comparison {
        names,
        distances,
        similarity_rows,
        min_p,
        max_p,
        clusters,
    }
}

/// The two-sample KS statistic `D` and its asymptotic p-value, computed over
/// the Kolmogorov distribution (spec.md §4.6).
fn two_sample_ks(a: &[u32], b: &[u32]) -> (f64, f64) {
    if a.is_empty() || b.is_empty() {
        return (0.0, 1.0);
    }
    let mut a_sorted = a.to_vec();
    let mut b_sorted = b.to_vec();
    a_sorted.sort_unstable();
    b_sorted.sort_unstable();

    let (n1, n2) = (a_sorted.len(), b_sorted.len());
    let mut d_max = 0.0f64;
    let (mut i, mut j) = (0usize, 0usize);
    while i < n1 && j < n2 {
        let (va, vb) = (a_sorted[i], b_sorted[j]);
        if va <= vb {
            i += 1;
        }
        if vb <= va {
            j += 1;
        }
        let cdf_a = i as f64 / n1 as f64;
        let cdf_b = j as f64 / n2 as f64;
        d_max = d_max.max((cdf_a - cdf_b).abs());
    }

    let ne = (n1 as f64 * n2 as f64 / (n1 + n2) as f64).sqrt();
    let p = kolmogorov_sf((ne + 0.12 + 0.11 / ne) * d_max);
    (d_max, p.clamp(0.0, 1.0))
}

/// Asymptotic survival function of the Kolmogorov distribution (the standard
/// series used for the two-sample KS test's p-value).
fn kolmogorov_sf(t: f64) -> f64 {
    if t < 0.2 {
        return 1.0;
    }
    let mut sum = 0.0f64;
    for k in 1..=100 {
        let term = (-1.0f64).powi(k - 1) * (-2.0 * (k as f64).powi(2) * t * t).exp();
        sum += term;
        if term.abs() < 1e-10 {
            break;
        }
    }
    (2.0 * sum).clamp(0.0, 1.0)
}

/// Agglomerative hierarchical clustering with Ward linkage, flattened at
/// `0.5 * max(D)` (spec.md §4.6), over a dense symmetric distance matrix.
fn ward_cluster(d_matrix: &[Vec<f64>]) -> Vec<usize> {
    let n = d_matrix.len();
    let max_d = d_matrix
        .iter()
        .flat_map(|row| row.iter())
        .cloned()
        .fold(0.0f64, f64::max);
    let cutoff = 0.5 * max_d;

    // each cluster starts as its own singleton; `members` tracks original
    // indices, `dist` the current inter-cluster distance matrix.
    let mut members: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
    let mut dist = d_matrix.to_vec();
    let mut alive: Vec<usize> = (0..n).collect();

    while alive.len() > 1 {
        // find the closest pair of alive clusters.
        let mut best = (f64::INFINITY, 0usize, 0usize);
        for (ai, &i) in alive.iter().enumerate() {
            for &j in &alive[ai + 1..] {
                if dist[i][j] < best.0 {
                    best = (dist[i][j], i, j);
                }
            }
        }
        let (d, i, j) = best;
        if d > cutoff {
            break;
        }

        // merge j into i using the Lance-Williams Ward update.
        let ni = members[i].len() as f64;
        let nj = members[j].len() as f64;
        for &k in &alive {
            if k == i || k == j {
                continue;
            }
            let nk = members[k].len() as f64;
            let total = ni + nj + nk;
            let d_ik = dist[i][k];
            let d_jk = dist[j][k];
            let d_ij = dist[i][j];
            let updated = (((ni + nk) * d_ik + (nj + nk) * d_jk - nk * d_ij) / total).max(0.0);
            dist[i][k] = updated;
            dist[k][i] = updated;
        }
        let merged = members[j].clone();
        members[i].extend(merged);
        alive.retain(|&k| k != j);
    }

    let mut clusters = vec![0usize; n];
    for (cluster_id, &rep) in alive.iter().enumerate() {
        for &member in &members[rep] {
            clusters[member] = cluster_id;
        }
    }
    clusters
}

#[cfg(test)]
mod test {
    use super::*;

    fn histogram(name: &str, bin_list: &str) -> Histogram {
        Histogram::from_bins(name, 10, bin_list).unwrap()
    }

    #[test]
    fn identical_histograms_are_maximally_similar() {
        let mut hs = vec![histogram("A", "0:50,1:50"), histogram("B", "0:50,1:50")];
        let cmp = compare(&mut hs, 0.01);
        assert_eq!(cmp.distances[0], 0.0);
        assert_eq!(cmp.similarity_rows[0], "11");
        assert_eq!(cmp.clusters[0], cmp.clusters[1]);
    }

    #[test]
    fn wildly_different_histograms_are_dissimilar() {
        let mut hs = vec![histogram("A", "0:100"), histogram("B", "99:100")];
        let cmp = compare(&mut hs, 0.01);
        assert!(cmp.distances[0] > 0.9);
        assert_eq!(cmp.similarity_rows[0], "10");
    }

    #[test]
    fn single_histogram_row_is_trivial() {
        let mut hs = vec![histogram("A", "0:10")];
        let cmp = compare(&mut hs, 0.01);
        assert_eq!(cmp.similarity_rows, vec!["1".to_string()]);
        assert_eq!(cmp.clusters, vec![0]);
    }

    #[test]
    fn dense_ks_index_is_assigned_in_order() {
        let mut hs = vec![histogram("A", "0:10"), histogram("B", "0:10"), histogram("C", "5:10")];
        let _ = compare(&mut hs, 0.01);
        assert_eq!(hs[0].ks_index, Some(0));
        assert_eq!(hs[1].ks_index, Some(1));
        assert_eq!(hs[2].ks_index, Some(2));
    }

    #[test]
    fn three_histograms_cluster_two_similar_apart_from_one_outlier() {
        let mut hs = vec![
            histogram("A", "0:100"),
            histogram("B", "1:98,2:2"),
            histogram("C", "90:100"),
        ];
        let cmp = compare(&mut hs, 0.01);
        assert_eq!(cmp.clusters[0], cmp.clusters[1]);
        assert_ne!(cmp.clusters[0], cmp.clusters[2]);
    }
}
