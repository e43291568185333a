use log::trace;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2};

/// Log of the sum of exponentials of `values`, shifted by the maximum so
/// large magnitudes neither overflow nor underflow.
pub(crate) fn logsumexp(values: impl Iterator<Item = f32> + Clone) -> f32 {
    let max = values.clone().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f32 = values.map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Sinkhorn normalization in log-space.
///
/// Alternately recomputes the row potentials `u` and column potentials `v`
/// so that the coupling `z + u ⊕ v` approaches the prescribed log-marginals
/// `log_mu` (rows) and `log_nu` (columns). Staying in log-space keeps the
/// iteration stable for large or very negative affinities.
///
/// # Arguments
/// * `z` - `(M, N)` log-affinity matrix.
/// * `log_mu` - length-M target row log-marginals.
/// * `log_nu` - length-N target column log-marginals.
/// * `iterations` - number of full (row + column) updates.
/// # Return value
/// The `(M, N)` log-coupling `z + u ⊕ v`.
pub fn log_sinkhorn(
    z: ArrayView2<f32>,
    log_mu: ArrayView1<f32>,
    log_nu: ArrayView1<f32>,
    iterations: usize,
) -> Array2<f32> {
    let (m, n) = z.dim();
    debug_assert_eq!(log_mu.len(), m);
    debug_assert_eq!(log_nu.len(), n);

    let mut u = Array1::<f32>::zeros(m);
    let mut v = Array1::<f32>::zeros(n);
    for _ in 0..iterations {
        for i in 0..m {
            let row = z.row(i);
            u[i] = log_mu[i] - logsumexp(row.iter().zip(v.iter()).map(|(&z, &v)| z + v));
        }
        for j in 0..n {
            let col = z.column(j);
            v[j] = log_nu[j] - logsumexp(col.iter().zip(u.iter()).map(|(&z, &u)| z + u));
        }
    }

    let mut coupling = z.to_owned();
    for ((i, j), cell) in coupling.indexed_iter_mut() {
        *cell += u[i] + v[j];
    }
    coupling
}

/// Entropic optimal transport between two point sets with dustbins.
///
/// The `(m, n)` similarity matrix is augmented with one extra row and column
/// filled with `bin_score` (corner included) so unmatched points can route
/// their mass to a dustbin. Every real point carries mass `1/(m+n)`; the
/// dustbins absorb the size imbalance (`n/(m+n)` for the row dustbin,
/// `m/(m+n)` for the column one). After the Sinkhorn iterations the coupling
/// is shifted by `log(m+n)` so each returned cell is a log-probability in
/// the original score units: exponentiated, every real row and column sums
/// to 1.
pub fn log_optimal_transport(
    scores: ArrayView2<f32>,
    bin_score: f32,
    iterations: usize,
) -> Array2<f32> {
    let (m, n) = scores.dim();
    trace!("Solving {}x{} transport with {} iterations.", m, n, iterations);

    let mut couplings = Array2::from_elem((m + 1, n + 1), bin_score);
    couplings.slice_mut(s![..m, ..n]).assign(&scores);

    let norm = -((m + n) as f32).ln();
    let mut log_mu = Array1::from_elem(m + 1, norm);
    log_mu[m] = (n as f32).ln() + norm;
    let mut log_nu = Array1::from_elem(n + 1, norm);
    log_nu[n] = (m as f32).ln() + norm;

    let mut z = log_sinkhorn(couplings.view(), log_mu.view(), log_nu.view(), iterations);
    // Rescale from transport mass back to per-point probabilities.
    z -= norm;
    z
}
