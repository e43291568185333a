use float_ord::FloatOrd;
use ndarray::{s, Array1, ArrayView1, ArrayView2};

/// Hard matches for the first keypoint set.
///
/// `indices0[i]` holds the matched column in the second set, or `-1.0` for
/// unmatched points. Indices are carried as floats to satisfy the downstream
/// serialization contract.
#[derive(Debug, Clone, PartialEq)]
pub struct Matches {
    pub indices0: Array1<f32>,
    pub mscores0: Array1<f32>,
}

impl Matches {
    /// Number of accepted correspondences.
    pub fn len(&self) -> usize {
        self.indices0.iter().filter(|&&j| j >= 0.0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Index of the lane's maximum; the first maximum wins on ties.
fn argmax(lane: ArrayView1<f32>) -> usize {
    let mut best = 0;
    for (i, &value) in lane.iter().enumerate() {
        if FloatOrd(value) > FloatOrd(lane[best]) {
            best = i;
        }
    }
    best
}

/// Extract hard matches from a dustbin-augmented log-coupling.
///
/// The dustbin row and column are dropped; a row `i` is matched to its argmax
/// column `j` only if `j`'s argmax row is `i` in turn (mutual nearest
/// neighbor) and the exponentiated score exceeds `match_threshold`. Mutual
/// pairs keep their exponentiated score either way; non-mutual rows score 0.
pub fn extract_matches(coupling: ArrayView2<f32>, match_threshold: f32) -> Matches {
    let (rows, cols) = coupling.dim();
    debug_assert!(rows >= 1 && cols >= 1, "coupling must include dustbins");
    let scores = coupling.slice(s![..rows - 1, ..cols - 1]);
    let (m, n) = scores.dim();

    let mut indices0 = Array1::from_elem(m, -1.0f32);
    let mut mscores0 = Array1::zeros(m);
    if m == 0 || n == 0 {
        return Matches { indices0, mscores0 };
    }

    let best_col: Vec<usize> = (0..m).map(|i| argmax(scores.row(i))).collect();
    let best_row: Vec<usize> = (0..n).map(|j| argmax(scores.column(j))).collect();
    for i in 0..m {
        let j = best_col[i];
        if best_row[j] != i {
            continue;
        }
        let score = scores[[i, j]].exp();
        mscores0[i] = score;
        if score > match_threshold {
            indices0[i] = j as f32;
        }
    }
    Matches { indices0, mscores0 }
}
