use crate::mlp::Linear;
use crate::{Error, Result};
use ndarray::{s, Array2, Array3, ArrayView2, ArrayViewMut1};

/// Scaled dot-product multi-head attention over `(channels, tokens)` sequences.
///
/// Query, key, and value each pass through their own full-width projection
/// before the channel axis is split into heads; channel `c` belongs to head
/// `c % num_heads`, i.e. a contiguous reshape of the channel axis. A final
/// merge projection recombines the heads.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    merge: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl MultiHeadAttention {
    /// All four projections must be square `d_model x d_model` maps and
    /// `d_model` must divide evenly into `num_heads` heads.
    pub fn new(
        num_heads: usize,
        query: Linear,
        key: Linear,
        value: Linear,
        merge: Linear,
    ) -> Result<Self> {
        let d_model = merge.out_dim();
        for (what, proj) in [
            ("attention query projection", &query),
            ("attention key projection", &key),
            ("attention value projection", &value),
            ("attention merge projection", &merge),
        ] {
            if proj.in_dim() != d_model || proj.out_dim() != d_model {
                return Err(Error::WeightShape {
                    what,
                    expected: format!("{d_model}x{d_model}"),
                    found: format!("{}x{}", proj.out_dim(), proj.in_dim()),
                });
            }
        }
        if num_heads == 0 || d_model % num_heads != 0 {
            return Err(Error::WeightShape {
                what: "attention head count",
                expected: format!("a nonzero divisor of {d_model}"),
                found: num_heads.to_string(),
            });
        }
        Ok(Self {
            query,
            key,
            value,
            merge,
            num_heads,
            head_dim: d_model / num_heads,
        })
    }

    pub fn d_model(&self) -> usize {
        self.num_heads * self.head_dim
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Attend from `query` tokens to `key`/`value` tokens.
    ///
    /// # Arguments
    /// * `query` - `(d_model, Nq)` token sequence.
    /// * `key`, `value` - `(d_model, Nk)` token sequences.
    /// # Return value
    /// The `(d_model, Nq)` context message and the per-head attention
    /// probabilities, shaped `(num_heads, Nq, Nk)`. The probabilities are
    /// returned by value so a reused layer carries no call state.
    pub fn forward(
        &self,
        query: ArrayView2<f32>,
        key: ArrayView2<f32>,
        value: ArrayView2<f32>,
    ) -> (Array2<f32>, Array3<f32>) {
        let n_q = query.ncols();
        let n_k = key.ncols();
        let q = self.split_heads(self.query.forward(query), n_q);
        let k = self.split_heads(self.key.forward(key), n_k);
        let v = self.split_heads(self.value.forward(value), n_k);

        let scale = (self.head_dim as f32).sqrt().recip();
        let mut stacked = Array3::zeros((self.head_dim, self.num_heads, n_q));
        let mut probs = Array3::zeros((self.num_heads, n_q, n_k));
        for h in 0..self.num_heads {
            let q_h = q.slice(s![.., h, ..]);
            let k_h = k.slice(s![.., h, ..]);
            let v_h = v.slice(s![.., h, ..]);
            // (Nq, Nk) affinities, softmaxed over the key axis.
            let mut prob = q_h.t().dot(&k_h);
            prob *= scale;
            for row in prob.rows_mut() {
                softmax(row);
            }
            let message = v_h.dot(&prob.t());
            stacked.slice_mut(s![.., h, ..]).assign(&message);
            probs.slice_mut(s![h, .., ..]).assign(&prob);
        }

        let merged = stacked
            .into_shape((self.d_model(), n_q))
            .expect("head-major layout is contiguous");
        (self.merge.forward(merged.view()), probs)
    }

    // The reshapes here and in `forward` require standard-layout input;
    // `Linear::forward` upholds that by building its output with `dot`.
    fn split_heads(&self, x: Array2<f32>, n: usize) -> Array3<f32> {
        x.into_shape((self.head_dim, self.num_heads, n))
            .expect("projection output is contiguous")
    }
}

/// Numerically stable in-place softmax over one lane.
pub(crate) fn softmax(mut lane: ArrayViewMut1<f32>) {
    let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    lane.mapv_inplace(|v| (v - max).exp());
    let sum = lane.sum();
    lane.mapv_inplace(|v| v / sum);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, Array1, Array2, Axis};

    fn identity_attention(num_heads: usize, dim: usize) -> MultiHeadAttention {
        MultiHeadAttention::new(
            num_heads,
            Linear::identity(dim),
            Linear::identity(dim),
            Linear::identity(dim),
            Linear::identity(dim),
        )
        .unwrap()
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let mut lane = arr1(&[1.0, 2.0, 3.0, -1.0]);
        softmax(lane.view_mut());
        assert!((lane.sum() - 1.0).abs() < 1e-5);
        assert!(lane.iter().all(|&p| p > 0.0));
        // Larger logits get larger mass.
        assert!(lane[2] > lane[1] && lane[1] > lane[0]);
    }

    #[test]
    fn identical_keys_average_values() {
        let attn = identity_attention(2, 4);
        let query = Array2::from_elem((4, 1), 1.0);
        // Every key token is identical, so attention must be uniform and the
        // message equals the shared value token.
        let key = Array2::from_elem((4, 3), 0.5);
        let value = Array2::from_elem((4, 3), 2.0);
        let (message, probs) = attn.forward(query.view(), key.view(), value.view());
        for &p in probs.iter() {
            assert!((p - 1.0 / 3.0).abs() < 1e-5);
        }
        for &m in message.iter() {
            assert!((m - 2.0).abs() < 1e-5);
        }
    }

    #[test]
    fn attention_rows_are_distributions() {
        let attn = identity_attention(2, 4);
        let query = arr2(&[[1.0, 0.0], [0.0, 1.0], [1.0, -1.0], [0.5, 0.5]]);
        let key = arr2(&[[1.0, 2.0, 0.0], [0.0, 1.0, 1.0], [1.0, 0.0, -1.0], [0.0, 0.5, 0.5]]);
        let (_, probs) = attn.forward(query.view(), key.view(), key.view());
        assert_eq!(probs.dim(), (2, 2, 3));
        for head in probs.axis_iter(Axis(0)) {
            for row in head.rows() {
                assert!((row.sum() - 1.0).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn rejects_non_square_projection() {
        let bad = Linear::new(Array2::zeros((4, 2)), Array1::zeros(4)).unwrap();
        let result = MultiHeadAttention::new(
            2,
            bad,
            Linear::identity(4),
            Linear::identity(4),
            Linear::identity(4),
        );
        assert!(matches!(result, Err(Error::WeightShape { .. })));
    }

    #[test]
    fn rejects_indivisible_head_count() {
        let result = MultiHeadAttention::new(
            3,
            Linear::identity(4),
            Linear::identity(4),
            Linear::identity(4),
            Linear::identity(4),
        );
        assert!(matches!(result, Err(Error::WeightShape { .. })));
    }
}
