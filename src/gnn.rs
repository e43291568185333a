use crate::attention::MultiHeadAttention;
use crate::mlp::Mlp;
use crate::{Error, Result};
use ndarray::{s, Array2, Array3, ArrayView2};
use std::str::FromStr;

/// Number of attention heads used by the pretrained parameter blobs.
pub const DEFAULT_NUM_HEADS: usize = 4;

/// Attention source for one propagation step of the graph network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// Each point set attends to itself.
    SelfAttention,
    /// Each point set attends to the other set.
    CrossAttention,
}

impl LayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerKind::SelfAttention => "self",
            LayerKind::CrossAttention => "cross",
        }
    }
}

impl FromStr for LayerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "self" => Ok(LayerKind::SelfAttention),
            "cross" => Ok(LayerKind::CrossAttention),
            _ => Err(Error::UnknownLayerKind {
                name: s.to_string(),
            }),
        }
    }
}

/// One graph layer: attention from a source set, then a residual update
/// computed by an MLP over the concatenated descriptor and message.
#[derive(Debug, Clone)]
pub struct AttentionalPropagation {
    attn: MultiHeadAttention,
    mlp: Mlp,
}

impl AttentionalPropagation {
    /// The update MLP must consume the `2 * d_model` concatenation and
    /// produce a `d_model` delta.
    pub fn new(attn: MultiHeadAttention, mlp: Mlp) -> Result<Self> {
        let d_model = attn.d_model();
        if mlp.in_dim() != 2 * d_model {
            return Err(Error::WeightShape {
                what: "propagation mlp input width",
                expected: (2 * d_model).to_string(),
                found: mlp.in_dim().to_string(),
            });
        }
        if mlp.out_dim() != d_model {
            return Err(Error::WeightShape {
                what: "propagation mlp output width",
                expected: d_model.to_string(),
                found: mlp.out_dim().to_string(),
            });
        }
        Ok(Self { attn, mlp })
    }

    pub fn d_model(&self) -> usize {
        self.attn.d_model()
    }

    /// Compute the additive descriptor update for `x` attending to `source`.
    ///
    /// Returns the `(D, N)` delta and the per-head attention probabilities.
    pub fn forward(&self, x: ArrayView2<f32>, source: ArrayView2<f32>) -> (Array2<f32>, Array3<f32>) {
        let (message, prob) = self.attn.forward(x, source, source);
        let d = self.d_model();
        let mut joined = Array2::zeros((2 * d, x.ncols()));
        joined.slice_mut(s![..d, ..]).assign(&x);
        joined.slice_mut(s![d.., ..]).assign(&message);
        (self.mlp.forward(joined.view()), prob)
    }
}

/// Attention probabilities recorded for one graph layer by
/// [`AttentionalGnn::forward_probed`].
#[derive(Debug, Clone)]
pub struct LayerAttention {
    pub kind: LayerKind,
    /// Probabilities for set 0 attending to its source, `(heads, N0, Nsrc)`.
    pub prob0: Array3<f32>,
    /// Probabilities for set 1 attending to its source, `(heads, N1, Nsrc)`.
    pub prob1: Array3<f32>,
}

/// A stack of propagation layers alternating self- and cross-attention,
/// refining both descriptor sets jointly.
#[derive(Debug, Clone)]
pub struct AttentionalGnn {
    layers: Vec<(LayerKind, AttentionalPropagation)>,
}

impl AttentionalGnn {
    pub fn new(layers: Vec<(LayerKind, AttentionalPropagation)>) -> Result<Self> {
        let Some((_, first)) = layers.first() else {
            return Err(Error::WeightShape {
                what: "gnn layer count",
                expected: "at least 1".to_string(),
                found: "0".to_string(),
            });
        };
        let d_model = first.d_model();
        for (_, layer) in &layers {
            if layer.d_model() != d_model {
                return Err(Error::WeightShape {
                    what: "gnn layer width",
                    expected: d_model.to_string(),
                    found: layer.d_model().to_string(),
                });
            }
        }
        Ok(Self { layers })
    }

    pub fn d_model(&self) -> usize {
        self.layers[0].1.d_model()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// The self/cross schedule of the stack, in application order.
    pub fn kinds(&self) -> Vec<LayerKind> {
        self.layers.iter().map(|(kind, _)| *kind).collect()
    }

    /// Refine both `(D, N)` descriptor sets through the full stack.
    pub fn forward(&self, desc0: ArrayView2<f32>, desc1: ArrayView2<f32>) -> (Array2<f32>, Array2<f32>) {
        self.run(desc0, desc1, None)
    }

    /// Like [`Self::forward`], additionally recording each layer's attention
    /// probabilities into `record` (cleared on entry). The buffer belongs to
    /// the caller, so concurrent calls never share diagnostic state.
    pub fn forward_probed(
        &self,
        desc0: ArrayView2<f32>,
        desc1: ArrayView2<f32>,
        record: &mut Vec<LayerAttention>,
    ) -> (Array2<f32>, Array2<f32>) {
        record.clear();
        self.run(desc0, desc1, Some(record))
    }

    fn run(
        &self,
        desc0: ArrayView2<f32>,
        desc1: ArrayView2<f32>,
        mut record: Option<&mut Vec<LayerAttention>>,
    ) -> (Array2<f32>, Array2<f32>) {
        let mut desc0 = desc0.to_owned();
        let mut desc1 = desc1.to_owned();
        for (kind, layer) in &self.layers {
            let (src0, src1) = match kind {
                LayerKind::SelfAttention => (desc0.view(), desc1.view()),
                LayerKind::CrossAttention => (desc1.view(), desc0.view()),
            };
            // Both deltas come from the current descriptors; neither update
            // may observe the other side's advanced state.
            let (delta0, prob0) = layer.forward(desc0.view(), src0);
            let (delta1, prob1) = layer.forward(desc1.view(), src1);
            desc0 += &delta0;
            desc1 += &delta1;
            if let Some(record) = record.as_mut() {
                record.push(LayerAttention {
                    kind: *kind,
                    prob0,
                    prob1,
                });
            }
        }
        (desc0, desc1)
    }
}
