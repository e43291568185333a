//! SuperGlue feature matching middle-end.
//!
//! Given two sets of keypoints with confidence scores and visual
//! descriptors, correspondences are determined by:
//! 1. keypoint encoding (coordinate normalization plus position/score fusion),
//! 2. a graph neural network alternating self- and cross-attention layers,
//! 3. a final linear projection,
//! 4. an optimal transport layer (log-domain Sinkhorn with dustbins),
//! 5. mutual-nearest-neighbor extraction gated by a match threshold.
//!
//! Correspondence ids use -1 to indicate non-matching points.
//!
//! Paul-Edouard Sarlin, Daniel DeTone, Tomasz Malisiewicz, and Andrew
//! Rabinovich. SuperGlue: Learning Feature Matching with Graph Neural
//! Networks. In CVPR, 2020. <https://arxiv.org/abs/1911.11763>
//!
//! The crate performs inference only; training, weight persistence, and
//! upstream feature extraction all live elsewhere. The model consumes a
//! fully-initialized [`Weights`] blob supplied by an external loader, keyed
//! by a [`WeightProfile`].

mod attention;
mod error;
mod gnn;
mod keypoint_encoder;
mod matching;
mod mlp;
mod optimal_transport;

pub use attention::MultiHeadAttention;
pub use error::{Error, Result};
pub use gnn::{
    AttentionalGnn, AttentionalPropagation, LayerAttention, LayerKind, DEFAULT_NUM_HEADS,
};
pub use keypoint_encoder::{normalize_keypoints, KeypointEncoder};
pub use matching::{extract_matches, Matches};
pub use mlp::{BatchNorm, Linear, Mlp, MlpLayer};
pub use optimal_transport::{log_optimal_transport, log_sinkhorn};

use log::*;
use ndarray::{Array1, ArrayView1, ArrayView2};
use std::str::FromStr;

/// Named pretrained parameter presets the external weight loader recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightProfile {
    Indoor,
    Outdoor,
}

impl WeightProfile {
    /// The key the weight loader uses to locate the parameter blob.
    pub fn as_str(&self) -> &'static str {
        match self {
            WeightProfile::Indoor => "indoor",
            WeightProfile::Outdoor => "outdoor",
        }
    }
}

impl FromStr for WeightProfile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "indoor" => Ok(WeightProfile::Indoor),
            "outdoor" => Ok(WeightProfile::Outdoor),
            _ => Err(Error::UnknownWeightProfile {
                name: s.to_string(),
            }),
        }
    }
}

/// Contains the configuration parameters of the matcher.
///
/// The most important parameter to pay attention to is `match_threshold`.
/// [`Config::new`] can be used to set this threshold and let all other
/// parameters remain default. The default value is `0.2`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Width of the visual descriptors and of every internal embedding.
    pub descriptor_dim: usize,

    /// Hidden widths of the keypoint encoder MLP.
    pub keypoint_encoder: Vec<usize>,

    /// Attention source schedule of the graph network.
    pub gnn_layers: Vec<LayerKind>,

    /// Number of log-domain Sinkhorn iterations.
    pub sinkhorn_iterations: usize,

    /// Minimum exponentiated assignment score to accept a match.
    pub match_threshold: f32,

    /// Pretrained parameter preset the weight loader should fetch.
    pub weights: WeightProfile,
}

impl Config {
    /// This convenience constructor is provided for the very common case
    /// that the match threshold needs to be modified.
    pub fn new(match_threshold: f32) -> Self {
        Self {
            match_threshold,
            ..Default::default()
        }
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            descriptor_dim: 256,
            keypoint_encoder: vec![32, 64, 128, 256],
            gnn_layers: [LayerKind::SelfAttention, LayerKind::CrossAttention]
                .into_iter()
                .cycle()
                .take(18)
                .collect(),
            sinkhorn_iterations: 50,
            match_threshold: 0.2,
            weights: WeightProfile::Indoor,
        }
    }
}

/// Fully-initialized model parameters, produced by an external weight loader
/// for one [`WeightProfile`].
#[derive(Debug, Clone)]
pub struct Weights {
    pub keypoint_encoder: KeypointEncoder,
    pub gnn: AttentionalGnn,
    pub final_proj: Linear,
    /// Learned score of routing a point to the dustbin, shared by both
    /// dustbins and the corner cell.
    pub bin_score: f32,
}

/// The assembled matcher: frozen parameters plus configuration.
///
/// Construction validates every parameter shape against the configured
/// architecture, so any disagreement surfaces immediately rather than on the
/// first call. A `SuperGlue` value is immutable after construction; calls
/// allocate their own intermediates, so `&self` matching is safe to run
/// concurrently.
#[derive(Debug, Clone)]
pub struct SuperGlue {
    config: Config,
    kenc: KeypointEncoder,
    gnn: AttentionalGnn,
    final_proj: Linear,
    bin_score: f32,
}

impl SuperGlue {
    pub fn new(config: Config, weights: Weights) -> Result<Self> {
        let d = config.descriptor_dim;

        let mut expected_channels = Vec::with_capacity(config.keypoint_encoder.len() + 2);
        expected_channels.push(3);
        expected_channels.extend_from_slice(&config.keypoint_encoder);
        expected_channels.push(d);
        if weights.keypoint_encoder.channels() != expected_channels {
            return Err(Error::WeightShape {
                what: "keypoint encoder channels",
                expected: format!("{expected_channels:?}"),
                found: format!("{:?}", weights.keypoint_encoder.channels()),
            });
        }

        if weights.gnn.kinds() != config.gnn_layers {
            return Err(Error::WeightShape {
                what: "gnn layer schedule",
                expected: format!("{:?}", config.gnn_layers),
                found: format!("{:?}", weights.gnn.kinds()),
            });
        }
        if weights.gnn.d_model() != d {
            return Err(Error::WeightShape {
                what: "gnn descriptor width",
                expected: d.to_string(),
                found: weights.gnn.d_model().to_string(),
            });
        }

        if weights.final_proj.in_dim() != d || weights.final_proj.out_dim() != d {
            return Err(Error::WeightShape {
                what: "final projection",
                expected: format!("{d}x{d}"),
                found: format!(
                    "{}x{}",
                    weights.final_proj.out_dim(),
                    weights.final_proj.in_dim()
                ),
            });
        }

        info!(
            "Assembled SuperGlue model ({:?} profile, {} gnn layers)",
            config.weights,
            config.gnn_layers.len()
        );
        Ok(Self {
            config,
            kenc: weights.keypoint_encoder,
            gnn: weights.gnn,
            final_proj: weights.final_proj,
            bin_score: weights.bin_score,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Match two keypoint sets.
    ///
    /// # Arguments
    /// * `kpts0`, `kpts1` - `(N, 2)` pixel coordinates per set.
    /// * `desc0`, `desc1` - `(N, D)` visual descriptors, index-aligned.
    /// * `scores0`, `scores1` - length-N detection confidences.
    /// * `shape0`, `shape1` - the image `(width, height)` pairs.
    /// # Return value
    /// Per-keypoint match indices into the second set (`-1` = unmatched)
    /// and match confidences, both for the first set only.
    #[allow(clippy::too_many_arguments)]
    pub fn match_features(
        &self,
        kpts0: ArrayView2<f32>,
        kpts1: ArrayView2<f32>,
        desc0: ArrayView2<f32>,
        desc1: ArrayView2<f32>,
        scores0: ArrayView1<f32>,
        scores1: ArrayView1<f32>,
        shape0: (f32, f32),
        shape1: (f32, f32),
    ) -> Result<Matches> {
        let n0 = kpts0.nrows();
        let n1 = kpts1.nrows();
        if n0 == 0 || n1 == 0 {
            debug!("One side has no keypoints ({} vs {}), skipping.", n0, n1);
            // The score buffer is sized by the two components of `shape0`,
            // not by the keypoint count, in both branches.
            return Ok(Matches {
                indices0: Array1::from_elem(n0, -1.0),
                mscores0: Array1::zeros(2),
            });
        }
        self.validate_inputs(kpts0, kpts1, desc0, desc1, scores0, scores1)?;

        trace!("Normalizing keypoint coordinates.");
        let kpts0 = normalize_keypoints(kpts0, shape0);
        let kpts1 = normalize_keypoints(kpts1, shape1);

        trace!("Encoding keypoints into descriptors.");
        let mut desc0 = desc0.t().to_owned();
        let mut desc1 = desc1.t().to_owned();
        desc0 += &self.kenc.forward(kpts0.view(), scores0);
        desc1 += &self.kenc.forward(kpts1.view(), scores1);

        trace!("Running the attentional graph network.");
        let (desc0, desc1) = self.gnn.forward(desc0.view(), desc1.view());

        trace!("Projecting matching descriptors.");
        let mdesc0 = self.final_proj.forward(desc0.view());
        let mdesc1 = self.final_proj.forward(desc1.view());

        let mut scores = mdesc0.t().dot(&mdesc1);
        scores /= (self.config.descriptor_dim as f32).sqrt();

        trace!(
            "Running optimal transport ({} iterations).",
            self.config.sinkhorn_iterations
        );
        let coupling = log_optimal_transport(
            scores.view(),
            self.bin_score,
            self.config.sinkhorn_iterations,
        );

        let matches = extract_matches(coupling.view(), self.config.match_threshold);
        info!("Matched {}/{} keypoints", matches.len(), n0);
        Ok(matches)
    }

    fn validate_inputs(
        &self,
        kpts0: ArrayView2<f32>,
        kpts1: ArrayView2<f32>,
        desc0: ArrayView2<f32>,
        desc1: ArrayView2<f32>,
        scores0: ArrayView1<f32>,
        scores1: ArrayView1<f32>,
    ) -> Result<()> {
        let d = self.config.descriptor_dim;
        validate_set(
            d,
            ("kpts0 coordinate width", "desc0 shape", "scores0 length"),
            kpts0,
            desc0,
            scores0,
        )?;
        validate_set(
            d,
            ("kpts1 coordinate width", "desc1 shape", "scores1 length"),
            kpts1,
            desc1,
            scores1,
        )?;
        Ok(())
    }
}

/// Check one set's keypoints, descriptors, and scores against each other and
/// the configured descriptor width.
fn validate_set(
    d: usize,
    (kpts_what, desc_what, scores_what): (&'static str, &'static str, &'static str),
    kpts: ArrayView2<f32>,
    desc: ArrayView2<f32>,
    scores: ArrayView1<f32>,
) -> Result<()> {
    let n = kpts.nrows();
    if kpts.ncols() != 2 {
        return Err(Error::ShapeMismatch {
            what: kpts_what,
            expected: "2".to_string(),
            found: kpts.ncols().to_string(),
        });
    }
    if desc.dim() != (n, d) {
        return Err(Error::ShapeMismatch {
            what: desc_what,
            expected: format!("({n}, {d})"),
            found: format!("{:?}", desc.dim()),
        });
    }
    if scores.len() != n {
        return Err(Error::ShapeMismatch {
            what: scores_what,
            expected: n.to_string(),
            found: scores.len().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2};

    fn tiny_weights(dim: usize, final_proj: Linear) -> Weights {
        let encoder = Mlp::new(vec![
            MlpLayer::hidden(
                Linear::new(Array2::zeros((dim, 3)), Array1::zeros(dim)).unwrap(),
                BatchNorm::identity(dim),
            ),
            MlpLayer::output(Linear::identity(dim)),
        ])
        .unwrap();
        let propagation = |_| {
            let attn = MultiHeadAttention::new(
                2,
                Linear::identity(dim),
                Linear::identity(dim),
                Linear::identity(dim),
                Linear::identity(dim),
            )
            .unwrap();
            let mlp = Mlp::new(vec![
                MlpLayer::hidden(
                    Linear::new(Array2::zeros((2 * dim, 2 * dim)), Array1::zeros(2 * dim))
                        .unwrap(),
                    BatchNorm::identity(2 * dim),
                ),
                MlpLayer::output(
                    Linear::new(Array2::zeros((dim, 2 * dim)), Array1::zeros(dim)).unwrap(),
                ),
            ])
            .unwrap();
            AttentionalPropagation::new(attn, mlp).unwrap()
        };
        Weights {
            keypoint_encoder: KeypointEncoder::new(encoder).unwrap(),
            gnn: AttentionalGnn::new(vec![
                (LayerKind::SelfAttention, propagation(0)),
                (LayerKind::CrossAttention, propagation(1)),
            ])
            .unwrap(),
            final_proj,
            bin_score: 1.0,
        }
    }

    fn tiny_config(dim: usize) -> Config {
        Config {
            descriptor_dim: dim,
            keypoint_encoder: vec![dim],
            gnn_layers: vec![LayerKind::SelfAttention, LayerKind::CrossAttention],
            ..Default::default()
        }
    }

    #[test]
    fn default_config_matches_published_model() {
        let config = Config::default();
        assert_eq!(config.descriptor_dim, 256);
        assert_eq!(config.keypoint_encoder, vec![32, 64, 128, 256]);
        assert_eq!(config.gnn_layers.len(), 18);
        assert_eq!(config.gnn_layers[0], LayerKind::SelfAttention);
        assert_eq!(config.gnn_layers[1], LayerKind::CrossAttention);
        assert_eq!(config.gnn_layers[17], LayerKind::CrossAttention);
        assert_eq!(config.sinkhorn_iterations, 50);
        assert!((config.match_threshold - 0.2).abs() < f32::EPSILON);
        assert_eq!(config.weights, WeightProfile::Indoor);
    }

    #[test]
    fn weight_profiles_parse_and_fail_fast() {
        assert_eq!("indoor".parse::<WeightProfile>().unwrap(), WeightProfile::Indoor);
        assert_eq!("outdoor".parse::<WeightProfile>().unwrap(), WeightProfile::Outdoor);
        assert!(matches!(
            "underwater".parse::<WeightProfile>(),
            Err(Error::UnknownWeightProfile { .. })
        ));
    }

    #[test]
    fn construction_rejects_wrong_final_projection() {
        let bad_proj = Linear::identity(6);
        let result = SuperGlue::new(tiny_config(4), tiny_weights(4, bad_proj));
        assert!(matches!(result, Err(Error::WeightShape { .. })));
    }

    #[test]
    fn construction_rejects_wrong_schedule() {
        let mut config = tiny_config(4);
        config.gnn_layers = vec![LayerKind::CrossAttention, LayerKind::SelfAttention];
        let result = SuperGlue::new(config, tiny_weights(4, Linear::identity(4)));
        assert!(matches!(result, Err(Error::WeightShape { .. })));
    }

    #[test]
    fn call_rejects_descriptor_width_mismatch() {
        let model = SuperGlue::new(tiny_config(4), tiny_weights(4, Linear::identity(4))).unwrap();
        let kpts = Array2::<f32>::zeros((2, 2));
        let desc_bad = Array2::<f32>::zeros((2, 3));
        let desc_ok = Array2::<f32>::zeros((2, 4));
        let scores = Array1::<f32>::ones(2);
        let result = model.match_features(
            kpts.view(),
            kpts.view(),
            desc_bad.view(),
            desc_ok.view(),
            scores.view(),
            scores.view(),
            (64.0, 48.0),
            (64.0, 48.0),
        );
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn call_rejects_second_set_score_length_mismatch() {
        let model = SuperGlue::new(tiny_config(4), tiny_weights(4, Linear::identity(4))).unwrap();
        let kpts = Array2::<f32>::zeros((2, 2));
        let desc = Array2::<f32>::zeros((2, 4));
        let scores_ok = Array1::<f32>::ones(2);
        let scores_bad = Array1::<f32>::ones(3);
        let result = model.match_features(
            kpts.view(),
            kpts.view(),
            desc.view(),
            desc.view(),
            scores_ok.view(),
            scores_bad.view(),
            (64.0, 48.0),
            (64.0, 48.0),
        );
        assert!(matches!(
            result,
            Err(Error::ShapeMismatch {
                what: "scores1 length",
                ..
            })
        ));
    }
}
