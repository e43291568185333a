use crate::mlp::Mlp;
use crate::{Error, Result};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

/// Normalize keypoint locations based on the image shape.
///
/// Coordinates are re-centered on the image center and divided by
/// `0.7 * max(width, height)`, making the network invariant to the absolute
/// image resolution.
///
/// # Arguments
/// * `kpts` - `(N, 2)` keypoint coordinates, row = `(x, y)`.
/// * `shape` - the image `(width, height)`.
pub fn normalize_keypoints(kpts: ArrayView2<f32>, shape: (f32, f32)) -> Array2<f32> {
    let (width, height) = shape;
    let center = (width / 2.0, height / 2.0);
    let scaling = 0.7 * width.max(height);
    let mut normalized = kpts.to_owned();
    for mut point in normalized.axis_iter_mut(Axis(0)) {
        point[0] = (point[0] - center.0) / scaling;
        point[1] = (point[1] - center.1) / scaling;
    }
    normalized
}

/// Joint encoding of location and detection confidence.
///
/// Each keypoint's normalized `(x, y)` and confidence score form a 3-channel
/// input token; the MLP lifts it to the descriptor dimension so the caller
/// can add it residually to the visual descriptor.
#[derive(Debug, Clone)]
pub struct KeypointEncoder {
    encoder: Mlp,
}

impl KeypointEncoder {
    pub fn new(encoder: Mlp) -> Result<Self> {
        if encoder.in_dim() != 3 {
            return Err(Error::WeightShape {
                what: "keypoint encoder input width",
                expected: "3".to_string(),
                found: encoder.in_dim().to_string(),
            });
        }
        Ok(Self { encoder })
    }

    /// The embedding width produced per keypoint.
    pub fn descriptor_dim(&self) -> usize {
        self.encoder.out_dim()
    }

    /// The channel widths of the underlying MLP (`3`, hidden widths, output).
    pub fn channels(&self) -> Vec<usize> {
        self.encoder.channels()
    }

    /// Encode normalized keypoints and scores into a `(D, N)` embedding.
    pub fn forward(&self, kpts: ArrayView2<f32>, scores: ArrayView1<f32>) -> Array2<f32> {
        let n = kpts.nrows();
        let mut inputs = Array2::zeros((3, n));
        inputs.row_mut(0).assign(&kpts.column(0));
        inputs.row_mut(1).assign(&kpts.column(1));
        inputs.row_mut(2).assign(&scores);
        self.encoder.forward(inputs.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mlp::{Linear, MlpLayer};
    use ndarray::{arr1, arr2};
    use test_case::test_case;

    #[test_case(100.0, 50.0, 50.0, 25.0, 0.0, 0.0; "center maps to origin")]
    #[test_case(100.0, 50.0, 120.0, 25.0, 1.0, 0.0; "seventy percent of width right of center")]
    #[test_case(80.0, 200.0, 40.0, 240.0, 0.0, 1.0; "tall image scales by height")]
    #[test_case(100.0, 50.0, 0.0, 0.0, -5.0 / 7.0, -25.0 / 70.0; "origin corner")]
    fn normalizes_against_image_shape(w: f32, h: f32, x: f32, y: f32, nx: f32, ny: f32) {
        let kpts = arr2(&[[x, y]]);
        let normalized = normalize_keypoints(kpts.view(), (w, h));
        assert!((normalized[[0, 0]] - nx).abs() < 1e-5);
        assert!((normalized[[0, 1]] - ny).abs() < 1e-5);
    }

    #[test]
    fn stacks_position_and_score_channels() {
        // An identity encoder exposes the raw 3-channel input layout.
        let encoder =
            KeypointEncoder::new(Mlp::new(vec![MlpLayer::output(Linear::identity(3))]).unwrap())
                .unwrap();
        let kpts = arr2(&[[1.0, 2.0], [3.0, 4.0]]);
        let scores = arr1(&[0.5, 0.25]);
        let encoded = encoder.forward(kpts.view(), scores.view());
        assert_eq!(encoded, arr2(&[[1.0, 3.0], [2.0, 4.0], [0.5, 0.25]]));
    }

    #[test]
    fn rejects_non_point_input_width() {
        let result = KeypointEncoder::new(Mlp::new(vec![MlpLayer::output(Linear::identity(4))]).unwrap());
        assert!(matches!(result, Err(Error::WeightShape { .. })));
    }
}
