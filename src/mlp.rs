use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2, Axis};

/// A per-token affine map on the channel axis.
///
/// Equivalent to a 1x1 convolution over a `(channels, tokens)` sequence:
/// every token column is multiplied by the same `out x in` weight matrix and
/// shifted by the same bias.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl Linear {
    pub fn new(weight: Array2<f32>, bias: Array1<f32>) -> Result<Self> {
        if bias.len() != weight.nrows() {
            return Err(Error::WeightShape {
                what: "linear bias length",
                expected: weight.nrows().to_string(),
                found: bias.len().to_string(),
            });
        }
        Ok(Self { weight, bias })
    }

    /// The identity map on `dim` channels.
    pub fn identity(dim: usize) -> Self {
        Self {
            weight: Array2::eye(dim),
            bias: Array1::zeros(dim),
        }
    }

    pub fn in_dim(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_dim(&self) -> usize {
        self.weight.nrows()
    }

    /// Apply to an `(in, tokens)` sequence, producing `(out, tokens)`.
    pub fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let mut y = self.weight.dot(&x);
        y += &self.bias.view().insert_axis(Axis(1));
        y
    }
}

/// Inference-mode batch normalization over the channel axis.
///
/// Uses frozen statistics from the parameter blob:
/// `y_c = gamma_c * (x_c - mean_c) / sqrt(var_c + eps) + beta_c`.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    gamma: Array1<f32>,
    beta: Array1<f32>,
    running_mean: Array1<f32>,
    running_var: Array1<f32>,
    eps: f32,
}

impl BatchNorm {
    pub const DEFAULT_EPS: f32 = 1e-5;

    pub fn new(
        gamma: Array1<f32>,
        beta: Array1<f32>,
        running_mean: Array1<f32>,
        running_var: Array1<f32>,
    ) -> Result<Self> {
        let dim = gamma.len();
        for (what, len) in [
            ("batchnorm beta length", beta.len()),
            ("batchnorm mean length", running_mean.len()),
            ("batchnorm variance length", running_var.len()),
        ] {
            if len != dim {
                return Err(Error::WeightShape {
                    what,
                    expected: dim.to_string(),
                    found: len.to_string(),
                });
            }
        }
        Ok(Self {
            gamma,
            beta,
            running_mean,
            running_var,
            eps: Self::DEFAULT_EPS,
        })
    }

    /// An identity normalization on `dim` channels (unit scale, zero shift).
    pub fn identity(dim: usize) -> Self {
        Self {
            gamma: Array1::ones(dim),
            beta: Array1::zeros(dim),
            running_mean: Array1::zeros(dim),
            running_var: Array1::ones(dim),
            eps: Self::DEFAULT_EPS,
        }
    }

    pub fn dim(&self) -> usize {
        self.gamma.len()
    }

    pub fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let mut y = x.to_owned();
        for (c, mut channel) in y.axis_iter_mut(Axis(0)).enumerate() {
            let scale = self.gamma[c] / (self.running_var[c] + self.eps).sqrt();
            let shift = self.beta[c] - self.running_mean[c] * scale;
            channel.mapv_inplace(|v| v * scale + shift);
        }
        y
    }
}

/// One stage of an [`Mlp`]: a linear map, optionally normalized and rectified.
#[derive(Debug, Clone)]
pub struct MlpLayer {
    pub linear: Linear,
    pub norm: Option<BatchNorm>,
    pub relu: bool,
}

impl MlpLayer {
    /// A hidden stage: linear, then batch normalization, then ReLU.
    pub fn hidden(linear: Linear, norm: BatchNorm) -> Self {
        Self {
            linear,
            norm: Some(norm),
            relu: true,
        }
    }

    /// The output stage: a bare linear map with no activation.
    pub fn output(linear: Linear) -> Self {
        Self {
            linear,
            norm: None,
            relu: false,
        }
    }
}

/// A stack of per-token linear layers acting on `(channels, tokens)` data.
#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<MlpLayer>,
}

impl Mlp {
    /// Validates that consecutive layer widths chain and that each
    /// normalization matches its layer's output width.
    pub fn new(layers: Vec<MlpLayer>) -> Result<Self> {
        if layers.is_empty() {
            return Err(Error::WeightShape {
                what: "mlp layer count",
                expected: "at least 1".to_string(),
                found: "0".to_string(),
            });
        }
        for pair in layers.windows(2) {
            if pair[1].linear.in_dim() != pair[0].linear.out_dim() {
                return Err(Error::WeightShape {
                    what: "mlp layer input width",
                    expected: pair[0].linear.out_dim().to_string(),
                    found: pair[1].linear.in_dim().to_string(),
                });
            }
        }
        for layer in &layers {
            if let Some(norm) = &layer.norm {
                if norm.dim() != layer.linear.out_dim() {
                    return Err(Error::WeightShape {
                        what: "mlp normalization width",
                        expected: layer.linear.out_dim().to_string(),
                        found: norm.dim().to_string(),
                    });
                }
            }
        }
        Ok(Self { layers })
    }

    pub fn in_dim(&self) -> usize {
        self.layers[0].linear.in_dim()
    }

    pub fn out_dim(&self) -> usize {
        self.layers[self.layers.len() - 1].linear.out_dim()
    }

    /// The channel widths along the stack: input width, then each layer's
    /// output width.
    pub fn channels(&self) -> Vec<usize> {
        let mut channels = vec![self.in_dim()];
        channels.extend(self.layers.iter().map(|l| l.linear.out_dim()));
        channels
    }

    pub fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let mut y = x.to_owned();
        for layer in &self.layers {
            y = layer.linear.forward(y.view());
            if let Some(norm) = &layer.norm {
                y = norm.forward(y.view());
            }
            if layer.relu {
                y.mapv_inplace(|v| v.max(0.0));
            }
        }
        y
    }
}
