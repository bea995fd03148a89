//! Network configuration and the feature map arithmetic derived from it.
use serde::{Deserialize, Serialize};

use crate::activation::Activation;
use crate::error::{ConfigError, Result};

/// Number of fusion steps the widths around the fusion layer are sized for.
///
/// Both the merge convolution and every decoder upsampling add
/// `num_fmaps_concat / 2 * FUSION_STEPS` feature maps, whatever the number of
/// low resolution inputs actually is.
pub const FUSION_STEPS: usize = 5;

/// Upsampling factors used between two low resolution inputs.
pub const LOW_RES_FACTOR: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
    /// No padding, every convolution shrinks its input by `kernel_size - 1`.
    #[default]
    Valid,
    /// Zero padding so that stride one convolutions preserve their input extent.
    Same,
}

impl Padding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Same => "same",
        }
    }
}

impl std::str::FromStr for Padding {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "valid" => Ok(Self::Valid),
            "same" => Ok(Self::Same),
            _ => Err(ConfigError::UnknownPadding(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Upsampling {
    /// Learned transposed convolution with stride equal to the factors.
    #[default]
    TransConv,
    /// Nearest neighbour resize followed by a convolution with a kernel equal
    /// to the factors.
    ResizeConv,
}

impl Upsampling {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransConv => "trans_conv",
            Self::ResizeConv => "resize_conv",
        }
    }
}

impl std::str::FromStr for Upsampling {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "trans_conv" => Ok(Self::TransConv),
            "resize_conv" => Ok(Self::ResizeConv),
            _ => Err(ConfigError::UnknownUpsampling(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Channels of the root input.
    pub in_channels: usize,
    /// Feature maps of the first layer.
    pub num_fmaps: usize,
    /// Multiplier applied to the feature maps when going one layer down.
    pub fmap_inc_factors: Vec<usize>,
    /// Divisor used when sizing the decoder widths.
    pub fmap_dec_factors: Vec<usize>,
    /// Pooling factors between layers, `[y, x]` or `[z, y, x]`.
    pub downsample_factors: Vec<Vec<usize>>,
    pub kernel_size: usize,
    pub num_repetitions: usize,
    pub activation: Option<Activation>,
    pub padding: Padding,
    pub upsampling: Upsampling,
    /// Layer at which the low resolution inputs get merged in, `None` disables the
    /// fusion.
    pub layer_concat: Option<usize>,
    /// Feature maps produced by the convolution pass of each low resolution input.
    pub num_fmaps_concat: usize,
    /// Channels of the low resolution inputs, coarsest first.
    pub low_res_channels: Vec<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            in_channels: 1,
            num_fmaps: 12,
            fmap_inc_factors: vec![5, 5, 5],
            fmap_dec_factors: vec![5, 5, 5],
            downsample_factors: vec![vec![3, 3], vec![3, 3], vec![3, 3]],
            kernel_size: 3,
            num_repetitions: 2,
            activation: Some(Activation::Relu),
            padding: Padding::Valid,
            upsampling: Upsampling::TransConv,
            layer_concat: None,
            num_fmaps_concat: 128,
            low_res_channels: vec![],
        }
    }
}

impl Config {
    pub fn from_json_str(s: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn from_json_file<P: AsRef<std::path::Path>>(path: P) -> candle::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&data).map_err(candle::Error::wrap)?;
        Ok(config)
    }

    /// Number of downsampling steps, the bottom layer has this index.
    pub fn depth(&self) -> usize {
        self.downsample_factors.len()
    }

    /// Number of spatial axes, 2 or 3.
    pub fn spatial_dims(&self) -> usize {
        self.downsample_factors.first().map_or(2, |f| f.len())
    }

    /// The layer at which the fusion actually happens, if the recursion reaches it.
    pub fn fusion_layer(&self) -> Option<usize> {
        self.layer_concat.filter(|&l| l <= self.depth())
    }

    /// Feature maps of the encoder convolution at `layer`.
    pub fn fmaps_at(&self, layer: usize) -> usize {
        self.num_fmaps * self.fmap_inc_factors[..layer].iter().product::<usize>()
    }

    /// Extra feature maps carried by every decoder layer and the merge convolution.
    pub fn concat_width(&self) -> usize {
        self.num_fmaps_concat * FUSION_STEPS / 2
    }

    /// Output feature maps when upsampling the `i`-th low resolution branch.
    pub fn low_res_up_fmaps(&self, i: usize) -> usize {
        self.num_fmaps_concat * (i + 1) / 2
    }

    /// Feature maps leaving the encoder side of `layer`, i.e. after the merge
    /// convolution when `layer` is the fusion layer.
    pub fn left_fmaps(&self, layer: usize) -> usize {
        let fmaps = self.fmaps_at(layer);
        if self.fusion_layer() == Some(layer) {
            fmaps + self.concat_width()
        } else {
            fmaps
        }
    }

    /// Feature maps produced by the upsampling into `layer` and by the right
    /// convolution pass of that layer.
    pub fn up_fmaps(&self, layer: usize) -> Result<usize> {
        let num = self.fmaps_at(layer) * self.fmap_inc_factors[layer..].iter().product::<usize>();
        let den = self.fmap_dec_factors[layer..].iter().product::<usize>();
        if den == 0 || num % den != 0 {
            return Err(ConfigError::FractionalWidth { layer, num, den });
        }
        Ok(num / den + self.concat_width())
    }

    /// Feature maps of the network output.
    pub fn out_channels(&self) -> Result<usize> {
        if self.depth() == 0 {
            Ok(self.left_fmaps(0))
        } else {
            self.up_fmaps(0)
        }
    }

    /// Makes sure that every width used when building the network fits in a
    /// `usize`, so that the unchecked accessors above cannot overflow.
    fn check_widths(&self) -> Result<()> {
        let product = |init: usize, factors: &[usize]| {
            factors.iter().try_fold(init, |acc, &f| acc.checked_mul(f))
        };
        let steps = FUSION_STEPS.max(self.low_res_channels.len());
        let concat = self.num_fmaps_concat.checked_mul(steps);
        for layer in 0..=self.depth() {
            let fmaps = product(self.num_fmaps, &self.fmap_inc_factors[..layer]);
            let num = fmaps.and_then(|f| product(f, &self.fmap_inc_factors[layer..]));
            let den = product(1, &self.fmap_dec_factors[layer..]);
            // Right passes see the skip connection and the upsampled maps.
            let right_in = num
                .zip(concat)
                .and_then(|(n, c)| n.checked_add(c))
                .and_then(|w| w.checked_mul(2));
            let left = fmaps.zip(concat).and_then(|(f, c)| f.checked_add(c));
            if left.is_none() || den.is_none() || right_in.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "feature map width of layer {layer} overflows"
                )));
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let depth = self.depth();
        let rank = self.spatial_dims();
        if rank != 2 && rank != 3 {
            return Err(ConfigError::Invalid(format!(
                "downsample factors must have 2 or 3 entries, got {rank}"
            )));
        }
        for (layer, factors) in self.downsample_factors.iter().enumerate() {
            if factors.len() != rank {
                return Err(ConfigError::FactorRank {
                    layer,
                    expected: rank,
                    got: factors.len(),
                });
            }
            if factors.iter().any(|&f| f == 0) {
                return Err(ConfigError::Invalid(format!(
                    "downsample factors for layer {layer} contain a zero: {factors:?}"
                )));
            }
        }
        for (name, factors) in [
            ("fmap_inc_factors", &self.fmap_inc_factors),
            ("fmap_dec_factors", &self.fmap_dec_factors),
        ] {
            if factors.len() != depth {
                return Err(ConfigError::FactorCount {
                    name,
                    expected: depth,
                    got: factors.len(),
                });
            }
        }
        if self.fmap_dec_factors.iter().any(|&f| f == 0) {
            return Err(ConfigError::Invalid(
                "fmap_dec_factors must be positive".to_string(),
            ));
        }
        for (name, value) in [
            ("in_channels", self.in_channels),
            ("num_fmaps", self.num_fmaps),
            ("kernel_size", self.kernel_size),
            ("num_repetitions", self.num_repetitions),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        self.check_widths()?;
        match (self.layer_concat, self.fusion_layer()) {
            (_, Some(layer)) => {
                if self.low_res_channels.is_empty() {
                    return Err(ConfigError::MissingLowRes { layer });
                }
                if self.num_fmaps_concat < 2 {
                    return Err(ConfigError::Invalid(
                        "num_fmaps_concat must be at least 2 when fusing".to_string(),
                    ));
                }
                if self.low_res_channels.iter().any(|&c| c == 0) {
                    return Err(ConfigError::Invalid(
                        "low resolution inputs must have channels".to_string(),
                    ));
                }
                if self.low_res_channels.len() != FUSION_STEPS {
                    tracing::warn!(
                        "{} low resolution inputs, decoder widths are sized for {FUSION_STEPS}",
                        self.low_res_channels.len()
                    );
                }
            }
            (Some(layer), None) => {
                tracing::warn!("layer_concat {layer} is below the bottom layer {depth}, no fusion")
            }
            (None, None) => {}
        }
        for layer in 0..depth {
            self.up_fmaps(layer)?;
        }
        Ok(())
    }
}
