//! Shape inference for the network without allocating any tensor.
//!
//! The functions here follow the same recursion as [`crate::UNetWithFmap`] but
//! only track channel counts and spatial extents. They accept 2d as well as 3d
//! factors so volumetric configurations can be checked too.
use candle::{bail, Result};

use crate::config::{Config, Padding, Upsampling, LOW_RES_FACTOR};

/// Shape of a feature tensor, the batch size is always one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeatureShape {
    pub channels: usize,
    pub spatial: Vec<usize>,
}

impl FeatureShape {
    pub fn new(channels: usize, spatial: &[usize]) -> Self {
        Self {
            channels,
            spatial: spatial.to_vec(),
        }
    }

    /// Full tensor shape, `(1, channels, spatial...)`.
    pub fn dims(&self) -> Vec<usize> {
        let mut dims = Vec::with_capacity(self.spatial.len() + 2);
        dims.push(1);
        dims.push(self.channels);
        dims.extend_from_slice(&self.spatial);
        dims
    }
}

impl std::fmt::Display for FeatureShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(1, {}", self.channels)?;
        for d in self.spatial.iter() {
            write!(f, ", {d}")?;
        }
        write!(f, ")")
    }
}

fn check_rank(shape: &FeatureShape, factors: &[usize], op: &str) -> Result<()> {
    if shape.spatial.len() != factors.len() {
        bail!("{op}: factors {factors:?} do not match the spatial axes of {shape}")
    }
    Ok(())
}

/// Shape after a convolution pass producing `num_fmaps` maps.
pub fn conv_pass(
    shape: &FeatureShape,
    num_fmaps: usize,
    kernel_size: usize,
    num_repetitions: usize,
    padding: Padding,
) -> Result<FeatureShape> {
    let shrink = match padding {
        Padding::Valid => (kernel_size - 1) * num_repetitions,
        Padding::Same => 0,
    };
    let spatial = shape
        .spatial
        .iter()
        .map(|&d| {
            if d <= shrink {
                bail!("conv pass: {shape} vanishes with kernel {kernel_size} x {num_repetitions}")
            }
            Ok(d - shrink)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(FeatureShape {
        channels: num_fmaps,
        spatial,
    })
}

/// Shape after max pooling by `factors`.
pub fn downsample(shape: &FeatureShape, factors: &[usize], padding: Padding) -> Result<FeatureShape> {
    check_rank(shape, factors, "downsample")?;
    let spatial = shape
        .spatial
        .iter()
        .zip(factors.iter())
        .map(|(&d, &f)| {
            let d = match padding {
                Padding::Valid => d / f,
                Padding::Same => d.div_ceil(f),
            };
            if d == 0 {
                bail!("downsample: {shape} cannot be pooled by {factors:?}")
            }
            Ok(d)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(FeatureShape {
        channels: shape.channels,
        spatial,
    })
}

/// Shape after upsampling by `factors` to `num_fmaps` maps.
pub fn upsample(
    shape: &FeatureShape,
    factors: &[usize],
    num_fmaps: usize,
    padding: Padding,
    mode: Upsampling,
) -> Result<FeatureShape> {
    check_rank(shape, factors, "upsample")?;
    let spatial = shape
        .spatial
        .iter()
        .zip(factors.iter())
        .map(|(&d, &f)| match (mode, padding) {
            (Upsampling::ResizeConv, Padding::Valid) => d * f - f + 1,
            _ => d * f,
        })
        .collect();
    Ok(FeatureShape {
        channels: num_fmaps,
        spatial,
    })
}

/// Shape after a centred crop of the spatial axes to `target`.
pub fn crop_spatial(shape: &FeatureShape, target: &[usize]) -> Result<FeatureShape> {
    if shape.spatial.len() != target.len() {
        bail!("crop: cannot crop {shape} to {target:?}")
    }
    if shape.spatial.iter().zip(target.iter()).any(|(d, t)| t > d) {
        bail!("crop: target {target:?} is larger than {shape}")
    }
    Ok(FeatureShape::new(shape.channels, target))
}

/// Shape after concatenating along the channel axis.
pub fn concat(lhs: &FeatureShape, rhs: &FeatureShape) -> Result<FeatureShape> {
    if lhs.spatial != rhs.spatial {
        bail!("concat: spatial mismatch between {lhs} and {rhs}")
    }
    Ok(FeatureShape {
        channels: lhs.channels + rhs.channels,
        spatial: lhs.spatial.clone(),
    })
}

/// Shapes seen while going through one layer of the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerTrace {
    pub layer: usize,
    pub f_in: FeatureShape,
    /// Output of the encoder side, after the merge at the fusion layer.
    pub f_left: FeatureShape,
    /// Output of the upsampling from the layer below, `None` at the bottom.
    pub g_out_upsampled: Option<FeatureShape>,
    pub f_out: FeatureShape,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeTrace {
    /// One entry per layer, top layer first.
    pub layers: Vec<LayerTrace>,
    /// The merged low resolution branch, before it gets cropped to `f_left`.
    pub fused: Option<FeatureShape>,
    pub output: FeatureShape,
}

/// Shape of the fused low resolution tensor.
pub fn fuse_low_res(cfg: &Config, low_res: &[FeatureShape]) -> Result<FeatureShape> {
    let factors = vec![LOW_RES_FACTOR; cfg.spatial_dims()];
    let mut fused: Option<FeatureShape> = None;
    for (i, shape) in low_res.iter().enumerate() {
        let branch = conv_pass(
            shape,
            cfg.num_fmaps_concat,
            cfg.kernel_size,
            cfg.num_repetitions,
            Padding::Valid,
        )?;
        let branch = match fused {
            None => branch,
            Some(prev) => concat(&branch, &crop_spatial(&prev, &branch.spatial)?)?,
        };
        fused = Some(upsample(
            &branch,
            &factors,
            cfg.low_res_up_fmaps(i),
            cfg.padding,
            cfg.upsampling,
        )?);
    }
    match fused {
        Some(fused) => Ok(fused),
        None => bail!("no low resolution input to fuse"),
    }
}

fn infer_layer(
    cfg: &Config,
    layer: usize,
    f_in: &FeatureShape,
    low_res: &[FeatureShape],
    trace: &mut ShapeTrace,
) -> Result<FeatureShape> {
    let fused = if cfg.fusion_layer() == Some(layer) {
        let fused = fuse_low_res(cfg, low_res)?;
        trace.fused = Some(fused.clone());
        Some(fused)
    } else {
        None
    };
    let f_left = conv_pass(
        f_in,
        cfg.fmaps_at(layer),
        cfg.kernel_size,
        cfg.num_repetitions,
        cfg.padding,
    )?;
    let f_left = match fused {
        None => f_left,
        Some(fused) => {
            let merged = concat(&f_left, &crop_spatial(&fused, &f_left.spatial)?)?;
            conv_pass(
                &merged,
                cfg.left_fmaps(layer),
                cfg.kernel_size,
                cfg.num_repetitions,
                Padding::Valid,
            )?
        }
    };
    let index = trace.layers.len();
    trace.layers.push(LayerTrace {
        layer,
        f_in: f_in.clone(),
        f_left: f_left.clone(),
        g_out_upsampled: None,
        f_out: f_left.clone(),
    });
    if layer == cfg.depth() {
        return Ok(f_left);
    }

    let factors = &cfg.downsample_factors[layer];
    let g_in = downsample(&f_left, factors, cfg.padding)?;
    let g_out = infer_layer(cfg, layer + 1, &g_in, low_res, trace)?;
    let up_fmaps = cfg.up_fmaps(layer).map_err(candle::Error::wrap)?;
    let g_up = upsample(&g_out, factors, up_fmaps, cfg.padding, cfg.upsampling)?;
    let f_right = concat(&crop_spatial(&f_left, &g_up.spatial)?, &g_up)?;
    let f_out = conv_pass(
        &f_right,
        up_fmaps,
        cfg.kernel_size,
        cfg.num_repetitions,
        cfg.padding,
    )?;
    let entry = &mut trace.layers[index];
    entry.g_out_upsampled = Some(g_up);
    entry.f_out = f_out.clone();
    Ok(f_out)
}

/// Runs the whole network on shapes.
///
/// `input` is the root input and `low_res` the low resolution inputs, coarsest
/// first, their channels have to match the configuration.
pub fn infer_output_shape(
    cfg: &Config,
    input: &FeatureShape,
    low_res: &[FeatureShape],
) -> Result<ShapeTrace> {
    cfg.validate().map_err(candle::Error::wrap)?;
    if input.channels != cfg.in_channels {
        bail!("input has {} channels, expected {}", input.channels, cfg.in_channels)
    }
    if input.spatial.len() != cfg.spatial_dims() {
        bail!("input {input} does not have {} spatial axes", cfg.spatial_dims())
    }
    if cfg.fusion_layer().is_some() {
        if low_res.len() != cfg.low_res_channels.len() {
            bail!(
                "got {} low resolution inputs, expected {}",
                low_res.len(),
                cfg.low_res_channels.len()
            )
        }
        for (i, (shape, &c)) in low_res.iter().zip(cfg.low_res_channels.iter()).enumerate() {
            if shape.channels != c || shape.spatial.len() != cfg.spatial_dims() {
                bail!("low resolution input {i} is {shape}, expected {c} channels")
            }
        }
    }
    let mut trace = ShapeTrace {
        layers: Vec::with_capacity(cfg.depth() + 1),
        fused: None,
        output: input.clone(),
    };
    trace.output = infer_layer(cfg, 0, input, low_res, &mut trace)?;
    Ok(trace)
}
