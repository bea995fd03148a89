//! U-Net with a low resolution feature branch.
//!
//! ```text
//!     f_in --> f_left --------------------------->> f_right --> f_out
//!                 |                                   ^
//!                 v                                   |
//!              g_in --> g_left ------->> g_right --> g_out
//!                          |               ^
//!                          v               |
//!                                ...
//! ```
//!
//! Each `-->` is a convolution pass, each `-->>` a crop, down and up arrows are
//! max pooling and upsampling. At `layer_concat` the low resolution inputs are
//! upsampled into one tensor, coarsest to finest, and concatenated to `f_left`
//! before a further convolution pass.
use candle::{bail, Result, Tensor};
use candle_nn::VarBuilder;

use crate::config::{Config, Padding, LOW_RES_FACTOR};
use crate::ops::{crop_spatial, downsample, factors2, ConvPass, Upsample};

#[derive(Debug)]
struct LowResFusion {
    convs: Vec<ConvPass>,
    ups: Vec<Upsample>,
    merge: ConvPass,
    span: tracing::Span,
}

impl LowResFusion {
    fn new(cfg: &Config, layer: usize, vb: &VarBuilder) -> Result<Self> {
        let n = cfg.low_res_channels.len();
        let factors = (LOW_RES_FACTOR, LOW_RES_FACTOR);
        let mut convs = Vec::with_capacity(n);
        let mut ups = Vec::with_capacity(n);
        for (i, &in_channels) in cfg.low_res_channels.iter().enumerate() {
            let conv = ConvPass::new(
                in_channels,
                cfg.num_fmaps_concat,
                cfg.kernel_size,
                cfg.num_repetitions,
                cfg.activation,
                Padding::Valid,
                &format!("low_res_{i}"),
                vb.clone(),
            )?;
            convs.push(conv);
            // Every branch but the first also carries the upsampled previous one.
            let up_in = match i {
                0 => cfg.num_fmaps_concat,
                i => cfg.num_fmaps_concat + cfg.low_res_up_fmaps(i - 1),
            };
            let up = Upsample::new(
                up_in,
                factors,
                cfg.low_res_up_fmaps(i),
                cfg.activation,
                cfg.padding,
                cfg.upsampling,
                vb.pp(format!("low_res_up_{i}")),
            )?;
            ups.push(up);
        }
        let merge_in = cfg.fmaps_at(layer) + cfg.low_res_up_fmaps(n - 1);
        let merge = ConvPass::new(
            merge_in,
            cfg.left_fmaps(layer),
            cfg.kernel_size,
            cfg.num_repetitions,
            cfg.activation,
            Padding::Valid,
            &format!("unet_layer_{layer}_left_after_concat"),
            vb.clone(),
        )?;
        let span = tracing::span!(tracing::Level::TRACE, "low-res-fusion");
        Ok(Self {
            convs,
            ups,
            merge,
            span,
        })
    }

    fn fuse(&self, low_res: &[Tensor]) -> Result<Tensor> {
        let _enter = self.span.enter();
        if low_res.len() != self.convs.len() {
            bail!(
                "got {} low resolution inputs, expected {}",
                low_res.len(),
                self.convs.len()
            )
        }
        let mut fused: Option<Tensor> = None;
        for (i, ((xs, conv), up)) in low_res
            .iter()
            .zip(self.convs.iter())
            .zip(self.ups.iter())
            .enumerate()
        {
            let branch = xs.apply(conv)?;
            tracing::debug!("low_res: {i} {:?}", branch.dims());
            let branch = match fused {
                None => branch,
                Some(prev) => {
                    let prev = crop_spatial(&prev, branch.dims())?;
                    Tensor::cat(&[&branch, &prev], 1)?
                }
            };
            let branch = branch.apply(up)?;
            tracing::debug!("low_res_up: {i} {:?}", branch.dims());
            fused = Some(branch)
        }
        match fused {
            Some(fused) => Ok(fused),
            None => bail!("no low resolution input to fuse"),
        }
    }

    fn merge(&self, f_left: &Tensor, fused: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let fused = crop_spatial(fused, f_left.dims())?;
        let xs = Tensor::cat(&[f_left, &fused], 1)?;
        tracing::debug!("concat fmaps and f_left: {:?}", xs.dims());
        xs.apply(&self.merge)
    }
}

#[derive(Debug)]
struct Expanding {
    factors: (usize, usize),
    padding: Padding,
    lower: Box<UNetLayer>,
    up: Upsample,
    right: ConvPass,
}

#[derive(Debug)]
struct UNetLayer {
    layer: usize,
    fusion: Option<LowResFusion>,
    left: ConvPass,
    expanding: Option<Expanding>,
    out_channels: usize,
    span: tracing::Span,
}

impl UNetLayer {
    fn new(cfg: &Config, layer: usize, in_channels: usize, vb: &VarBuilder) -> Result<Self> {
        let fusion = if cfg.fusion_layer() == Some(layer) {
            Some(LowResFusion::new(cfg, layer, vb)?)
        } else {
            None
        };
        let left = ConvPass::new(
            in_channels,
            cfg.fmaps_at(layer),
            cfg.kernel_size,
            cfg.num_repetitions,
            cfg.activation,
            cfg.padding,
            &format!("unet_layer_{layer}_left"),
            vb.clone(),
        )?;
        let left_channels = cfg.left_fmaps(layer);
        let span = tracing::span!(tracing::Level::TRACE, "unet-layer", layer);
        if layer == cfg.depth() {
            return Ok(Self {
                layer,
                fusion,
                left,
                expanding: None,
                out_channels: left_channels,
                span,
            });
        }

        let factors = factors2(&cfg.downsample_factors[layer])?;
        let lower = UNetLayer::new(cfg, layer + 1, left_channels, vb)?;
        let up_fmaps = cfg.up_fmaps(layer).map_err(candle::Error::wrap)?;
        let up = Upsample::new(
            lower.out_channels,
            factors,
            up_fmaps,
            cfg.activation,
            cfg.padding,
            cfg.upsampling,
            vb.pp(format!("unet_up_{}_to_{layer}", layer + 1)),
        )?;
        let right = ConvPass::new(
            left_channels + up_fmaps,
            up_fmaps,
            cfg.kernel_size,
            cfg.num_repetitions,
            cfg.activation,
            cfg.padding,
            &format!("unet_layer_{layer}_right"),
            vb.clone(),
        )?;
        Ok(Self {
            layer,
            fusion,
            left,
            expanding: Some(Expanding {
                factors,
                padding: cfg.padding,
                lower: Box::new(lower),
                up,
                right,
            }),
            out_channels: up_fmaps,
            span,
        })
    }

    fn forward(&self, xs: &Tensor, low_res: &[Tensor]) -> Result<Tensor> {
        let _enter = self.span.enter();
        let prefix = "    ".repeat(self.layer);
        tracing::debug!("{prefix}U-Net layer {}, f_in: {:?}", self.layer, xs.dims());

        let f_left = match &self.fusion {
            None => xs.apply(&self.left)?,
            Some(fusion) => {
                tracing::debug!("{prefix}upsampling fmaps branch");
                let fused = fusion.fuse(low_res)?;
                let f_left = xs.apply(&self.left)?;
                fusion.merge(&f_left, &fused)?
            }
        };

        let exp = match &self.expanding {
            None => {
                tracing::debug!("{prefix}bottom layer, f_out: {:?}", f_left.dims());
                return Ok(f_left);
            }
            Some(exp) => exp,
        };
        let g_in = downsample(&f_left, exp.factors, exp.padding)?;
        let g_out = exp.lower.forward(&g_in, low_res)?;
        tracing::debug!("{prefix}g_out: {:?}", g_out.dims());

        let g_out_upsampled = g_out.apply(&exp.up)?;
        tracing::debug!("{prefix}g_out_upsampled: {:?}", g_out_upsampled.dims());

        let f_left_cropped = crop_spatial(&f_left, g_out_upsampled.dims())?;
        let f_right = Tensor::cat(&[&f_left_cropped, &g_out_upsampled], 1)?;
        tracing::debug!("{prefix}f_right: {:?}", f_right.dims());

        let f_out = f_right.apply(&exp.right)?;
        tracing::debug!("{prefix}f_out: {:?}", f_out.dims());
        Ok(f_out)
    }
}

/// The full network, see the module documentation for its layout.
///
/// Variables are named after the layer they belong to, e.g.
/// `unet_layer_0_left_1.weight` for the second convolution of the top encoder
/// pass or `low_res_up_2.bias` for the upsampling of the third low resolution
/// input.
#[derive(Debug)]
pub struct UNetWithFmap {
    root: UNetLayer,
    config: Config,
    span: tracing::Span,
}

impl UNetWithFmap {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        cfg.validate().map_err(candle::Error::wrap)?;
        if cfg.spatial_dims() != 2 {
            bail!(
                "only 2d networks can be built, got {}d factors",
                cfg.spatial_dims()
            )
        }
        let root = UNetLayer::new(cfg, 0, cfg.in_channels, &vb)?;
        let span = tracing::span!(tracing::Level::TRACE, "unet-with-fmap");
        Ok(Self {
            root,
            config: cfg.clone(),
            span,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Channels of the tensor returned by `forward`.
    pub fn out_channels(&self) -> usize {
        self.root.out_channels
    }

    /// `xs` has shape `(1, in_channels, h, w)`, `low_res` holds one tensor per
    /// configured low resolution input, coarsest first. It is only used when the
    /// fusion layer is reached and can be empty otherwise.
    pub fn forward(&self, xs: &Tensor, low_res: &[Tensor]) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b_sz, c, _, _) = xs.dims4()?;
        if b_sz != 1 || c != self.config.in_channels {
            bail!(
                "expected an input of shape (1, {}, h, w), got {:?}",
                self.config.in_channels,
                xs.shape()
            )
        }
        if self.config.fusion_layer().is_some() {
            for (i, (t, &c)) in low_res
                .iter()
                .zip(self.config.low_res_channels.iter())
                .enumerate()
            {
                let (b_sz, t_c, _, _) = t.dims4()?;
                if b_sz != 1 || t_c != c {
                    bail!(
                        "low resolution input {i} should have shape (1, {c}, h, w), got {:?}",
                        t.shape()
                    )
                }
            }
        }
        self.root.forward(xs, low_res)
    }
}
