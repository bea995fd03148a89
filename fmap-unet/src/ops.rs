//! Primitive layers of the network: convolution passes, pooling, upsampling and
//! centred crops.
use candle::{bail, Module, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

use crate::activation::Activation;
use crate::config::{Padding, Upsampling};

/// Returns the `(before, after)` zero padding that keeps a stride one
/// convolution with a `kernel` wide window at the same extent. Odd leftovers go
/// after, as in tensorflow.
fn same_padding(kernel: usize) -> (usize, usize) {
    let total = kernel.saturating_sub(1);
    (total / 2, total - total / 2)
}

pub(crate) fn factors2(factors: &[usize]) -> Result<(usize, usize)> {
    match factors {
        &[fy, fx] => Ok((fy, fx)),
        _ => bail!("expected 2d factors, got {factors:?}"),
    }
}

/// A 2d convolution with a possibly non-square kernel, stride one, and valid or
/// same padding.
#[derive(Debug, Clone)]
pub struct Conv {
    weight: Tensor,
    bias: Tensor,
    padding: Padding,
    span: tracing::Span,
}

impl Conv {
    /// `weight` has shape `(out_channels, in_channels, kh, kw)`, `bias` has shape
    /// `(out_channels,)`.
    pub fn from_weights(weight: Tensor, bias: Tensor, padding: Padding) -> Self {
        let span = tracing::span!(tracing::Level::TRACE, "conv");
        Self {
            weight,
            bias,
            padding,
            span,
        }
    }

    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        padding: Padding,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (kh, kw) = kernel;
        let init_ws = candle_nn::init::DEFAULT_KAIMING_NORMAL;
        let ws = vb.get_with_hints((out_channels, in_channels, kh, kw), "weight", init_ws)?;
        let bound = 1. / ((in_channels * kh * kw) as f64).sqrt();
        let init_bs = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let bs = vb.get_with_hints(out_channels, "bias", init_bs)?;
        Ok(Self::from_weights(ws, bs, padding))
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

impl Module for Conv {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (_, _, kh, kw) = self.weight.dims4()?;
        let xs = match self.padding {
            Padding::Valid => xs.clone(),
            Padding::Same => {
                let (top, bottom) = same_padding(kh);
                let (left, right) = same_padding(kw);
                xs.pad_with_zeros(D::Minus2, top, bottom)?
                    .pad_with_zeros(D::Minus1, left, right)?
            }
        };
        let (_, _, h, w) = xs.dims4()?;
        if h < kh || w < kw {
            bail!("conv input {h}x{w} is smaller than the {kh}x{kw} kernel")
        }
        let xs = xs.conv2d(&self.weight, 0, 1, 1, 1)?;
        let b = self.bias.dims1()?;
        xs.broadcast_add(&self.bias.reshape((1, b, 1, 1))?)
    }
}

/// `num_repetitions` convolutions, each followed by the activation.
///
/// With valid padding every repetition shrinks the spatial extents by
/// `kernel_size - 1`.
#[derive(Debug, Clone)]
pub struct ConvPass {
    convs: Vec<Conv>,
    activation: Option<Activation>,
    span: tracing::Span,
}

impl ConvPass {
    /// Variables of the `i`-th repetition live under `{name}_{i}`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        num_fmaps: usize,
        kernel_size: usize,
        num_repetitions: usize,
        activation: Option<Activation>,
        padding: Padding,
        name: &str,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut convs = Vec::with_capacity(num_repetitions);
        for i in 0..num_repetitions {
            let in_c = if i == 0 { in_channels } else { num_fmaps };
            let conv = Conv::new(
                in_c,
                num_fmaps,
                (kernel_size, kernel_size),
                padding,
                vb.pp(format!("{name}_{i}")),
            )?;
            convs.push(conv)
        }
        let span = tracing::span!(tracing::Level::TRACE, "conv-pass", pass = name);
        Ok(Self {
            convs,
            activation,
            span,
        })
    }

    pub fn num_repetitions(&self) -> usize {
        self.convs.len()
    }
}

impl Module for ConvPass {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let mut xs = xs.clone();
        for conv in self.convs.iter() {
            xs = xs.apply(conv)?;
            if let Some(act) = &self.activation {
                xs = xs.apply(act)?;
            }
        }
        Ok(xs)
    }
}

/// Max pooling with window and stride equal to `factors`.
///
/// Valid padding drops the trailing remainder, same padding keeps it by
/// replicating the border which gives the same maxima as padding with `-inf`.
pub fn downsample(xs: &Tensor, factors: (usize, usize), padding: Padding) -> Result<Tensor> {
    let (fy, fx) = factors;
    let xs = match padding {
        Padding::Valid => xs.clone(),
        Padding::Same => {
            let (_, _, h, w) = xs.dims4()?;
            let pad_h = h.div_ceil(fy) * fy - h;
            let pad_w = w.div_ceil(fx) * fx - w;
            xs.pad_with_same(D::Minus2, pad_h / 2, pad_h - pad_h / 2)?
                .pad_with_same(D::Minus1, pad_w / 2, pad_w - pad_w / 2)?
        }
    };
    let (_, _, h, w) = xs.dims4()?;
    if h < fy || w < fx {
        bail!("cannot downsample {h}x{w} by {fy}x{fx}")
    }
    xs.max_pool2d_with_stride((fy, fx), (fy, fx))
}

#[derive(Debug, Clone)]
enum UpsampleKind {
    /// Weight of shape `(in_channels, out_channels, fy, fx)`.
    TransConv { weight: Tensor, bias: Tensor },
    ResizeConv(Conv),
}

/// Increases the spatial resolution by `factors` and maps to `num_fmaps` channels.
#[derive(Debug, Clone)]
pub struct Upsample {
    kind: UpsampleKind,
    factors: (usize, usize),
    activation: Option<Activation>,
    span: tracing::Span,
}

impl Upsample {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        factors: (usize, usize),
        num_fmaps: usize,
        activation: Option<Activation>,
        padding: Padding,
        mode: Upsampling,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (fy, fx) = factors;
        let kind = match mode {
            Upsampling::TransConv => {
                let init_ws = candle_nn::init::DEFAULT_KAIMING_NORMAL;
                let weight =
                    vb.get_with_hints((in_channels, num_fmaps, fy, fx), "weight", init_ws)?;
                let bound = 1. / ((num_fmaps * fy * fx) as f64).sqrt();
                let init_bs = Init::Uniform {
                    lo: -bound,
                    up: bound,
                };
                let bias = vb.get_with_hints(num_fmaps, "bias", init_bs)?;
                UpsampleKind::TransConv { weight, bias }
            }
            Upsampling::ResizeConv => {
                UpsampleKind::ResizeConv(Conv::new(in_channels, num_fmaps, factors, padding, vb)?)
            }
        };
        let span = tracing::span!(tracing::Level::TRACE, "upsample", mode = mode.as_str());
        Ok(Self {
            kind,
            factors,
            activation,
            span,
        })
    }

    pub fn mode(&self) -> Upsampling {
        match self.kind {
            UpsampleKind::TransConv { .. } => Upsampling::TransConv,
            UpsampleKind::ResizeConv(_) => Upsampling::ResizeConv,
        }
    }
}

/// Transposed convolution whose kernel equals its stride: every input pixel is
/// mapped independently onto an `fy x fx` output block.
fn trans_conv(xs: &Tensor, weight: &Tensor, bias: &Tensor) -> Result<Tensor> {
    let (b_sz, c, h, w) = xs.dims4()?;
    let (_, o, fy, fx) = weight.dims4()?;
    let ys = if fy == fx {
        xs.conv_transpose2d(weight, 0, 0, fy, 1)?
    } else {
        xs.permute((0, 2, 3, 1))?
            .reshape((b_sz * h * w, c))?
            .matmul(&weight.reshape((c, o * fy * fx))?)?
            .reshape(vec![b_sz, h, w, o, fy, fx])?
            .permute([0, 3, 1, 4, 2, 5])?
            .reshape((b_sz, o, h * fy, w * fx))?
    };
    ys.broadcast_add(&bias.reshape((1, o, 1, 1))?)
}

impl Module for Upsample {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (fy, fx) = self.factors;
        let xs = match &self.kind {
            UpsampleKind::TransConv { weight, bias } => trans_conv(xs, weight, bias)?,
            UpsampleKind::ResizeConv(conv) => {
                let (_, _, h, w) = xs.dims4()?;
                xs.upsample_nearest2d(h * fy, w * fx)?.apply(conv)?
            }
        };
        match &self.activation {
            Some(act) => xs.apply(act),
            None => Ok(xs),
        }
    }
}

fn centre_narrow(xs: &Tensor, axis: usize, target: usize) -> Result<Tensor> {
    let current = xs.dim(axis)?;
    if target > current {
        bail!(
            "cannot crop axis {axis} of {:?} to {target}, the target is larger",
            xs.shape()
        )
    }
    if target == current {
        return Ok(xs.clone());
    }
    xs.narrow(axis, (current - target) / 2, target)
}

/// Crops the spatial axes of `xs`, every axis past batch and channels, to the
/// ones of `shape`. The crop is centred, offsets are rounded down.
pub fn crop_spatial(xs: &Tensor, shape: &[usize]) -> Result<Tensor> {
    let rank = xs.rank();
    if rank < 3 || shape.len() != rank {
        bail!("cannot crop {:?} to {shape:?}", xs.shape())
    }
    let mut xs = xs.clone();
    for (axis, &target) in shape.iter().enumerate().skip(2) {
        xs = centre_narrow(&xs, axis, target)?;
    }
    Ok(xs)
}

/// Centred crop of every axis of `xs`, batch and channels included.
pub fn crop(xs: &Tensor, shape: &[usize]) -> Result<Tensor> {
    if shape.len() != xs.rank() {
        bail!("cannot crop {:?} to {shape:?}", xs.shape())
    }
    let mut xs = xs.clone();
    for (axis, &target) in shape.iter().enumerate() {
        xs = centre_narrow(&xs, axis, target)?;
    }
    Ok(xs)
}
