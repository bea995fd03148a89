use anyhow::Result;
use candle::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{VarBuilder, VarMap};
use fmap_unet::ops::{crop, crop_spatial, downsample, Conv, ConvPass, Upsample};
use fmap_unet::{Activation, Padding, Upsampling};
use std::collections::HashMap;

fn ones_conv(kernel: (usize, usize), padding: Padding, dev: &Device) -> Result<Conv> {
    let w = Tensor::ones((1, 1, kernel.0, kernel.1), DType::F32, dev)?;
    let b = Tensor::zeros(1, DType::F32, dev)?;
    Ok(Conv::from_weights(w, b, padding))
}

fn ones_upsample(
    factors: (usize, usize),
    padding: Padding,
    mode: Upsampling,
    dev: &Device,
) -> Result<Upsample> {
    // (in, out, fy, fx) and (out, in, fy, fx) coincide for a single channel.
    let w_shape = (1, 1, factors.0, factors.1);
    let ts = HashMap::from([
        ("weight".to_string(), Tensor::ones(w_shape, DType::F32, dev)?),
        ("bias".to_string(), Tensor::zeros(1, DType::F32, dev)?),
    ]);
    let vb = VarBuilder::from_tensors(ts, DType::F32, dev);
    Ok(Upsample::new(1, factors, 1, None, padding, mode, vb)?)
}

#[test]
fn conv_padding() -> Result<()> {
    let dev = &Device::Cpu;
    let xs = Tensor::ones((1, 1, 4, 4), DType::F32, dev)?;

    let ys = ones_conv((3, 3), Padding::Valid, dev)?.forward(&xs)?;
    assert_eq!(ys.dims(), [1, 1, 2, 2]);
    assert_eq!(ys.i((0, 0))?.to_vec2::<f32>()?, [[9., 9.], [9., 9.]]);

    let ys = ones_conv((3, 3), Padding::Same, dev)?.forward(&xs)?;
    assert_eq!(
        ys.i((0, 0))?.to_vec2::<f32>()?,
        [
            [4., 6., 6., 4.],
            [6., 9., 9., 6.],
            [6., 9., 9., 6.],
            [4., 6., 6., 4.]
        ]
    );

    // Even kernels pad one more element after than before.
    let ys = ones_conv((2, 2), Padding::Same, dev)?.forward(&xs)?;
    assert_eq!(
        ys.i((0, 0))?.to_vec2::<f32>()?,
        [
            [4., 4., 4., 2.],
            [4., 4., 4., 2.],
            [4., 4., 4., 2.],
            [2., 2., 2., 1.]
        ]
    );

    let small = Tensor::ones((1, 1, 2, 5), DType::F32, dev)?;
    assert!(ones_conv((3, 3), Padding::Valid, dev)?
        .forward(&small)
        .is_err());
    Ok(())
}

#[test]
fn conv_pass_extents() -> Result<()> {
    let dev = &Device::Cpu;
    let xs = Tensor::randn(0f32, 1f32, (1, 2, 20, 17), dev)?;
    for kernel_size in [2, 3, 5] {
        for num_repetitions in [1, 2, 3] {
            for padding in [Padding::Valid, Padding::Same] {
                let varmap = VarMap::new();
                let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
                let pass = ConvPass::new(
                    2,
                    4,
                    kernel_size,
                    num_repetitions,
                    Some(Activation::Relu),
                    padding,
                    "pass",
                    vb,
                )?;
                assert_eq!(pass.num_repetitions(), num_repetitions);
                let ys = pass.forward(&xs)?;
                let shrink = match padding {
                    Padding::Valid => (kernel_size - 1) * num_repetitions,
                    Padding::Same => 0,
                };
                assert_eq!(ys.dims(), [1, 4, 20 - shrink, 17 - shrink]);
                // One variable prefix per repetition.
                let data = varmap.data().lock().unwrap();
                assert_eq!(data.len(), 2 * num_repetitions);
                for i in 0..num_repetitions {
                    assert!(data.contains_key(&format!("pass_{i}.weight")));
                }
            }
        }
    }
    Ok(())
}

#[test]
fn conv_pass_activation() -> Result<()> {
    let dev = &Device::Cpu;
    // A single negative valued convolution, relu clamps everything to zero.
    let ts = HashMap::from([
        (
            "neg_0.weight".to_string(),
            Tensor::ones((1, 1, 1, 1), DType::F32, dev)?.neg()?,
        ),
        ("neg_0.bias".to_string(), Tensor::zeros(1, DType::F32, dev)?),
    ]);
    let vb = VarBuilder::from_tensors(ts, DType::F32, dev);
    let pass = ConvPass::new(1, 1, 1, 1, Some(Activation::Relu), Padding::Valid, "neg", vb)?;
    let xs = Tensor::new(&[[[[1f32, 2.], [3., 4.]]]], dev)?;
    assert_eq!(pass.forward(&xs)?.i((0, 0))?.to_vec2::<f32>()?, [[0., 0.], [0., 0.]]);
    Ok(())
}

#[test]
fn max_pool() -> Result<()> {
    let dev = &Device::Cpu;
    let xs = Tensor::arange(0f32, 25f32, dev)?.reshape((1, 1, 5, 5))?;

    let ys = downsample(&xs, (2, 2), Padding::Valid)?;
    assert_eq!(ys.i((0, 0))?.to_vec2::<f32>()?, [[6., 8.], [16., 18.]]);

    let ys = downsample(&xs, (2, 2), Padding::Same)?;
    assert_eq!(
        ys.i((0, 0))?.to_vec2::<f32>()?,
        [[6., 8., 9.], [16., 18., 19.], [21., 23., 24.]]
    );

    let ys = downsample(&xs, (1, 3), Padding::Valid)?;
    assert_eq!(ys.dims(), [1, 1, 5, 1]);

    assert!(downsample(&xs, (6, 1), Padding::Valid).is_err());
    Ok(())
}

#[test]
fn upsample_trans_conv() -> Result<()> {
    let dev = &Device::Cpu;
    let xs = Tensor::new(&[[[[1f32, 2.], [3., 4.]]]], dev)?;

    let up = ones_upsample((2, 2), Padding::Valid, Upsampling::TransConv, dev)?;
    assert_eq!(up.mode(), Upsampling::TransConv);
    let ys = up.forward(&xs)?;
    assert_eq!(
        ys.i((0, 0))?.to_vec2::<f32>()?,
        [
            [1., 1., 2., 2.],
            [1., 1., 2., 2.],
            [3., 3., 4., 4.],
            [3., 3., 4., 4.]
        ]
    );

    // Anisotropic factors give the same blocks as a nearest neighbour resize.
    let up = ones_upsample((1, 3), Padding::Valid, Upsampling::TransConv, dev)?;
    let ys = up.forward(&xs)?;
    assert_eq!(ys.dims(), [1, 1, 2, 6]);
    assert_eq!(
        ys.i((0, 0))?.to_vec2::<f32>()?,
        xs.upsample_nearest2d(2, 6)?.i((0, 0))?.to_vec2::<f32>()?
    );
    Ok(())
}

#[test]
fn upsample_resize_conv() -> Result<()> {
    let dev = &Device::Cpu;
    let xs = Tensor::new(&[[[[1f32, 2.], [3., 4.]]]], dev)?;

    let up = ones_upsample((2, 2), Padding::Valid, Upsampling::ResizeConv, dev)?;
    assert_eq!(up.mode(), Upsampling::ResizeConv);
    let ys = up.forward(&xs)?;
    assert_eq!(
        ys.i((0, 0))?.to_vec2::<f32>()?,
        [[4., 6., 8.], [8., 10., 12.], [12., 14., 16.]]
    );

    let up = ones_upsample((2, 2), Padding::Same, Upsampling::ResizeConv, dev)?;
    assert_eq!(up.forward(&xs)?.dims(), [1, 1, 4, 4]);
    Ok(())
}

#[test]
fn upsample_channels() -> Result<()> {
    let dev = &Device::Cpu;
    let xs = Tensor::randn(0f32, 1f32, (1, 5, 7, 4), dev)?;
    for mode in [Upsampling::TransConv, Upsampling::ResizeConv] {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        let up = Upsample::new(5, (2, 3), 3, Some(Activation::Relu), Padding::Same, mode, vb)?;
        let ys = up.forward(&xs)?;
        assert_eq!(ys.dims(), [1, 3, 14, 12]);
        // relu output
        let min = ys.flatten_all()?.min(0)?.to_scalar::<f32>()?;
        assert!(min >= 0.);
    }
    Ok(())
}

#[test]
fn crop_spatial_centred() -> Result<()> {
    let dev = &Device::Cpu;
    let xs = Tensor::arange(0f32, 90f32, dev)?.reshape((1, 3, 5, 6))?;

    // Batch and channels are kept whatever the target says.
    let ys = crop_spatial(&xs, &[9, 9, 3, 4])?;
    assert_eq!(ys.dims(), [1, 3, 3, 4]);
    assert_eq!(
        ys.i((0, 0))?.to_vec2::<f32>()?,
        [[7., 8., 9., 10.], [13., 14., 15., 16.], [19., 20., 21., 22.]]
    );
    assert_eq!(
        ys.i((0, 2))?.to_vec2::<f32>()?,
        xs.i((0, 2, 1..4, 1..5))?.to_vec2::<f32>()?
    );

    let zs = crop_spatial(&ys, ys.dims())?;
    assert_eq!(zs.dims(), ys.dims());
    assert_eq!(
        zs.squeeze(0)?.to_vec3::<f32>()?,
        ys.squeeze(0)?.to_vec3::<f32>()?
    );

    assert!(crop_spatial(&xs, &[1, 3, 6, 6]).is_err());
    assert!(crop_spatial(&xs, &[1, 3, 5]).is_err());
    Ok(())
}

#[test]
fn crop_all_axes() -> Result<()> {
    let dev = &Device::Cpu;
    let xs = Tensor::arange(0f32, 48f32, dev)?.reshape((2, 4, 6))?;
    let ys = crop(&xs, &[1, 2, 2])?;
    assert_eq!(ys.to_vec3::<f32>()?, [[[8., 9.], [14., 15.]]]);
    assert!(crop(&xs, &[3, 2, 2]).is_err());
    Ok(())
}
