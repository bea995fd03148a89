use candle::{Device, Result};
use fmap_unet::FeatureShape;

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle::utils::cuda_is_available() {
        Device::new_cuda(0)
    } else if candle::utils::metal_is_available() {
        Device::new_metal(0)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            println!(
                "Running on CPU, to run on GPU(metal), build this example with `--features metal`"
            );
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            println!("Running on CPU, to run on GPU, build this example with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

/// Parses a feature shape written as `CxHxW` (or `CxDxHxW`), e.g. `1x268x268`.
pub fn parse_shape(s: &str) -> std::result::Result<FeatureShape, String> {
    let dims = s
        .split('x')
        .map(|d| d.trim().parse::<usize>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid shape {s}: {e}"))?;
    match dims.as_slice() {
        [c, spatial @ ..] if spatial.len() == 2 || spatial.len() == 3 => {
            Ok(FeatureShape::new(*c, spatial))
        }
        _ => Err(format!("invalid shape {s}, expected CxHxW or CxDxHxW")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes() {
        assert_eq!(
            parse_shape("1x268x268"),
            Ok(FeatureShape::new(1, &[268, 268]))
        );
        assert_eq!(
            parse_shape("4x20x76x76"),
            Ok(FeatureShape::new(4, &[20, 76, 76]))
        );
        assert!(parse_shape("268x268").is_err());
        assert!(parse_shape("1xax268").is_err());
    }
}
