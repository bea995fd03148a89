use candle::{Module, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Named activations that can follow a convolution.
///
/// The names follow the `tf.nn` functions used in existing network
/// configurations, parameters use the same defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    Relu6,
    Elu,
    Selu,
    LeakyRelu,
    Sigmoid,
    Tanh,
    Softplus,
    Softsign,
    #[serde(alias = "swish")]
    Silu,
    Gelu,
}

const SELU_ALPHA: f64 = 1.673_263_242_354_377_3;
const SELU_SCALE: f64 = 1.050_700_987_355_480_5;
const LEAKY_RELU_SLOPE: f64 = 0.2;

impl Activation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Relu => "relu",
            Self::Relu6 => "relu6",
            Self::Elu => "elu",
            Self::Selu => "selu",
            Self::LeakyRelu => "leaky_relu",
            Self::Sigmoid => "sigmoid",
            Self::Tanh => "tanh",
            Self::Softplus => "softplus",
            Self::Softsign => "softsign",
            Self::Silu => "silu",
            Self::Gelu => "gelu",
        }
    }
}

impl std::fmt::Display for Activation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Activation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let act = match s {
            "relu" => Self::Relu,
            "relu6" => Self::Relu6,
            "elu" => Self::Elu,
            "selu" => Self::Selu,
            "leaky_relu" => Self::LeakyRelu,
            "sigmoid" => Self::Sigmoid,
            "tanh" => Self::Tanh,
            "softplus" => Self::Softplus,
            "softsign" => Self::Softsign,
            "silu" | "swish" => Self::Silu,
            "gelu" => Self::Gelu,
            _ => return Err(ConfigError::UnknownActivation(s.to_string())),
        };
        Ok(act)
    }
}

impl Module for Activation {
    fn forward(&self, xs: &Tensor) -> candle::Result<Tensor> {
        match self {
            Self::Relu => xs.relu(),
            Self::Relu6 => xs.clamp(0f32, 6f32),
            Self::Elu => xs.elu(1.0),
            Self::Selu => xs.elu(SELU_ALPHA)? * SELU_SCALE,
            Self::LeakyRelu => candle_nn::ops::leaky_relu(xs, LEAKY_RELU_SLOPE),
            Self::Sigmoid => candle_nn::ops::sigmoid(xs),
            Self::Tanh => xs.tanh(),
            // max(x, 0) + log(1 + exp(-|x|)), stable for large x
            Self::Softplus => xs.relu()? + (xs.abs()?.neg()?.exp()? + 1.0)?.log()?,
            Self::Softsign => xs.div(&(xs.abs()? + 1.0)?),
            Self::Silu => xs.silu(),
            // tf.nn.gelu defaults to the exact formulation.
            Self::Gelu => xs.gelu_erf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_names() {
        assert_eq!("relu".parse::<Activation>(), Ok(Activation::Relu));
        assert_eq!("swish".parse::<Activation>(), Ok(Activation::Silu));
        for act in [Activation::LeakyRelu, Activation::Relu6, Activation::Gelu] {
            assert_eq!(act.name().parse::<Activation>(), Ok(act));
        }
        assert_eq!(
            "relux".parse::<Activation>(),
            Err(ConfigError::UnknownActivation("relux".to_string()))
        );
    }

    #[test]
    fn serde_names() {
        let act: Activation = serde_json::from_str("\"leaky_relu\"").unwrap();
        assert_eq!(act, Activation::LeakyRelu);
        let act: Activation = serde_json::from_str("\"swish\"").unwrap();
        assert_eq!(act, Activation::Silu);
        let err = serde_json::from_str::<Activation>("\"crelu\"").unwrap_err();
        assert!(err.to_string().contains("crelu"), "{err}");
    }

    #[test]
    fn values() -> candle::Result<()> {
        use candle::test_utils::to_vec1_round;
        let xs = Tensor::new(&[-2f32, 1., 3., 100.], &candle::Device::Cpu)?;
        let ys = |act: Activation| to_vec1_round(&xs.apply(&act)?, 4);
        assert_eq!(ys(Activation::Relu6)?, [0.0, 1.0, 3.0, 6.0]);
        assert_eq!(ys(Activation::Softplus)?, [0.1269, 1.3133, 3.0486, 100.0]);
        assert_eq!(ys(Activation::Softsign)?, [-0.6667, 0.5, 0.75, 0.9901]);
        assert_eq!(ys(Activation::Selu)?, [-1.5202, 1.0507, 3.1521, 105.0701]);
        assert_eq!(ys(Activation::Gelu)?, [-0.0455, 0.8413, 2.996, 100.0]);
        Ok(())
    }
}
