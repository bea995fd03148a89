/// Errors raised while parsing or validating a network configuration.
///
/// Shape errors found while running the network are reported as `candle::Error`
/// like every other tensor failure, configuration errors get wrapped into it with
/// `candle::Error::wrap` when they reach model code.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown activation function: {0}")]
    UnknownActivation(String),

    #[error("invalid value for upsampling method: {0}, expected trans_conv or resize_conv")]
    UnknownUpsampling(String),

    #[error("invalid value for padding: {0}, expected valid or same")]
    UnknownPadding(String),

    #[error("downsample factors for layer {layer} have {got} entries, expected {expected}")]
    FactorRank {
        layer: usize,
        expected: usize,
        got: usize,
    },

    #[error("{name} has {got} entries but the network has {expected} layers")]
    FactorCount {
        name: &'static str,
        expected: usize,
        got: usize,
    },

    #[error(
        "decoder width at layer {layer} is not an integer: {num} / {den} (check fmap_dec_factors)"
    )]
    FractionalWidth { layer: usize, num: usize, den: usize },

    #[error("fusion at layer {layer} requires at least one low resolution input")]
    MissingLowRes { layer: usize },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
