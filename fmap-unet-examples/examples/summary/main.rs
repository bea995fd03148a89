//! Shape summary of a U-Net with low resolution feature fusion.
//!
//! Loads a configuration, runs the shape inference, and optionally builds the
//! network and runs it on random inputs.
use anyhow::{bail, Result};
use candle::{DType, Tensor};
use clap::Parser;

use fmap_unet::{infer_output_shape, Config, FeatureShape, UNetWithFmap};
use fmap_unet_examples::parse_shape;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file, the built-in configuration is used when missing.
    #[arg(long)]
    config: Option<String>,

    /// Shape of the root input.
    #[arg(long, default_value = "1x268x268", value_parser = parse_shape)]
    input: FeatureShape,

    /// Shape of a low resolution input, coarsest first. Can be repeated.
    #[arg(long, value_parser = parse_shape)]
    low_res: Vec<FeatureShape>,

    /// Build the network and run it on random inputs.
    #[arg(long)]
    forward: bool,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// The file where to save the initial weights, in safetensors format.
    #[arg(long)]
    save: Option<String>,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    /// Log the per layer shapes while running the forward pass.
    #[arg(long)]
    verbose: bool,
}

fn main() -> Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let args = Args::parse();
    let (chrome_layer, _guard) = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        (Some(chrome_layer), Some(guard))
    } else {
        (None, None)
    };
    let fmt_layer = if args.verbose {
        Some(
            tracing_subscriber::fmt::layer()
                .with_filter(tracing_subscriber::filter::LevelFilter::DEBUG),
        )
    } else {
        None
    };
    tracing_subscriber::registry()
        .with(chrome_layer)
        .with(fmt_layer)
        .init();

    let config = match &args.config {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    };
    println!("{}", serde_json::to_string_pretty(&config)?);

    let trace = infer_output_shape(&config, &args.input, &args.low_res)?;
    if let Some(fused) = &trace.fused {
        println!("fused low resolution maps: {fused}");
    }
    for layer in trace.layers.iter() {
        let prefix = "    ".repeat(layer.layer);
        println!("{prefix}layer {}", layer.layer);
        println!("{prefix}f_in: {}", layer.f_in);
        println!("{prefix}f_left: {}", layer.f_left);
        if let Some(up) = &layer.g_out_upsampled {
            println!("{prefix}g_out_upsampled: {up}");
        }
        println!("{prefix}f_out: {}", layer.f_out);
    }
    println!("output: {}", trace.output);

    if !args.forward && args.save.is_none() {
        return Ok(());
    }
    if args.input.spatial.len() != 2 {
        bail!("only 2d networks can be run, got input {}", args.input)
    }

    let device = fmap_unet_examples::device(args.cpu)?;
    let varmap = candle_nn::VarMap::new();
    let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = UNetWithFmap::new(&config, vb)?;
    println!("built network with {} variables", varmap.all_vars().len());

    if args.forward {
        let randn = |s: &FeatureShape| Tensor::randn(0f32, 1f32, s.dims(), &device);
        let xs = randn(&args.input)?;
        let low_res = args
            .low_res
            .iter()
            .map(randn)
            .collect::<candle::Result<Vec<_>>>()?;
        let start = std::time::Instant::now();
        let ys = model.forward(&xs, &low_res)?;
        println!("forward: {:?} in {:?}", ys.shape(), start.elapsed());
        if ys.dims() != trace.output.dims() {
            bail!(
                "inferred {} but the network produced {:?}",
                trace.output,
                ys.shape()
            )
        }
    }
    if let Some(save) = &args.save {
        varmap.save(save)?;
        println!("saved weights to {save}");
    }
    Ok(())
}
