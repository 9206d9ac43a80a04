//! CLI entry point for ptq-mlp.

use std::path::PathBuf;

use candle_core::{Device, Tensor};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ptq_mlp::{PtqConfig, PtqError, QuantModel, Result};

#[derive(Parser)]
#[command(name = "ptq-mlp")]
#[command(about = "Post-training quantization for a quant-stub linear model")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "ptq.yaml")]
        output: PathBuf,
        /// Quantization preset (default, fbgemm, qnnpack)
        #[arg(long, default_value = "default")]
        preset: String,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: PathBuf,
    },
    /// Calibrate, convert and compare float vs quantized outputs
    Run {
        /// Path to configuration file (defaults are used when omitted)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Load float weights from a safetensors file
        #[arg(long)]
        weights: Option<PathBuf>,
        /// Save float weights to a safetensors file
        #[arg(long)]
        save_weights: Option<PathBuf>,
        /// Rows per batch
        #[arg(long, default_value_t = 8)]
        batch_size: usize,
        /// Number of random calibration batches
        #[arg(long, default_value_t = 16)]
        calibration_batches: usize,
        /// Use CUDA device 0 when available
        #[arg(long)]
        cuda: bool,
    },
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok(a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}

fn run(
    config: Option<PathBuf>,
    weights: Option<PathBuf>,
    save_weights: Option<PathBuf>,
    batch_size: usize,
    calibration_batches: usize,
    cuda: bool,
) -> Result<()> {
    if batch_size == 0 || calibration_batches == 0 {
        return Err(PtqError::invalid_config(
            "batch-size and calibration-batches must be > 0",
        ));
    }

    let config = match config {
        Some(path) => {
            tracing::info!("Loading configuration: {}", path.display());
            PtqConfig::from_file(&path)?
        }
        None => PtqConfig::default(),
    };
    config.validate()?;

    let device = if cuda {
        Device::cuda_if_available(0)?
    } else {
        Device::Cpu
    };
    tracing::info!("Using device: {:?}", device);

    let mut model = match weights {
        Some(path) => QuantModel::load(&config.model, &path, &device)?,
        None => QuantModel::new(&config.model, &device)?,
    };
    if let Some(path) = save_weights {
        model.save(&path)?;
        println!("✓ Weights saved to: {}", path.display());
    }

    let in_features = config.model.in_features;
    let probe = Tensor::randn(0.0f32, 1.0, (batch_size, in_features), &device)?;
    let float_out = model.forward(&probe)?;
    println!("Float forward");
    println!("  Input shape:  {:?}", probe.dims());
    println!("  Output shape: {:?}", float_out.dims());

    model.prepare(config.quant.clone())?;
    for _ in 0..calibration_batches {
        let batch = Tensor::randn(0.0f32, 1.0, (batch_size, in_features), &device)?;
        model.calibrate(&batch)?;
    }
    let quantized = model.convert()?;

    let quant_out = quantized.forward(&probe)?;
    let input_params = quantized.input_params();
    let output_params = quantized.output_params();
    println!("Quantized forward");
    println!("  Calibration batches: {}", model.num_calibration_batches());
    println!(
        "  Input qparams:  scale={:.6} zero_point={}",
        input_params.scale, input_params.zero_point
    );
    println!(
        "  Output qparams: scale={:.6} zero_point={}",
        output_params.scale, output_params.zero_point
    );
    println!("  Output shape: {:?}", quant_out.dims());
    println!("  Max abs error: {:.6}", max_abs_diff(&float_out, &quant_out)?);
    println!("  Compression ratio: {:.2}x", quantized.compression_ratio());
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = PtqConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {}", output.display());
        }
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config.display());
            let config = PtqConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!(
                "  Model: {} -> {}x{} -> {}",
                config.model.in_features,
                config.model.seq_depth,
                config.model.hidden_features,
                config.model.out_features
            );
            println!(
                "  Weights: {:?} {:?}",
                config.quant.weight_dtype, config.quant.weight_granularity
            );
            println!("  Activations: {:?}", config.quant.activation_dtype);
        }
        Commands::Run {
            config,
            weights,
            save_weights,
            batch_size,
            calibration_batches,
            cuda,
        } => run(
            config,
            weights,
            save_weights,
            batch_size,
            calibration_batches,
            cuda,
        )?,
    }

    Ok(())
}
