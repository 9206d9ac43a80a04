//! Basic usage of ptq-mlp.
//!
//! Run with: `cargo run --example basic`

use candle_core::{Device, Tensor};
use ptq_mlp::{ModelConfig, QuantConfig, QuantModel};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== ptq-mlp Basic Example ===\n");

    let device = Device::Cpu;

    // Build the float model
    println!("1. Float model");
    let config = ModelConfig::default();
    let mut model = QuantModel::new(&config, &device)?;
    println!("   Input features: {}", config.in_features);
    println!("   Output features: {}", config.out_features);
    println!("   Parameters: {}", model.num_parameters());

    let input = Tensor::randn(0.0f32, 1.0, (4, 16), &device)?;
    let float_out = model.forward(&input)?;
    println!("   Output shape: {:?}", float_out.shape());

    // Attach observers and calibrate
    println!("\n2. Calibration");
    let quant_config = QuantConfig::fbgemm();
    println!(
        "   Weights: {:?} {:?}",
        quant_config.weight_dtype, quant_config.weight_granularity
    );
    println!("   Reduce range: {}", quant_config.reduce_range);
    model.prepare(quant_config)?;
    for _ in 0..32 {
        let batch = Tensor::randn(0.0f32, 1.0, (16, 16), &device)?;
        model.calibrate(&batch)?;
    }
    println!("   Batches observed: {}", model.num_calibration_batches());

    // Convert and compare
    println!("\n3. Quantized model");
    let quantized = model.convert()?;
    let params = quantized.input_params();
    println!(
        "   Input qparams: scale={:.5}, zero_point={}",
        params.scale, params.zero_point
    );

    let quant_out = quantized.forward(&input)?;
    let diff: Vec<f32> = float_out.sub(&quant_out)?.abs()?.flatten_all()?.to_vec1()?;
    let max_err = diff.iter().copied().fold(0.0f32, f32::max);
    let mean_err = diff.iter().sum::<f32>() / diff.len() as f32;
    println!("   Output shape: {:?}", quant_out.shape());
    println!("   Error: mean={mean_err:.5}, max={max_err:.5}");
    println!("   Compression ratio: {:.2}x", quantized.compression_ratio());

    println!("\nDone!");
    Ok(())
}
