//! Conformer CLI.
//!
//! ```text
//! conformer describe --arch tiny              # stage layout + parameter count
//! conformer run --arch small --size 224       # forward a seeded random batch
//! conformer init --arch base -o base.safetensors
//! ```
//!
//! Every subcommand prints a one-line JSON summary to stdout on success.

use std::path::PathBuf;

use candle_core::{DType, Device};
use clap::{Args, Parser, Subcommand};
use conformer_rs::{
    Arch, Conformer, ConformerConfig,
    checkpoint::save_checkpoint,
    config::InitCfg,
    model::init::seeded_normal,
};

#[derive(Parser, Debug)]
#[command(
    name = "conformer",
    about = "Conformer dual-branch vision backbone",
    long_about = "Build, inspect and run Conformer backbones.\n\
                  A JSON summary line is printed to stdout."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the resolved stage layout and parameter count.
    Describe(ModelArgs),

    /// Run a forward pass on a random input and print output shapes.
    Run {
        #[command(flatten)]
        model: ModelArgs,

        #[arg(long, short = 'b', default_value_t = 1)]
        batch: usize,

        /// Input height and width in pixels.
        #[arg(long, default_value_t = 224)]
        size: usize,

        /// Random seed for the input. Omit for a random seed each run.
        #[arg(long, short = 's')]
        seed: Option<u64>,

        /// Use training-mode dropout, drop-path and BatchNorm.
        #[arg(long)]
        train: bool,
    },

    /// Initialize a fresh model and save its parameters.
    Init {
        #[command(flatten)]
        model: ModelArgs,

        /// Output path (.safetensors).
        #[arg(long, short = 'o')]
        output: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// JSON file with a full ConformerConfig. `--arch` overrides its arch.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Preset name: tiny, small or base (t / s / b).
    #[arg(long, short = 'a')]
    arch: Option<String>,

    /// Checkpoint to load (.safetensors, .pth).
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Key prefix to select inside the checkpoint, e.g. "backbone".
    #[arg(long, requires = "checkpoint")]
    prefix: Option<String>,

    /// Stage indices to return.
    #[arg(long, value_delimiter = ',')]
    out_indices: Option<Vec<usize>>,
}

impl ModelArgs {
    fn config(&self) -> anyhow::Result<ConformerConfig> {
        let mut cfg = match &self.config {
            Some(path) => ConformerConfig::from_json_file(path)?,
            None => ConformerConfig::default(),
        };
        if let Some(arch) = &self.arch {
            cfg.arch = Arch::preset(arch.as_str());
        }
        if let Some(indices) = &self.out_indices {
            cfg.out_indices = indices.clone();
        }
        // A missing file is reported by the model, which then initializes
        // from scratch.
        if let Some(checkpoint) = &self.checkpoint {
            cfg.init_cfg = Some(InitCfg::Pretrained {
                checkpoint: checkpoint.clone(),
                prefix: self.prefix.clone(),
            });
        }
        Ok(cfg)
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Describe(model) => {
            let cfg = model.config()?;
            let layout = cfg.layout()?;
            let (_model, varmap) = Conformer::build(&cfg, DType::F32, &Device::Cpu)
                .map_err(|e| anyhow::anyhow!("failed to build model: {e}"))?;
            let params: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();

            let summary = serde_json::json!({
                "layout": layout,
                "parameters": params,
            });
            println!("{summary}");
        }

        Command::Run {
            model,
            batch,
            size,
            seed,
            train,
        } => {
            let cfg = model.config()?;
            let device = Device::cuda_if_available(0)?;
            tracing::info!("Using device: {:?}", device);

            let (model, _varmap) = Conformer::build(&cfg, DType::F32, &device)
                .map_err(|e| anyhow::anyhow!("failed to build model: {e}"))?;

            let seed = seed.unwrap_or_else(rand::random);
            tracing::info!(seed, batch, size, "running forward pass");
            let x = seeded_normal((batch, 3, size, size), seed, &device)?;

            let start = std::time::Instant::now();
            let outputs = model
                .forward_t(&x, train)
                .map_err(|e| anyhow::anyhow!("forward pass failed: {e}"))?;
            let elapsed_ms = start.elapsed().as_secs_f64() * 1e3;
            tracing::info!("forward pass took {elapsed_ms:.1} ms");

            let outputs: Vec<_> = outputs
                .iter()
                .map(|o| {
                    serde_json::json!({
                        "index": o.index,
                        "conv": o.conv.dims(),
                        "token": o.token.dims(),
                    })
                })
                .collect();
            let summary = serde_json::json!({
                "seed": seed,
                "outputs": outputs,
                "elapsed_ms": elapsed_ms,
            });
            println!("{summary}");
        }

        Command::Init { model, output } => {
            if let Some(parent) = output.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            let cfg = model.config()?;
            let (_model, varmap) = Conformer::build(&cfg, DType::F32, &Device::Cpu)
                .map_err(|e| anyhow::anyhow!("failed to build model: {e}"))?;
            save_checkpoint(&varmap, &output)
                .map_err(|e| anyhow::anyhow!("failed to save checkpoint: {e}"))?;

            let summary = serde_json::json!({
                "path": output,
                "tensors": varmap.all_vars().len(),
            });
            println!("{summary}");
        }
    }

    Ok(())
}
