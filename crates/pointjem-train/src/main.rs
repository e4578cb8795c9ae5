//! CLI entry point for pointjem-train.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pointjem_train::config::TrainConfig;
use pointjem_train::data::SyntheticShapes;
use pointjem_train::logging::{init_console_logging, init_logging};
use pointjem_train::train::Trainer;

fn resolve_preset(name: &str) -> Option<TrainConfig> {
    match name {
        "modelnet40" => Some(TrainConfig::modelnet40()),
        "tiny-cpu" | "tiny_cpu" => Some(TrainConfig::tiny_cpu()),
        _ => None,
    }
}

fn resolve_device(device: &str) -> Result<candle_core::Device, String> {
    match device {
        "cpu" => Ok(candle_core::Device::Cpu),
        other => Err(format!("Unknown device: {}. Only 'cpu' is built in.", other)),
    }
}

#[derive(Parser)]
#[command(
    name = "pointjem-train",
    about = "Self-supervised point-cloud pretraining with the PointJEM loss"
)]
struct Cli {
    /// Emit JSON logs instead of pretty console output
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Clone, Default)]
struct ConfigArgs {
    /// Preset name: modelnet40 or tiny-cpu
    #[arg(long, default_value = "modelnet40")]
    preset: String,

    /// JSON config file; takes precedence over --preset
    #[arg(long)]
    config_file: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    base_lr: Option<f64>,

    #[arg(long)]
    mlp: Option<String>,

    #[arg(long)]
    bin_size: Option<usize>,

    /// Softmax temperature
    #[arg(long)]
    t: Option<f64>,

    #[arg(long)]
    dia_coeff: Option<f64>,

    #[arg(long)]
    off_coeff: Option<f64>,

    #[arg(long)]
    ti_coeff: Option<f64>,

    /// Minimum seconds between stats.txt lines
    #[arg(long)]
    log_freq_time: Option<u64>,

    #[arg(long)]
    seed: Option<u64>,
}

impl ConfigArgs {
    fn resolve(&self) -> Result<TrainConfig, Box<dyn std::error::Error>> {
        let mut cfg = match &self.config_file {
            Some(path) => TrainConfig::from_json_file(path)?,
            None => resolve_preset(&self.preset)
                .ok_or_else(|| format!("Unknown preset: {}", self.preset))?,
        };

        if let Some(v) = self.epochs {
            cfg.epochs = v;
        }
        if let Some(v) = self.batch_size {
            cfg.batch_size = v;
        }
        if let Some(v) = self.base_lr {
            cfg.base_lr = v;
        }
        if let Some(v) = &self.mlp {
            cfg.mlp = v.clone();
        }
        if let Some(v) = self.bin_size {
            cfg.loss.bin_size = v;
        }
        if let Some(v) = self.t {
            cfg.loss.temperature = v;
        }
        if let Some(v) = self.dia_coeff {
            cfg.loss.dia_coeff = v;
        }
        if let Some(v) = self.off_coeff {
            cfg.loss.off_coeff = v;
        }
        if let Some(v) = self.ti_coeff {
            cfg.loss.ti_coeff = v;
        }
        if let Some(v) = self.log_freq_time {
            cfg.log_freq_secs = v;
        }
        if let Some(v) = self.seed {
            cfg.seed = v;
        }

        cfg.validate().map_err(|errors| {
            let mut msg = String::from("invalid configuration:");
            for e in errors {
                msg.push_str("\n  - ");
                msg.push_str(&e);
            }
            msg
        })?;
        Ok(cfg)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Pretrain a backbone on synthetic shapes
    Train {
        #[command(flatten)]
        config: ConfigArgs,

        /// Experiment directory for stats.txt, checkpoints and the backbone export
        #[arg(long, default_value = "./exp")]
        exp_dir: PathBuf,

        /// Number of synthetic clouds per epoch
        #[arg(long, default_value = "1024")]
        n_samples: usize,

        #[arg(long, default_value = "cpu")]
        device: String,
    },

    /// Print the resolved configuration as JSON
    ShowConfig {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    if cli.json_logs {
        init_logging();
    } else {
        init_console_logging();
    }

    match cli.command {
        Commands::Train {
            config,
            exp_dir,
            n_samples,
            device,
        } => {
            let cfg = config.resolve()?;
            let device = resolve_device(&device)?;
            let dataset = SyntheticShapes::new(n_samples, cfg.num_points, cfg.seed);

            std::fs::create_dir_all(&exp_dir)?;
            {
                let mut stats =
                    pointjem_train::logging::StatsWriter::open(&exp_dir, cfg.log_freq_secs)?;
                let argv: Vec<String> = std::env::args().collect();
                stats.write_header(&argv.join(" "))?;
            }

            let mut trainer = Trainer::new(cfg, device)?;
            let loss = trainer.train_loop(&dataset, Some(&exp_dir))?;
            tracing::info!(loss, exp_dir = %exp_dir.display(), "done");
        }
        Commands::ShowConfig { config } => {
            let cfg = config.resolve()?;
            println!("{}", serde_json::to_string_pretty(&cfg)?);
        }
    }

    Ok(())
}
