//! Anvil Metric CLI - evaluate and check the embedding losses from the command line

use std::path::PathBuf;
use clap::{Parser, Subcommand};
use rand::{rngs::StdRng, SeedableRng};
use tracing::{error, info, warn};

use anvil_metric::{
    gradcheck, init, version, BatchField, BatchLayout, EmbeddingBatch, LossConfig, LossFactory,
    LossPolicy, MetricError, MetricResult,
};

#[derive(Parser)]
#[command(name = "anvil-metric")]
#[command(about = "Triplet and quadruplet losses for place-recognition embeddings")]
#[command(version = version())]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute a loss and its gradient norms on a batch file
    Evaluate {
        /// Batch JSON with query, positives, negatives and optional other_neg
        #[arg(short, long)]
        batch: PathBuf,

        /// Loss configuration file; triplet with margin 0.3 when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Compare analytic gradients against finite differences on a random batch
    Gradcheck {
        /// Loss name: triplet or quadruplet
        #[arg(short, long, default_value = "triplet")]
        loss: String,

        #[arg(long, default_value = "4")]
        batch_size: usize,

        #[arg(long, default_value = "2")]
        num_pos: usize,

        #[arg(long, default_value = "5")]
        num_neg: usize,

        #[arg(long, default_value = "3")]
        dim: usize,

        #[arg(long, default_value = "0")]
        seed: u64,

        /// Anchor on the nearest positive
        #[arg(long)]
        use_min: bool,

        /// Keep only the worst negative per query
        #[arg(long)]
        lazy: bool,

        /// Average over queries with non-zero loss only
        #[arg(long)]
        ignore_zero_loss: bool,

        /// Finite-difference step
        #[arg(long, default_value = "1e-6")]
        step: f64,

        #[arg(long, default_value = "1e-4")]
        tolerance: f64,
    },

    /// Write a random batch file
    Sample {
        #[arg(short, long)]
        output: PathBuf,

        #[arg(long, default_value = "4")]
        batch_size: usize,

        #[arg(long, default_value = "2")]
        num_pos: usize,

        #[arg(long, default_value = "5")]
        num_neg: usize,

        #[arg(long, default_value = "3")]
        dim: usize,

        #[arg(long, default_value = "0")]
        seed: u64,

        /// Include an other_neg tensor for the quadruplet loss
        #[arg(long)]
        other_neg: bool,
    },

    /// Write a loss configuration template
    Config {
        #[arg(short, long, default_value = "loss.json")]
        output: PathBuf,

        /// Template: triplet or quadruplet
        #[arg(short, long, default_value = "triplet")]
        template: String,
    },
}

fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        if let Err(e) = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .try_init()
        {
            warn!("verbose logging unavailable, keeping the existing subscriber: {}", e);
        }
    } else {
        init();
    }

    if let Err(e) = run(cli.command) {
        error!("{}", e.user_message());
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(command: Commands) -> MetricResult<()> {
    match command {
        Commands::Evaluate { batch, config } => evaluate_batch(&batch, config.as_ref()),

        Commands::Gradcheck {
            loss,
            batch_size,
            num_pos,
            num_neg,
            dim,
            seed,
            use_min,
            lazy,
            ignore_zero_loss,
            step,
            tolerance,
        } => {
            let layout = BatchLayout {
                batch_size,
                num_pos,
                num_neg,
                dim,
                with_other_neg: loss.eq_ignore_ascii_case("quadruplet"),
            };
            let policy = LossPolicy::new()
                .with_use_min(use_min)
                .with_lazy(lazy)
                .with_ignore_zero_loss(ignore_zero_loss);
            check_gradients(&loss, layout, seed, policy, step, tolerance)
        }

        Commands::Sample {
            output,
            batch_size,
            num_pos,
            num_neg,
            dim,
            seed,
            other_neg,
        } => {
            let layout = BatchLayout {
                batch_size,
                num_pos,
                num_neg,
                dim,
                with_other_neg: other_neg,
            };
            let batch = EmbeddingBatch::<f64>::random(layout, &mut StdRng::seed_from_u64(seed));
            batch.save_json(&output)?;
            info!("Wrote {:?} batch to {:?}", layout, output);
            Ok(())
        }

        Commands::Config { output, template } => generate_config(&output, &template),
    }
}

fn evaluate_batch(batch_path: &PathBuf, config_path: Option<&PathBuf>) -> MetricResult<()> {
    let batch = EmbeddingBatch::load_json(batch_path)?;
    let config = match config_path {
        Some(path) => LossConfig::load_from_file(path)?,
        None => {
            warn!("No loss configuration given, using the default triplet loss");
            LossConfig::default()
        }
    };

    let loss = LossFactory::create::<f64>(&config)?;
    let output = loss.compute(&batch)?;
    println!("{}: {:.6}", loss.name(), output.loss);
    for field in BatchField::ALL {
        if let Some(grad) = output.gradients.field(field) {
            println!("  |d/d {}| = {:.6}", field.name(), grad.l2_norm());
        }
    }
    Ok(())
}

fn check_gradients(
    name: &str,
    layout: BatchLayout,
    seed: u64,
    policy: LossPolicy,
    step: f64,
    tolerance: f64,
) -> MetricResult<()> {
    let loss = LossFactory::create_by_name::<f64>(name, policy)?;
    let batch = EmbeddingBatch::<f64>::random(layout, &mut StdRng::seed_from_u64(seed));
    let report = gradcheck(loss.as_ref(), &batch, step, tolerance)?;

    for (field, err) in &report.per_field {
        println!("  {:<10} max abs error {:.3e}", field.name(), err);
    }
    if report.passed() {
        println!("{} gradcheck passed ({:?})", loss.name(), policy);
        Ok(())
    } else {
        Err(MetricError::InvalidState(format!(
            "{} gradcheck failed: max abs error {:.3e} exceeds {:.1e}",
            loss.name(),
            report.max_abs_error,
            tolerance
        )))
    }
}

fn generate_config(output: &PathBuf, template: &str) -> MetricResult<()> {
    let config = match template.to_lowercase().as_str() {
        "triplet" => LossConfig::default(),
        "quadruplet" => LossConfig::quadruplet(
            anvil_metric::config::DEFAULT_QUADRUPLET_M1,
            anvil_metric::config::DEFAULT_QUADRUPLET_M2,
            LossPolicy::default(),
        ),
        other => {
            return Err(MetricError::InvalidInput(format!("Unknown template: {}", other)));
        }
    };
    config.save_to_file(output)?;
    info!("Configuration written to {:?}", output);
    Ok(())
}
