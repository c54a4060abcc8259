use std::error::Error;
use std::path::PathBuf;

use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};
use burn::config::Config;
use burn::module::Module;
use burn::optim::AdamConfig;
use burn::record::CompactRecorder;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use meta_lstm::learner::{Learner, LinearLearnerConfig};
use meta_lstm::task::LinearTaskSamplerConfig;
use meta_lstm::training::{train, MetaTrainingConfig};
use meta_lstm::{EpisodeConfig, MetaLearnerConfig};

type Backend = Autodiff<NdArray<f32>>;

/// Meta-train an LSTM optimizer on random linear regression tasks.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON training configuration. Defaults are used when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory receiving the configuration and the trained model.
    #[arg(long, default_value = "/tmp/meta-lstm")]
    artifact_dir: PathBuf,

    /// Input features of the regression tasks.
    #[arg(long, default_value_t = 4)]
    d_input: usize,

    /// Outputs of the regression tasks.
    #[arg(long, default_value_t = 1)]
    d_output: usize,

    /// Overrides the number of training episodes.
    #[arg(long)]
    episodes: Option<usize>,

    /// Seed of the task stream and of the initial learner parameters.
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn install_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let layer = fmt::layer().with_filter(filter);

    // Another subscriber may already be installed.
    Registry::default().with(layer).try_init().ok();
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    install_logger();

    let device = NdArrayDevice::Cpu;
    let learner_config = LinearLearnerConfig::new(args.d_input, args.d_output);
    let mut learner = learner_config.init::<Backend>();

    let mut config = match &args.config {
        Some(path) => MetaTrainingConfig::load(path)
            .map_err(|err| format!("Could not load {}: {err}", path.display()))?,
        None => MetaTrainingConfig::new(
            MetaLearnerConfig::new(learner.num_params()),
            AdamConfig::new(),
            EpisodeConfig::new(4),
        ),
    };
    if let Some(episodes) = args.episodes {
        config.num_episodes = episodes;
    }

    let mut sampler = LinearTaskSamplerConfig::new(args.d_input, args.d_output)
        .with_seed(args.seed)
        .init();
    let initial_params = learner_config.initial_params::<Backend>(args.seed, &device)?;

    std::fs::create_dir_all(&args.artifact_dir)?;
    config.save(args.artifact_dir.join("config.json"))?;

    let (model, summary) = train(&config, &mut learner, &mut sampler, initial_params, &device)?;

    if let Some(loss) = summary.validation_loss {
        println!("Validation loss: {loss:.4}");
    }

    model
        .save_file(args.artifact_dir.join("model"), &CompactRecorder::new())
        .map_err(|err| format!("Could not save the model: {err:?}"))?;
    log::info!("Artifacts written to {}", args.artifact_dir.display());

    Ok(())
}
