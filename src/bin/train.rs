//! Equilibrium propagation training binary.
//!
//! Trains an EquilibriumNet classifier on an IDX-format dataset (the MNIST
//! distribution format). Writes JSONL metrics for dashboard tailing and
//! saves periodic JSON checkpoints with resume support.

use clap::Parser;
use eqprop::checkpoint::{load_checkpoint, save_checkpoint};
use eqprop::data::{load_idx_images, load_idx_labels, one_hot, train_val_test_split, Dataset};
use eqprop::training::{evaluate, train_epoch};
use eqprop::{Config, EquilibriumNet};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(
    name = "eqprop-train",
    about = "Train an equilibrium propagation network on an IDX dataset"
)]
struct Args {
    /// Directory containing the IDX image and label files
    #[arg(long, default_value = "data/mnist")]
    data_dir: PathBuf,

    /// Image file name inside the data directory
    #[arg(long, default_value = "train-images-idx3-ubyte")]
    images: String,

    /// Label file name inside the data directory
    #[arg(long, default_value = "train-labels-idx1-ubyte")]
    labels: String,

    /// Fraction of the data used for training (the rest splits into
    /// validation and test)
    #[arg(long, default_value_t = 0.8)]
    train_fraction: f64,

    /// Hidden layer sizes
    #[arg(long, num_args = 1.., default_values_t = [500usize])]
    hidden: Vec<usize>,

    /// Mini-batch size
    #[arg(long, default_value_t = 20)]
    minibatch: usize,

    /// Number of training epochs
    #[arg(long, default_value_t = 25)]
    epochs: usize,

    /// Relaxation step size (epsilon)
    #[arg(long, default_value_t = 0.5)]
    epsilon: f64,

    /// Output clamping factor (beta); its sign is randomized per minibatch
    #[arg(long, default_value_t = 0.5)]
    beta: f64,

    /// Learning rates, one per connection (= hidden layers + 1)
    #[arg(long, num_args = 1.., default_values_t = [0.1, 0.05])]
    etas: Vec<f64>,

    /// Free (negative) phase relaxation steps
    #[arg(long, default_value_t = 20)]
    neg_steps: usize,

    /// Weakly clamped (positive) phase relaxation steps
    #[arg(long, default_value_t = 4)]
    pos_steps: usize,

    /// Output metrics file (JSONL)
    #[arg(long, default_value = "data/output/metrics.jsonl")]
    metrics_file: PathBuf,

    /// Checkpoint directory
    #[arg(long, default_value = "data/checkpoints")]
    checkpoint_dir: PathBuf,

    /// Save a checkpoint every N epochs
    #[arg(long, default_value_t = 5)]
    checkpoint_every: usize,

    /// Resume from a checkpoint file
    #[arg(long)]
    resume: Option<PathBuf>,

    /// RNG seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,
}

/// One JSONL metrics line per epoch.
#[derive(Debug, Serialize)]
struct MetricsRecord {
    epoch: usize,
    train_energy: f64,
    train_accuracy: f64,
    val_energy: f64,
    val_accuracy: f64,
    seconds: f64,
}

fn main() {
    let args = Args::parse();

    let images_path = args.data_dir.join(&args.images);
    let labels_path = args.data_dir.join(&args.labels);
    let inputs = load_idx_images(&images_path)
        .unwrap_or_else(|e| panic!("Failed to load {}: {e}", images_path.display()));
    let labels = load_idx_labels(&labels_path)
        .unwrap_or_else(|e| panic!("Failed to load {}: {e}", labels_path.display()));

    let num_classes = labels
        .iter()
        .max()
        .map(|&m| usize::from(m) + 1)
        .expect("Label file is empty");
    let input_dim = inputs.ncols();

    let targets = one_hot(&labels, num_classes).expect("Failed to one-hot encode labels");
    let dataset = Dataset::new(inputs, targets).expect("Image/label counts disagree");
    let (train, val, _test) =
        train_val_test_split(&dataset, args.train_fraction).expect("Invalid train fraction");

    let num_connections = args.hidden.len() + 1;
    assert_eq!(
        args.etas.len(),
        num_connections,
        "Need one learning rate per connection: {} hidden layers require {} etas",
        args.hidden.len(),
        num_connections,
    );

    // Initialize or resume network
    let (mut net, start_epoch) = if let Some(ref ckpt_path) = args.resume {
        eprintln!("Resuming from checkpoint: {}", ckpt_path.display());
        let (data, net) =
            load_checkpoint(ckpt_path, args.minibatch).expect("Failed to load checkpoint");
        eprintln!(
            "  Resumed at epoch {}, energy={:.4}, accuracy={:.4}",
            data.epoch, data.avg_energy, data.accuracy
        );
        (net, data.epoch)
    } else {
        let net = EquilibriumNet::new(input_dim, &args.hidden, num_classes, args.minibatch)
            .expect("Failed to create network");
        (net, 0)
    };

    let config = Config {
        epsilon: args.epsilon,
        beta: args.beta,
        etas: args.etas.clone(),
        free_steps: args.neg_steps,
        clamped_steps: args.pos_steps,
    };

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    // Open metrics file (append mode so a dashboard can tail it)
    if let Some(parent) = args.metrics_file.parent() {
        fs::create_dir_all(parent).expect("Failed to create metrics output directory");
    }
    fs::create_dir_all(&args.checkpoint_dir).expect("Failed to create checkpoint directory");
    let mut metrics_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.metrics_file)
        .expect("Failed to open metrics file");

    eprintln!("Equilibrium Propagation Training");
    eprintln!("  Network: {:?}", net.shape());
    eprintln!(
        "  Train/val/test: {}/{}/{} samples",
        train.len(),
        val.len(),
        dataset.len() - train.len() - val.len()
    );
    eprintln!("  Minibatch: {}, Epochs: {}", args.minibatch, args.epochs);
    eprintln!(
        "  Epsilon: {}, Beta: {}, Etas: {:?}",
        args.epsilon, args.beta, args.etas
    );
    eprintln!(
        "  Phase steps: {} free / {} clamped",
        args.neg_steps, args.pos_steps
    );
    eprintln!("  Metrics: {}", args.metrics_file.display());
    eprintln!();

    for epoch in (start_epoch + 1)..=(start_epoch + args.epochs) {
        let epoch_start = Instant::now();

        let train_metrics = train_epoch(&mut net, &train.inputs, &train.targets, &config, &mut rng)
            .expect("Training epoch failed");
        let val_metrics =
            evaluate(&net, &val.inputs, &val.targets, &config).expect("Validation failed");

        let seconds = epoch_start.elapsed().as_secs_f64();
        eprintln!(
            "epoch {:>3}  energy {:>10.4}  train acc {:.4}  val acc {:.4}  ({seconds:.1}s)",
            epoch, train_metrics.avg_energy, train_metrics.accuracy, val_metrics.accuracy
        );

        let record = MetricsRecord {
            epoch,
            train_energy: train_metrics.avg_energy,
            train_accuracy: train_metrics.accuracy,
            val_energy: val_metrics.avg_energy,
            val_accuracy: val_metrics.accuracy,
            seconds,
        };
        let line = serde_json::to_string(&record).expect("Failed to serialize metrics");
        writeln!(metrics_file, "{line}").expect("Failed to write metrics");

        if args.checkpoint_every > 0 && epoch % args.checkpoint_every == 0 {
            let path = args.checkpoint_dir.join(format!("epoch_{epoch:04}.json"));
            save_checkpoint(
                &net,
                &path,
                epoch,
                train_metrics.avg_energy,
                val_metrics.accuracy,
            )
            .expect("Failed to save checkpoint");
            eprintln!("  saved checkpoint {}", path.display());
        }
    }
}
