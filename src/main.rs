use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Init, VarMap};
use clap::{Parser, Subcommand};
use metablocks::adaptation::{
    build_new_parameters, build_prototypes, create_optimizer, make_custom_getter,
    parameters_from_var_map, prototype_logits, VariableGetter, VariableSpec,
};
use metablocks::{
    runtime, Dataset, MetaConfig, SupervisedTaskDistribution, Task, TaskDistribution,
    TensorDataset, TensorMetaDataset, UniformSampler,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "metablocks")]
#[command(about = "Meta-Blocks - few-shot tasks and inner-loop adaptation", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one synthetic episode: sample tasks, adapt, evaluate
    Demo {
        /// Configuration file (JSON or YAML)
        #[arg(short, long, env = "METABLOCKS_CONFIG")]
        config: Option<PathBuf>,

        /// Examples generated per class
        #[arg(long, default_value_t = 20)]
        examples_per_class: usize,

        /// Dimension of the synthetic inputs
        #[arg(long, default_value_t = 8)]
        input_dim: usize,
    },

    /// Validate configuration file
    Config {
        /// Configuration file to validate
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Show system information
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json);

    match cli.command {
        Commands::Demo {
            config,
            examples_per_class,
            input_dim,
        } => {
            let config = match config {
                Some(path) => MetaConfig::from_file(&path)
                    .with_context(|| format!("Failed to load configuration {}", path.display()))?,
                None => MetaConfig::default(),
            };
            run_demo(&config, examples_per_class, input_dim)?;
        }

        Commands::Config { file } => {
            validate_config(file)?;
        }

        Commands::Info => {
            show_system_info();
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Linear softmax classifier whose parameters come from a getter
struct LinearClassifier {
    input_dim: usize,
    num_classes: usize,
    device: Device,
}

impl LinearClassifier {
    fn forward(&self, getter: &dyn VariableGetter, inputs: &Tensor) -> Result<Tensor> {
        let weight = getter.get_variable(
            "linear.weight",
            &VariableSpec::new(
                (self.input_dim, self.num_classes),
                Init::Randn {
                    mean: 0.0,
                    stdev: 0.1,
                },
                DType::F32,
                &self.device,
            ),
        )?;
        let bias = getter.get_variable(
            "linear.bias",
            &VariableSpec::new(self.num_classes, Init::Const(0.0), DType::F32, &self.device),
        )?;
        Ok(inputs.matmul(&weight)?.broadcast_add(&bias)?)
    }
}

fn accuracy(logits: &Tensor, labels: &Tensor) -> Result<f32> {
    let predictions = logits.argmax(D::Minus1)?;
    Ok(predictions
        .eq(labels)?
        .to_dtype(DType::F32)?
        .mean_all()?
        .to_scalar::<f32>()?)
}

/// Gaussian clusters, one per class, with a random center per class
fn synthetic_dataset(
    name: String,
    num_classes: usize,
    examples_per_class: usize,
    input_dim: usize,
    rng: &mut StdRng,
    device: &Device,
) -> Result<TensorDataset> {
    let centers = Normal::new(0.0f32, 3.0)?;
    let noise = Normal::new(0.0f32, 1.0)?;

    let mut data_tensors = Vec::with_capacity(num_classes);
    for _ in 0..num_classes {
        let center: Vec<f32> = (0..input_dim).map(|_| centers.sample(rng)).collect();
        let values: Vec<f32> = (0..examples_per_class)
            .flat_map(|_| center.iter().map(|c| c + noise.sample(rng)).collect::<Vec<_>>())
            .collect();
        data_tensors.push(Tensor::from_vec(
            values,
            (examples_per_class, input_dim),
            device,
        )?);
    }

    // Scale inputs down; stands in for per-example decoding/normalization.
    let dataset = TensorDataset::new(name, data_tensors)?.with_preprocessor(Arc::new(
        |x: &Tensor, _label: u32| -> metablocks::Result<Tensor> { Ok(x.affine(1.0 / 3.0, 0.0)?) },
    ));
    Ok(dataset)
}

fn run_demo(config: &MetaConfig, examples_per_class: usize, input_dim: usize) -> Result<()> {
    let task_config = &config.task;
    let adaptation = &config.adaptation;
    if examples_per_class <= task_config.num_query_shots {
        anyhow::bail!(
            "examples_per_class ({}) must exceed num_query_shots ({})",
            examples_per_class,
            task_config.num_query_shots
        );
    }

    if !adaptation.first_order {
        runtime::init();
    }

    let device = Device::Cpu;
    let mut rng = StdRng::seed_from_u64(task_config.seed);

    info!(
        "Generating {} synthetic datasets ({}-way, {} examples per class)",
        task_config.meta_batch_size, task_config.num_classes, examples_per_class
    );
    let mut dataset_batch: Vec<Arc<dyn Dataset>> = Vec::with_capacity(task_config.meta_batch_size);
    for i in 0..task_config.meta_batch_size {
        let dataset = synthetic_dataset(
            format!("synthetic{}", i),
            task_config.num_classes,
            examples_per_class,
            input_dim,
            &mut rng,
            &device,
        )?;
        dataset_batch.push(Arc::new(dataset));
    }
    let meta_dataset = TensorMetaDataset::new(task_config.num_classes, dataset_batch)?;

    let mut distribution = SupervisedTaskDistribution::new(
        Arc::new(meta_dataset),
        task_config.num_query_shots,
        task_config.num_support_shots,
        None,
        task_config.seed,
    )
    .with_parallel_iterations(task_config.parallel_iterations);
    distribution.build()?;
    distribution.initialize(Box::new(UniformSampler::new()));
    let feeds = distribution.sample_task_feed()?;

    let model = LinearClassifier {
        input_dim,
        num_classes: task_config.num_classes,
        device: device.clone(),
    };
    let var_map = VarMap::new();
    let optimizer = create_optimizer(adaptation);
    info!(
        "Inner loop: {} x '{}' (lr {}), first order: {}",
        adaptation.num_inner_steps,
        optimizer.name(),
        optimizer.learning_rate(),
        adaptation.first_order
    );

    for task in distribution.task_batch()? {
        let (query_inputs, query_labels) = task.query_tensors()?;
        let (support_inputs, support_labels) = task.support_tensors(&feeds)?;

        let before = accuracy(&model.forward(&var_map, &query_inputs)?, &query_labels)?;
        let params = parameters_from_var_map(&var_map)?;

        let mut adapted = params;
        for step in 0..adaptation.num_inner_steps {
            let getter = make_custom_getter(adapted.clone());
            let logits = model.forward(&getter.over(&var_map), &support_inputs)?;
            let loss = candle_nn::loss::cross_entropy(&logits, &support_labels)?;
            debug!(
                "{} step {}: support loss {:.4}",
                task.name(),
                step,
                loss.to_scalar::<f32>()?
            );
            adapted = build_new_parameters(
                &loss,
                &adapted,
                optimizer.as_ref(),
                adaptation.first_order,
            )?;
        }

        let getter = make_custom_getter(adapted);
        let after = accuracy(
            &model.forward(&getter.over(&var_map), &query_inputs)?,
            &query_labels,
        )?;

        let (prototypes, class_counts) =
            build_prototypes(&support_inputs, &support_labels, task_config.num_classes)?;
        let proto = accuracy(
            &prototype_logits(&query_inputs, &prototypes, &class_counts)?,
            &query_labels,
        )?;

        info!(
            "{}: {} labeled / {} unlabeled support, query accuracy {:.2} -> {:.2} (prototypes {:.2})",
            task.name(),
            task.support_size(&feeds)?,
            task.unlabeled_support_size()?,
            before,
            after,
            proto
        );
    }

    info!(
        "Episode done: {} labels requested ({} per task for support, {} for query)",
        distribution.num_requested_labels(),
        distribution.support_labels_per_task(),
        distribution.query_labels_per_task()
    );
    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    info!("Validating configuration file: {}", config_path.display());

    let config = MetaConfig::from_file(&config_path).context("Failed to load configuration file")?;

    info!("Configuration is valid");
    info!(
        "  - Tasks: {}-way, {} query / {} support shots, meta-batch {}",
        config.task.num_classes,
        config.task.num_query_shots,
        config.task.num_support_shots,
        config.task.meta_batch_size
    );
    info!(
        "  - Adaptation: lr {}, {} inner steps, first order: {}",
        config.adaptation.inner_learning_rate,
        config.adaptation.num_inner_steps,
        config.adaptation.first_order
    );

    Ok(())
}

fn show_system_info() {
    println!("Meta-Blocks - few-shot meta-learning building blocks");
    println!();
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Worker threads available: {}", num_cpus::get());
    println!(
        "Higher-order gradients: {}",
        if runtime::higher_order_enabled() {
            "enabled"
        } else {
            "disabled (run with a second-order config to enable)"
        }
    );
    println!();
    println!("Hardware support:");

    #[cfg(feature = "cuda")]
    println!("  CUDA: enabled");
    #[cfg(not(feature = "cuda"))]
    println!("  CUDA: not compiled");

    #[cfg(feature = "metal")]
    println!("  Metal: enabled");
    #[cfg(not(feature = "metal"))]
    println!("  Metal: not compiled");

    println!("  CPU: enabled");
    println!();
    println!("Usage:");
    println!("  metablocks demo -c meta.yaml     # Run a synthetic episode");
    println!("  metablocks config -f meta.yaml   # Validate configuration");
    println!("  metablocks info                  # Show this information");
}
