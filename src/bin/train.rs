use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use tch::{nn, Tensor};

use st_forecast::config::Config;
use st_forecast::data::{build_windows, DataSource};
use st_forecast::executor::Executor;
use st_forecast::model::{ForecasterConfig, MlpForecaster};
use st_forecast::scaler::StandardScaler;

#[derive(Parser, Debug)]
#[command(
    name = "train",
    about = "Train and evaluate a spatio-temporal forecaster on a sensor readings matrix"
)]
struct Args {
    /// JSON config files, merged first-file-wins
    #[arg(long = "config", required = true, num_args = 1..)]
    config: Vec<PathBuf>,

    /// CSV readings matrix: one row per time step, one column per sensor
    #[arg(long)]
    data: PathBuf,

    /// Optional adjacency CSV (num_nodes x num_nodes)
    #[arg(long)]
    adjacency: Option<PathBuf>,

    /// Where to store the best-model checkpoint
    #[arg(long, default_value = "cache/model_cache/best_model.safetensors")]
    checkpoint: PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = Config::from_files(&args.config)?;
    let device = config.resolve_device()?;

    let series = load_matrix(&args.data)?;
    println!(
        "loaded {} time steps over {} sensors from {}",
        series.len(),
        series.first().map(|row| row.len()).unwrap_or(0),
        args.data.display()
    );

    let (x, y) = build_windows(&series, config.window, config.horizon)?;

    // Chronological 6/2/2 split.
    let samples = x.size()[0];
    let train_count = (samples as f64 * 0.6) as i64;
    let valid_count = (samples as f64 * 0.2) as i64;
    let test_count = samples - train_count - valid_count;
    if train_count == 0 || valid_count == 0 || test_count == 0 {
        bail!("{samples} samples are too few for a train/valid/test split");
    }

    let train_x = x.narrow(0, 0, train_count);
    let train_y = y.narrow(0, 0, train_count);
    let valid_x = x.narrow(0, train_count, valid_count);
    let valid_y = y.narrow(0, train_count, valid_count);
    let test_x = x.narrow(0, train_count + valid_count, test_count);
    let test_y = y.narrow(0, train_count + valid_count, test_count);

    // Fit on the training split only; feed the model normalized values.
    let scaler = StandardScaler::fit(&train_x);
    println!(
        "fitted scaler: mean {:.4}, std {:.4}",
        scaler.mean(),
        scaler.std()
    );

    let mut train_src = DataSource::new(
        scaler.transform(&train_x),
        scaler.transform(&train_y),
        config.batch_size,
        false,
    )?;
    let valid_src = DataSource::new(
        scaler.transform(&valid_x),
        scaler.transform(&valid_y),
        config.batch_size,
        false,
    )?;
    let test_src = DataSource::new(
        scaler.transform(&test_x),
        scaler.transform(&test_y),
        config.batch_size,
        true,
    )?;

    let adjacency = match &args.adjacency {
        Some(path) => {
            let matrix = load_matrix(path)?;
            let nodes = matrix.len() as i64;
            let flat: Vec<f32> = matrix.into_iter().flatten().collect();
            if flat.len() as i64 != nodes * nodes {
                bail!("adjacency at {} is not square", path.display());
            }
            Some(Tensor::from_slice(&flat).reshape(&[nodes, nodes]))
        }
        None => None,
    };

    let vs = nn::VarStore::new(device);
    let model_config = ForecasterConfig {
        window: config.window,
        horizon: config.horizon,
        input_dim: 1,
        hidden_dim: config.hidden_dim,
    };
    let model = MlpForecaster::new(&vs.root(), &model_config, adjacency);

    let mut executor = Executor::new(&config, vs, model, scaler)?;
    executor.train(&mut train_src, &valid_src)?;
    executor.save_model(&args.checkpoint)?;
    executor.evaluate(&test_src)?;

    Ok(())
}

fn load_matrix(path: &PathBuf) -> anyhow::Result<Vec<Vec<f32>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let mut row = Vec::with_capacity(record.len());
        for field in record.iter() {
            let value: f32 = field.trim().parse().with_context(|| {
                format!("bad value '{}' at line {} of {}", field, line + 1, path.display())
            })?;
            row.push(value);
        }
        rows.push(row);
    }
    Ok(rows)
}
