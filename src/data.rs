use rayon::prelude::*;
use tch::{Kind, Tensor};

use crate::error::{Error, Result};

/// In-memory batch source for one data split.
///
/// Owns `(input, target)` tensors shaped `[samples, window, nodes, dim]` and
/// `[samples, horizon, nodes, dim]`. Shuffling permutes sample order without
/// touching the underlying storage layout, and iteration is restartable.
/// When `pad_last_batch` is set the final partial batch is filled by
/// repeating the last sample; `seq_len` keeps the true pre-padding count so
/// evaluation can truncate the padding back off.
pub struct DataSource {
    x: Tensor,
    y: Tensor,
    batch_size: i64,
    seq_len: i64,
}

impl DataSource {
    pub fn new(x: Tensor, y: Tensor, batch_size: i64, pad_last_batch: bool) -> Result<Self> {
        if batch_size <= 0 {
            return Err(Error::Configuration(format!(
                "batch_size must be positive, got {batch_size}"
            )));
        }
        if x.size().len() != 4 || y.size().len() != 4 {
            return Err(Error::Configuration(format!(
                "expected rank-4 input and target tensors, got {:?} and {:?}",
                x.size(),
                y.size()
            )));
        }
        let samples = x.size()[0];
        if samples != y.size()[0] {
            return Err(Error::Configuration(format!(
                "input has {} samples but target has {}",
                samples,
                y.size()[0]
            )));
        }
        if samples == 0 {
            return Err(Error::DataExhausted("split contains no samples".into()));
        }

        let (x, y) = if pad_last_batch && samples % batch_size != 0 {
            let missing = batch_size - samples % batch_size;
            let last_x = x.narrow(0, samples - 1, 1).repeat(&[missing, 1, 1, 1]);
            let last_y = y.narrow(0, samples - 1, 1).repeat(&[missing, 1, 1, 1]);
            (Tensor::cat(&[x, last_x], 0), Tensor::cat(&[y, last_y], 0))
        } else {
            (x, y)
        };

        Ok(Self {
            x,
            y,
            batch_size,
            seq_len: samples,
        })
    }

    /// Draw a fresh iteration order. Only reorders indices; nothing is
    /// reloaded from storage.
    pub fn shuffle(&mut self) {
        let count = self.x.size()[0];
        let perm = Tensor::randperm(count, (Kind::Int64, self.x.device()));
        self.x = self.x.index_select(0, &perm);
        self.y = self.y.index_select(0, &perm);
    }

    /// Iterate `(input, target)` batches in current order.
    pub fn iter_batches(&self) -> impl Iterator<Item = (Tensor, Tensor)> + '_ {
        let count = self.x.size()[0];
        let batch_size = self.batch_size;
        (0..count)
            .step_by(batch_size as usize)
            .map(move |start| {
                let len = batch_size.min(count - start);
                (self.x.narrow(0, start, len), self.y.narrow(0, start, len))
            })
    }

    /// True sample count, excluding any final-batch padding.
    pub fn seq_len(&self) -> i64 {
        self.seq_len
    }

    pub fn num_batches(&self) -> i64 {
        let count = self.x.size()[0];
        (count + self.batch_size - 1) / self.batch_size
    }

    pub fn num_nodes(&self) -> i64 {
        self.x.size()[2]
    }

    /// Sample count including padding.
    pub fn len(&self) -> i64 {
        self.x.size()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Slice a readings matrix (rows = time steps, columns = nodes) into
/// `(input_window, target_window)` training pairs.
///
/// Returns tensors shaped `[samples, window, nodes, 1]` and
/// `[samples, horizon, nodes, 1]`. Window extraction is CPU-bound and
/// embarrassingly parallel, so samples are built with rayon.
pub fn build_windows(series: &[Vec<f32>], window: i64, horizon: i64) -> Result<(Tensor, Tensor)> {
    if window <= 0 || horizon <= 0 {
        return Err(Error::Configuration(format!(
            "window and horizon must be positive, got {window} and {horizon}"
        )));
    }
    let steps = series.len() as i64;
    let num_nodes = series.first().map(|row| row.len()).unwrap_or(0);
    if num_nodes == 0 {
        return Err(Error::DataExhausted("readings matrix is empty".into()));
    }
    if let Some(bad) = series.iter().position(|row| row.len() != num_nodes) {
        return Err(Error::Configuration(format!(
            "row {bad} has {} readings, expected {num_nodes}",
            series[bad].len()
        )));
    }
    let samples = steps - window - horizon + 1;
    if samples <= 0 {
        return Err(Error::DataExhausted(format!(
            "{steps} time steps cannot fill a {window}-step window plus {horizon}-step horizon"
        )));
    }

    let pairs: Vec<(Vec<f32>, Vec<f32>)> = (0..samples as usize)
        .into_par_iter()
        .map(|start| {
            let mut input = Vec::with_capacity(window as usize * num_nodes);
            for t in start..start + window as usize {
                input.extend_from_slice(&series[t]);
            }
            let mut target = Vec::with_capacity(horizon as usize * num_nodes);
            for t in start + window as usize..start + (window + horizon) as usize {
                target.extend_from_slice(&series[t]);
            }
            (input, target)
        })
        .collect();

    let mut input_flat = Vec::with_capacity(pairs.len() * window as usize * num_nodes);
    let mut target_flat = Vec::with_capacity(pairs.len() * horizon as usize * num_nodes);
    for (input, target) in pairs {
        input_flat.extend_from_slice(&input);
        target_flat.extend_from_slice(&target);
    }

    let x = Tensor::from_slice(&input_flat).reshape(&[samples, window, num_nodes as i64, 1]);
    let y = Tensor::from_slice(&target_flat).reshape(&[samples, horizon, num_nodes as i64, 1]);
    Ok((x, y))
}
