use std::io::Write;
use std::time::Instant;

use anyhow::Result;
use candle_core::{D, DType, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use serde::{Deserialize, Serialize};

use crate::cfc::RecurrentCore;
use crate::dataset::{Batch, DataLoader, SequenceSource};
use crate::model::ConvPolicy;

// =============================================================================
// Hyperparameters
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub lr: f64,
    pub batch_size: usize,
    pub epochs: usize,
    /// Stop each training or evaluation pass after this many batches.
    pub max_batches: Option<usize>,
    pub seed: Option<u64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            lr: 1e-4,
            batch_size: 32,
            epochs: 1,
            max_batches: None,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainStats {
    pub loss: f64,
    pub batches: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalStats {
    pub loss: f64,
    pub accuracy: f64,
    pub batches: usize,
}

/// Adam over every variable in `varmap`: AdamW without weight decay.
pub fn adam(varmap: &VarMap, lr: f64) -> Result<AdamW> {
    let params = ParamsAdamW {
        lr,
        weight_decay: 0.0,
        ..Default::default()
    };
    Ok(AdamW::new(varmap.all_vars(), params)?)
}

#[cfg(target_os = "macos")]
pub(crate) fn with_autorelease_pool<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    objc::rc::autoreleasepool(f)
}

#[cfg(not(target_os = "macos"))]
pub(crate) fn with_autorelease_pool<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    f()
}

/// Flattens `(B, T, A)` logits and `(B, T)` labels and returns the mean
/// cross-entropy with the flattened logits.
fn sequence_loss(logits: &Tensor, labels: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
    let (b, t, n_actions) = logits.dims3()?;
    let logits = logits.reshape((b * t, n_actions))?;
    let labels = labels.reshape(b * t)?;
    let loss = candle_nn::loss::cross_entropy(&logits, &labels)?;
    Ok((loss, logits, labels))
}

fn accuracy(logits: &Tensor, labels: &Tensor) -> Result<f64> {
    let hits = logits
        .argmax(D::Minus1)?
        .eq(&labels.to_dtype(DType::U32)?)?
        .to_dtype(DType::F32)?
        .mean_all()?
        .to_scalar::<f32>()?;
    Ok(hits as f64)
}

fn batch_budget(total: usize, max_batches: Option<usize>) -> usize {
    max_batches.map_or(total, |cap| cap.min(total))
}

// =============================================================================
// Training
// =============================================================================

/// One pass over `loader`. Each batch starts from a fresh hidden state, so
/// sequences are treated as independent even when they were recorded back to
/// back.
pub fn train_one_epoch<R, S>(
    model: &ConvPolicy<R>,
    optimizer: &mut impl Optimizer,
    loader: &mut DataLoader<S>,
    max_batches: Option<usize>,
) -> Result<TrainStats>
where
    R: RecurrentCore,
    S: SequenceSource,
{
    let total = batch_budget(loader.num_batches(), max_batches);
    let started = Instant::now();
    let mut running_loss = 0.0f64;
    let mut batches = 0usize;

    for batch in loader.epoch().take(total) {
        let Batch { obs, labels } = batch?;
        let loss = with_autorelease_pool(|| {
            let (logits, _) = model.forward_t(&obs, None, true)?;
            let (loss, _, _) = sequence_loss(&logits, &labels)?;
            optimizer.backward_step(&loss)?;
            Ok(loss.to_scalar::<f32>()? as f64)
        })?;
        running_loss += loss;
        batches += 1;
        eprint!(
            "\r  train [{batches:>4}/{total}] loss={avg:.4}",
            avg = running_loss / batches as f64
        );
        std::io::stderr().flush().ok();
    }
    if batches > 0 {
        eprintln!(" ({:.1}s)", started.elapsed().as_secs_f64());
    }

    let loss = if batches > 0 {
        running_loss / batches as f64
    } else {
        0.0
    };
    tracing::debug!(loss, batches, "finished training epoch");
    Ok(TrainStats { loss, batches })
}

// =============================================================================
// Evaluation
// =============================================================================

/// Loss and top-1 accuracy averaged over batches, with batch norm running on
/// its stored statistics. Parameters are left untouched.
pub fn evaluate<R, S>(
    model: &ConvPolicy<R>,
    loader: &mut DataLoader<S>,
    max_batches: Option<usize>,
) -> Result<EvalStats>
where
    R: RecurrentCore,
    S: SequenceSource,
{
    let total = batch_budget(loader.num_batches(), max_batches);
    let mut losses = Vec::with_capacity(total);
    let mut accs = Vec::with_capacity(total);

    for batch in loader.epoch().take(total) {
        let Batch { obs, labels } = batch?;
        let (logits, _) = model.forward_t(&obs, None, false)?;
        let (loss, flat_logits, flat_labels) = sequence_loss(&logits.detach(), &labels)?;
        losses.push(loss.to_scalar::<f32>()? as f64);
        accs.push(accuracy(&flat_logits, &flat_labels)?);
    }

    let mean = |xs: &[f64]| {
        if xs.is_empty() {
            0.0
        } else {
            xs.iter().sum::<f64>() / xs.len() as f64
        }
    };
    Ok(EvalStats {
        loss: mean(&losses),
        accuracy: mean(&accs),
        batches: losses.len(),
    })
}
