use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{Context, Result};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::cfc::CfcConfig;
use crate::model::{CellKind, ConvConfig};
use crate::train::{EvalStats, TrainStats};

pub const MODEL_FILE: &str = "model.safetensors";
pub const META_FILE: &str = "meta.json";
pub const RETURNS_FILE: &str = "returns.json";

/// Everything needed to rebuild the policy a checkpoint was trained with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainMeta {
    pub game: String,
    pub n_actions: usize,
    pub cell: CellKind,
    pub conv: ConvConfig,
    pub cfc: CfcConfig,
    pub epochs: usize,
    pub train: Option<TrainStats>,
    pub val: Option<EvalStats>,
}

pub fn save_checkpoint<P: AsRef<Path>>(varmap: &VarMap, meta: &TrainMeta, dir: P) -> Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create checkpoint dir {}", dir.display()))?;
    varmap.save(dir.join(MODEL_FILE))?;

    let file = File::create(dir.join(META_FILE))?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, meta)?;
    tracing::info!(dir = %dir.display(), "saved checkpoint");
    Ok(())
}

pub fn load_meta<P: AsRef<Path>>(dir: P) -> Result<TrainMeta> {
    let path = dir.as_ref().join(META_FILE);
    let file = File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
    let meta = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(meta)
}

/// Loads weights into an already-built model's `varmap`.
pub fn load_weights<P: AsRef<Path>>(varmap: &mut VarMap, dir: P) -> Result<()> {
    let path = dir.as_ref().join(MODEL_FILE);
    varmap
        .load(&path)
        .with_context(|| format!("Failed to load weights from {}", path.display()))?;
    Ok(())
}

pub fn save_returns<P: AsRef<Path>>(returns: &[f64], dir: P) -> Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    let file = File::create(dir.join(RETURNS_FILE))?;
    let writer = BufWriter::new(file);
    serde_json::to_writer(writer, returns)?;
    Ok(())
}

pub fn load_returns<P: AsRef<Path>>(dir: P) -> Result<Vec<f64>> {
    let file = File::open(dir.as_ref().join(RETURNS_FILE))?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}
