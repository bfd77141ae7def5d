//! Recorded demonstration sequences and the batch loader used for cloning.
//!
//! A dataset root holds one directory per split, each containing `.npz`
//! shards with one sequence per shard: `obs` shaped `(T, C, H, W)` and
//! `actions` shaped `(T,)`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use candle_core::{DType, Device, Tensor};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
}

impl Split {
    pub fn as_str(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
        }
    }
}

/// One recorded sequence, kept on the CPU until batched.
#[derive(Debug, Clone)]
pub struct Sequence {
    pub obs: Tensor,
    pub actions: Tensor,
}

impl Sequence {
    pub fn new(obs: Tensor, actions: Tensor) -> Result<Self> {
        let t = obs.dim(0)?;
        ensure!(obs.rank() == 4, "obs must be (T, C, H, W), got {:?}", obs.dims());
        ensure!(
            actions.dims() == [t],
            "actions must be ({t},), got {:?}",
            actions.dims()
        );
        Ok(Self { obs, actions })
    }

    pub fn len(&self) -> usize {
        self.actions.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait SequenceSource {
    fn len(&self) -> usize;

    fn get(&self, index: usize) -> Result<Sequence>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// NPZ shards
// =============================================================================

pub struct NpzDataset {
    files: Vec<PathBuf>,
}

impl NpzDataset {
    /// Lists the shards under `<root>/<split>`. The split directory must exist.
    pub fn open(root: &Path, split: Split) -> Result<Self> {
        let dir = root.join(split.as_str());
        let entries = fs::read_dir(&dir)
            .with_context(|| format!("Failed to open dataset split {}", dir.display()))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "npz") {
                files.push(path);
            }
        }
        files.sort();
        tracing::info!(dir = %dir.display(), shards = files.len(), "opened dataset split");
        Ok(Self { files })
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

impl SequenceSource for NpzDataset {
    fn len(&self) -> usize {
        self.files.len()
    }

    fn get(&self, index: usize) -> Result<Sequence> {
        let path = self
            .files
            .get(index)
            .with_context(|| format!("shard index {index} out of range"))?;
        let mut arrays = Tensor::read_npz_by_name(path, &["obs", "actions"])
            .with_context(|| format!("Failed to read shard {}", path.display()))?;
        let actions = arrays.pop().context("missing actions array")?;
        let obs = arrays.pop().context("missing obs array")?;
        Sequence::new(obs, actions).with_context(|| format!("bad shard {}", path.display()))
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Default)]
pub struct InMemoryDataset {
    sequences: Vec<Sequence>,
}

impl InMemoryDataset {
    pub fn new(sequences: Vec<Sequence>) -> Self {
        Self { sequences }
    }
}

impl SequenceSource for InMemoryDataset {
    fn len(&self) -> usize {
        self.sequences.len()
    }

    fn get(&self, index: usize) -> Result<Sequence> {
        self.sequences
            .get(index)
            .cloned()
            .with_context(|| format!("sequence index {index} out of range"))
    }
}

// =============================================================================
// Loader
// =============================================================================

/// `obs` is `(B, T, C, H, W)` f32, `labels` is `(B, T)` u32.
pub struct Batch {
    pub obs: Tensor,
    pub labels: Tensor,
}

pub struct DataLoader<S> {
    source: S,
    batch_size: usize,
    shuffle: bool,
    rng: SmallRng,
    device: Device,
}

impl<S: SequenceSource> DataLoader<S> {
    pub fn new(
        source: S,
        batch_size: usize,
        shuffle: bool,
        seed: Option<u64>,
        device: &Device,
    ) -> Result<Self> {
        ensure!(batch_size > 0, "batch size must be positive");
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };
        Ok(Self {
            source,
            batch_size,
            shuffle,
            rng,
            device: device.clone(),
        })
    }

    /// Number of batches per epoch, counting a final partial batch.
    pub fn num_batches(&self) -> usize {
        self.source.len().div_ceil(self.batch_size)
    }

    /// Batches for one pass over the data, reshuffled on every call when
    /// shuffling is enabled.
    pub fn epoch(&mut self) -> Batches<'_, S> {
        let mut order: Vec<usize> = (0..self.source.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        Batches {
            source: &self.source,
            order,
            pos: 0,
            batch_size: self.batch_size,
            device: &self.device,
        }
    }
}

pub struct Batches<'a, S> {
    source: &'a S,
    order: Vec<usize>,
    pos: usize,
    batch_size: usize,
    device: &'a Device,
}

impl<S: SequenceSource> Batches<'_, S> {
    fn load(&self, indices: &[usize]) -> Result<Batch> {
        let mut obs = Vec::with_capacity(indices.len());
        let mut labels = Vec::with_capacity(indices.len());
        for &index in indices {
            let seq = self.source.get(index)?;
            obs.push(seq.obs.to_dtype(DType::F32)?);
            labels.push(seq.actions.to_dtype(DType::U32)?);
        }
        let obs = Tensor::stack(&obs, 0).context("sequences in a batch must share a shape")?;
        let labels = Tensor::stack(&labels, 0)?;
        Ok(Batch {
            obs: obs.to_device(self.device)?,
            labels: labels.to_device(self.device)?,
        })
    }
}

impl<S: SequenceSource> Iterator for Batches<'_, S> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.order.len() {
            return None;
        }
        let end = (self.pos + self.batch_size).min(self.order.len());
        let batch = self.load(&self.order[self.pos..end]);
        self.pos = end;
        Some(batch)
    }
}
