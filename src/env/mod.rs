//! Environment contract shared by the emulator and every wrapper.
//!
//! Every layer speaks the same reset/step protocol: `reset` returns an
//! observation and an [`Info`], `step` returns a [`Step`] carrying the
//! observation, reward, `terminated`, `truncated` and info fields.

pub mod nes;
pub mod pipeline;
pub mod video;
pub mod wrappers;

#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

use anyhow::{Result, ensure};
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

pub use nes::{GameProfile, NesConfig, NesEnv};
pub use pipeline::{PipelineConfig, make_env, wrap_deepmind};

// =============================================================================
// Observation
// =============================================================================

/// Dense `u8` array with an explicit shape, laid out row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl Observation {
    pub fn new(shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        ensure!(
            expected == data.len(),
            "observation shape {shape:?} needs {expected} values, got {}",
            data.len()
        );
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0; len],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Element-wise maximum of two observations of the same shape.
    pub fn max(&self, other: &Observation) -> Result<Observation> {
        ensure!(
            self.shape == other.shape,
            "cannot max observations of shape {:?} and {:?}",
            self.shape,
            other.shape
        );
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(&a, &b)| a.max(b))
            .collect();
        Ok(Observation {
            shape: self.shape.clone(),
            data,
        })
    }

    /// Stacks observations of identical shape along a new leading axis.
    pub fn stack(frames: &[Observation]) -> Result<Observation> {
        ensure!(!frames.is_empty(), "cannot stack zero observations");
        let inner = frames[0].shape.clone();
        let mut data = Vec::with_capacity(frames.len() * frames[0].data.len());
        for frame in frames {
            ensure!(
                frame.shape == inner,
                "stacked observations must share a shape: {:?} vs {:?}",
                frame.shape,
                inner
            );
            data.extend_from_slice(&frame.data);
        }
        let mut shape = Vec::with_capacity(inner.len() + 1);
        shape.push(frames.len());
        shape.extend(inner);
        Ok(Observation { shape, data })
    }

    /// Converts to an `f32` tensor of the same shape. Pixel values are kept as
    /// raw intensities, matching how recorded `u8` shards are loaded.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let t = Tensor::from_slice(&self.data, self.shape.as_slice(), device)?;
        Ok(t.to_dtype(DType::F32)?)
    }
}

// =============================================================================
// Step contract
// =============================================================================

/// Statistics of a finished episode, attached by
/// [`wrappers::RecordEpisodeStatistics`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpisodeStats {
    pub total_return: f64,
    pub length: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Info {
    /// Remaining lives, if the game exposes a life counter.
    pub lives: Option<u32>,
    pub frame_number: u64,
    pub episode: Option<EpisodeStats>,
    /// Set by a human-rendered environment once its window has been closed.
    pub closed: bool,
}

#[derive(Debug, Clone)]
pub struct Step {
    pub obs: Observation,
    pub reward: f64,
    pub terminated: bool,
    pub truncated: bool,
    pub info: Info,
}

impl Step {
    pub fn done(&self) -> bool {
        self.terminated || self.truncated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderMode {
    #[default]
    None,
    /// Draw every step into a window.
    Human,
    /// Return the current RGB frame from `render`.
    RgbArray,
}

/// Meaning of a discrete action, using the Arcade Learning Environment names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionMeaning {
    Noop,
    Fire,
    Up,
    Right,
    Left,
    Down,
    UpRight,
    UpLeft,
    DownRight,
    DownLeft,
    UpFire,
    RightFire,
    LeftFire,
    DownFire,
    UpRightFire,
    UpLeftFire,
    DownRightFire,
    DownLeftFire,
}

impl ActionMeaning {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionMeaning::Noop => "NOOP",
            ActionMeaning::Fire => "FIRE",
            ActionMeaning::Up => "UP",
            ActionMeaning::Right => "RIGHT",
            ActionMeaning::Left => "LEFT",
            ActionMeaning::Down => "DOWN",
            ActionMeaning::UpRight => "UPRIGHT",
            ActionMeaning::UpLeft => "UPLEFT",
            ActionMeaning::DownRight => "DOWNRIGHT",
            ActionMeaning::DownLeft => "DOWNLEFT",
            ActionMeaning::UpFire => "UPFIRE",
            ActionMeaning::RightFire => "RIGHTFIRE",
            ActionMeaning::LeftFire => "LEFTFIRE",
            ActionMeaning::DownFire => "DOWNFIRE",
            ActionMeaning::UpRightFire => "UPRIGHTFIRE",
            ActionMeaning::UpLeftFire => "UPLEFTFIRE",
            ActionMeaning::DownRightFire => "DOWNRIGHTFIRE",
            ActionMeaning::DownLeftFire => "DOWNLEFTFIRE",
        }
    }

    pub fn has_fire(self) -> bool {
        self.as_str().contains("FIRE")
    }

    pub fn has_up(self) -> bool {
        self.as_str().starts_with("UP")
    }

    pub fn has_down(self) -> bool {
        self.as_str().starts_with("DOWN")
    }

    pub fn has_left(self) -> bool {
        self.as_str().contains("LEFT")
    }

    pub fn has_right(self) -> bool {
        self.as_str().contains("RIGHT")
    }
}

/// Position of `meaning` in an action set.
pub fn action_index(meanings: &[ActionMeaning], meaning: ActionMeaning) -> Option<usize> {
    meanings.iter().position(|&m| m == meaning)
}

// =============================================================================
// Env trait
// =============================================================================

pub trait Env {
    /// Identifier used for output paths such as video directories.
    fn id(&self) -> &str;

    fn reset(&mut self) -> Result<(Observation, Info)>;

    fn step(&mut self, action: usize) -> Result<Step>;

    fn action_meanings(&self) -> &[ActionMeaning];

    fn n_actions(&self) -> usize {
        self.action_meanings().len()
    }

    /// Current life counter of the underlying game (0 when unknown).
    fn lives(&self) -> u32;

    /// Human mode draws and returns `None`; RGB-array mode returns the frame.
    fn render(&mut self) -> Result<Option<Observation>>;
}

impl<E: Env + ?Sized> Env for Box<E> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn reset(&mut self) -> Result<(Observation, Info)> {
        (**self).reset()
    }

    fn step(&mut self, action: usize) -> Result<Step> {
        (**self).step(action)
    }

    fn action_meanings(&self) -> &[ActionMeaning] {
        (**self).action_meanings()
    }

    fn n_actions(&self) -> usize {
        (**self).n_actions()
    }

    fn lives(&self) -> u32 {
        (**self).lives()
    }

    fn render(&mut self) -> Result<Option<Observation>> {
        (**self).render()
    }
}
