//! Observation and reward transforms layered over an [`Env`].
//!
//! Each wrapper owns the environment it wraps and forwards `action_meanings`,
//! `lives` and `render` unchanged.

use std::collections::VecDeque;
use std::time::Instant;

use anyhow::{Result, bail, ensure};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, Rgb, RgbImage};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::{ActionMeaning, EpisodeStats, Env, Info, Observation, Step};

macro_rules! forward_env {
    () => {
        fn id(&self) -> &str {
            self.env.id()
        }

        fn action_meanings(&self) -> &[ActionMeaning] {
            self.env.action_meanings()
        }

        fn lives(&self) -> u32 {
            self.env.lives()
        }

        fn render(&mut self) -> Result<Option<Observation>> {
            self.env.render()
        }
    };
}

// =============================================================================
// Episode Statistics
// =============================================================================

pub struct RecordEpisodeStatistics<E> {
    env: E,
    episode_return: f64,
    episode_length: u64,
    started: Instant,
}

impl<E: Env> RecordEpisodeStatistics<E> {
    pub fn new(env: E) -> Self {
        Self {
            env,
            episode_return: 0.0,
            episode_length: 0,
            started: Instant::now(),
        }
    }
}

impl<E: Env> Env for RecordEpisodeStatistics<E> {
    forward_env!();

    fn reset(&mut self) -> Result<(Observation, Info)> {
        self.episode_return = 0.0;
        self.episode_length = 0;
        self.started = Instant::now();
        self.env.reset()
    }

    fn step(&mut self, action: usize) -> Result<Step> {
        let mut step = self.env.step(action)?;
        self.episode_return += step.reward;
        self.episode_length += 1;
        if step.done() {
            step.info.episode = Some(EpisodeStats {
                total_return: self.episode_return,
                length: self.episode_length,
                elapsed: self.started.elapsed(),
            });
        }
        Ok(step)
    }
}

// =============================================================================
// Noop Reset
// =============================================================================

/// Takes a random number of `NOOP` steps after every reset.
pub struct NoopReset<E> {
    env: E,
    noop_max: usize,
    override_num_noops: Option<usize>,
    rng: SmallRng,
}

impl<E: Env> NoopReset<E> {
    pub fn new(env: E, noop_max: usize, seed: Option<u64>) -> Result<Self> {
        ensure!(noop_max > 0, "noop_max must be positive");
        ensure!(
            env.action_meanings().first() == Some(&ActionMeaning::Noop),
            "noop reset requires action 0 to be NOOP"
        );
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };
        Ok(Self {
            env,
            noop_max,
            override_num_noops: None,
            rng,
        })
    }

    pub fn with_fixed_noops(mut self, noops: usize) -> Self {
        self.override_num_noops = Some(noops);
        self
    }
}

impl<E: Env> Env for NoopReset<E> {
    forward_env!();

    fn reset(&mut self) -> Result<(Observation, Info)> {
        let (mut obs, mut info) = self.env.reset()?;
        let noops = match self.override_num_noops {
            Some(n) => n,
            None => self.rng.random_range(1..=self.noop_max),
        };
        for _ in 0..noops {
            let step = self.env.step(0)?;
            if step.done() {
                (obs, info) = self.env.reset()?;
            } else {
                obs = step.obs;
                info = step.info;
            }
        }
        Ok((obs, info))
    }

    fn step(&mut self, action: usize) -> Result<Step> {
        self.env.step(action)
    }
}

// =============================================================================
// Max and Skip
// =============================================================================

/// Repeats each action `skip` times and returns the pixel-wise max of the
/// last two frames with the summed reward.
pub struct MaxAndSkip<E> {
    env: E,
    skip: usize,
    obs_buffer: [Option<Observation>; 2],
}

impl<E: Env> MaxAndSkip<E> {
    pub fn new(env: E, skip: usize) -> Result<Self> {
        ensure!(skip > 0, "frame skip must be positive");
        Ok(Self {
            env,
            skip,
            obs_buffer: [None, None],
        })
    }
}

impl<E: Env> Env for MaxAndSkip<E> {
    forward_env!();

    fn reset(&mut self) -> Result<(Observation, Info)> {
        self.env.reset()
    }

    fn step(&mut self, action: usize) -> Result<Step> {
        let mut total_reward = 0.0;
        let mut last = None;
        for i in 0..self.skip {
            let step = self.env.step(action)?;
            if i + 2 == self.skip {
                self.obs_buffer[0] = Some(step.obs.clone());
            }
            if i + 1 == self.skip {
                self.obs_buffer[1] = Some(step.obs.clone());
            }
            total_reward += step.reward;
            let done = step.done();
            last = Some(step);
            if done {
                break;
            }
        }
        let Some(mut step) = last else {
            bail!("frame skip produced no steps");
        };

        // Early termination can leave the buffer holding frames from an
        // earlier call, as the reference wrapper does.
        if let [Some(a), Some(b)] = &self.obs_buffer {
            if a.shape() == b.shape() {
                step.obs = a.max(b)?;
            }
        }
        step.reward = total_reward;
        Ok(step)
    }
}

// =============================================================================
// Episodic Life
// =============================================================================

/// Reports a life loss as the end of an episode, while only resetting the
/// game once it is really over.
pub struct EpisodicLife<E> {
    env: E,
    lives: u32,
    was_real_done: bool,
}

impl<E: Env> EpisodicLife<E> {
    pub fn new(env: E) -> Self {
        Self {
            env,
            lives: 0,
            was_real_done: true,
        }
    }
}

impl<E: Env> Env for EpisodicLife<E> {
    forward_env!();

    fn reset(&mut self) -> Result<(Observation, Info)> {
        let out = if self.was_real_done {
            self.env.reset()?
        } else {
            let step = self.env.step(0)?;
            if step.done() {
                self.env.reset()?
            } else {
                (step.obs, step.info)
            }
        };
        self.lives = self.env.lives();
        Ok(out)
    }

    fn step(&mut self, action: usize) -> Result<Step> {
        let mut step = self.env.step(action)?;
        self.was_real_done = step.done();
        let lives = self.env.lives();
        if lives < self.lives && lives > 0 {
            step.terminated = true;
        }
        self.lives = lives;
        Ok(step)
    }
}

// =============================================================================
// Fire Reset
// =============================================================================

/// Presses `FIRE` after reset for games that wait for it.
pub struct FireReset<E> {
    env: E,
}

impl<E: Env> FireReset<E> {
    pub fn new(env: E) -> Result<Self> {
        let meanings = env.action_meanings();
        ensure!(
            meanings.get(1) == Some(&ActionMeaning::Fire),
            "fire reset requires action 1 to be FIRE"
        );
        ensure!(meanings.len() >= 3, "fire reset requires at least 3 actions");
        Ok(Self { env })
    }
}

impl<E: Env> Env for FireReset<E> {
    forward_env!();

    fn reset(&mut self) -> Result<(Observation, Info)> {
        self.env.reset()?;
        let step = self.env.step(1)?;
        if step.done() {
            self.env.reset()?;
        }
        let step = self.env.step(2)?;
        if step.done() {
            return self.env.reset();
        }
        Ok((step.obs, step.info))
    }

    fn step(&mut self, action: usize) -> Result<Step> {
        self.env.step(action)
    }
}

// =============================================================================
// Clip Reward
// =============================================================================

/// Replaces each reward by its sign.
pub struct ClipReward<E> {
    env: E,
}

impl<E: Env> ClipReward<E> {
    pub fn new(env: E) -> Self {
        Self { env }
    }
}

fn reward_sign(reward: f64) -> f64 {
    if reward > 0.0 {
        1.0
    } else if reward < 0.0 {
        -1.0
    } else {
        0.0
    }
}

impl<E: Env> Env for ClipReward<E> {
    forward_env!();

    fn reset(&mut self) -> Result<(Observation, Info)> {
        self.env.reset()
    }

    fn step(&mut self, action: usize) -> Result<Step> {
        let mut step = self.env.step(action)?;
        step.reward = reward_sign(step.reward);
        Ok(step)
    }
}

// =============================================================================
// Resize
// =============================================================================

pub(crate) fn resize_frame(obs: &Observation, dim: u32) -> Result<Observation> {
    let d = dim as usize;
    match *obs.shape() {
        [h, w, 3] => {
            let Some(img) = RgbImage::from_raw(w as u32, h as u32, obs.data().to_vec()) else {
                bail!("bad RGB frame of shape {:?}", obs.shape());
            };
            let out = imageops::resize(&img, dim, dim, FilterType::Triangle);
            Observation::new(vec![d, d, 3], out.into_raw())
        }
        [h, w] => {
            let Some(img) = GrayImage::from_raw(w as u32, h as u32, obs.data().to_vec()) else {
                bail!("bad grayscale frame of shape {:?}", obs.shape());
            };
            let out = imageops::resize(&img, dim, dim, FilterType::Triangle);
            Observation::new(vec![d, d], out.into_raw())
        }
        _ => bail!("cannot resize observation of shape {:?}", obs.shape()),
    }
}

/// Resizes frames to `dim x dim`.
pub struct ResizeObservation<E> {
    env: E,
    dim: u32,
}

impl<E: Env> ResizeObservation<E> {
    pub fn new(env: E, dim: u32) -> Result<Self> {
        ensure!(dim > 0, "resize dimension must be positive");
        Ok(Self { env, dim })
    }
}

impl<E: Env> Env for ResizeObservation<E> {
    forward_env!();

    fn reset(&mut self) -> Result<(Observation, Info)> {
        let (obs, info) = self.env.reset()?;
        Ok((resize_frame(&obs, self.dim)?, info))
    }

    fn step(&mut self, action: usize) -> Result<Step> {
        let mut step = self.env.step(action)?;
        step.obs = resize_frame(&step.obs, self.dim)?;
        Ok(step)
    }
}

// =============================================================================
// Grayscale
// =============================================================================

pub(crate) fn to_grayscale(obs: &Observation) -> Result<Observation> {
    let [h, w, 3] = *obs.shape() else {
        bail!("grayscale expects an RGB frame, got {:?}", obs.shape());
    };
    let Some(img) = RgbImage::from_raw(w as u32, h as u32, obs.data().to_vec()) else {
        bail!("bad RGB frame of shape {:?}", obs.shape());
    };
    // BT.601 luma, the weights recorded datasets were preprocessed with
    let gray = GrayImage::from_fn(w as u32, h as u32, |x, y| {
        let Rgb([r, g, b]) = *img.get_pixel(x, y);
        let luma = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
        Luma([luma.round().min(255.0) as u8])
    });
    Observation::new(vec![h, w], gray.into_raw())
}

pub struct GrayScaleObservation<E> {
    env: E,
}

impl<E: Env> GrayScaleObservation<E> {
    pub fn new(env: E) -> Self {
        Self { env }
    }
}

impl<E: Env> Env for GrayScaleObservation<E> {
    forward_env!();

    fn reset(&mut self) -> Result<(Observation, Info)> {
        let (obs, info) = self.env.reset()?;
        Ok((to_grayscale(&obs)?, info))
    }

    fn step(&mut self, action: usize) -> Result<Step> {
        let mut step = self.env.step(action)?;
        step.obs = to_grayscale(&step.obs)?;
        Ok(step)
    }
}

// =============================================================================
// Frame Stack
// =============================================================================

/// Stacks the last `k` frames along a new leading axis. Reset fills the stack
/// with copies of the first frame.
pub struct FrameStack<E> {
    env: E,
    k: usize,
    frames: VecDeque<Observation>,
}

impl<E: Env> FrameStack<E> {
    pub fn new(env: E, k: usize) -> Result<Self> {
        ensure!(k > 0, "frame stack size must be positive");
        Ok(Self {
            env,
            k,
            frames: VecDeque::with_capacity(k),
        })
    }

    fn stacked(&self) -> Result<Observation> {
        let frames: Vec<Observation> = self.frames.iter().cloned().collect();
        Observation::stack(&frames)
    }
}

impl<E: Env> Env for FrameStack<E> {
    forward_env!();

    fn reset(&mut self) -> Result<(Observation, Info)> {
        let (obs, info) = self.env.reset()?;
        self.frames.clear();
        for _ in 0..self.k {
            self.frames.push_back(obs.clone());
        }
        Ok((self.stacked()?, info))
    }

    fn step(&mut self, action: usize) -> Result<Step> {
        let mut step = self.env.step(action)?;
        if self.frames.len() == self.k {
            self.frames.pop_front();
        }
        self.frames.push_back(step.obs);
        step.obs = self.stacked()?;
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::testing::ScriptedEnv;

    #[test]
    fn statistics_attach_on_episode_end_only() {
        let mut env = RecordEpisodeStatistics::new(ScriptedEnv::new(vec![2, 2, 3], 3));
        env.reset().unwrap();
        assert!(env.step(0).unwrap().info.episode.is_none());
        assert!(env.step(0).unwrap().info.episode.is_none());
        let last = env.step(0).unwrap();
        let stats = last.info.episode.unwrap();
        assert_eq!(stats.length, 3);
        assert_eq!(stats.total_return, 3.0);
    }

    #[test]
    fn noop_reset_steps_noop_and_resets_on_done() {
        let mut env = NoopReset::new(ScriptedEnv::new(vec![2, 2, 3], 2), 30, Some(0))
            .unwrap()
            .with_fixed_noops(3);
        env.reset().unwrap();
        assert_eq!(env.env.actions, vec![0, 0, 0]);
        // noop 1, noop 2 ends the episode and resets, noop 3 runs in the new one
        assert_eq!(env.env.resets, 2);
        assert_eq!(env.env.episode_steps, 1);
    }

    #[test]
    fn noop_reset_requires_noop_first() {
        let mut inner = ScriptedEnv::new(vec![1], 5);
        inner.meanings.swap(0, 1);
        assert!(NoopReset::new(inner, 30, None).is_err());
    }

    #[test]
    fn noop_count_stays_within_bounds() {
        let mut env = NoopReset::new(ScriptedEnv::new(vec![1], 1000), 5, Some(7)).unwrap();
        for _ in 0..20 {
            let before = env.env.actions.len();
            env.reset().unwrap();
            let taken = env.env.actions.len() - before;
            assert!((1..=5).contains(&taken));
        }
    }

    #[test]
    fn max_and_skip_sums_reward_and_maxes_last_two_frames() {
        let mut env = MaxAndSkip::new(ScriptedEnv::new(vec![2, 2, 3], 100), 4).unwrap();
        env.reset().unwrap();
        let step = env.step(2).unwrap();
        assert_eq!(step.reward, 4.0);
        assert_eq!(env.env.actions, vec![2, 2, 2, 2]);
        // frames carry the step counter, so the max of frames 3 and 4 is 4
        assert!(step.obs.data().iter().all(|&v| v == 4));
    }

    #[test]
    fn max_and_skip_stops_on_done() {
        let mut env = MaxAndSkip::new(ScriptedEnv::new(vec![1], 2), 4).unwrap();
        env.reset().unwrap();
        let step = env.step(0).unwrap();
        assert!(step.terminated);
        assert_eq!(step.reward, 2.0);
        assert_eq!(env.env.actions.len(), 2);
    }

    #[test]
    fn episodic_life_ends_episode_on_life_loss_without_real_reset() {
        let inner = ScriptedEnv::new(vec![1], 100).with_lives(3, 2);
        let mut env = EpisodicLife::new(inner);
        env.reset().unwrap();
        assert_eq!(env.env.resets, 1);

        assert!(!env.step(0).unwrap().terminated);
        let lost = env.step(0).unwrap();
        assert!(lost.terminated);
        assert_eq!(lost.info.lives, Some(2));

        // not a real game over: reset takes a noop step instead
        env.reset().unwrap();
        assert_eq!(env.env.resets, 1);
        assert_eq!(env.env.actions.len(), 3);
    }

    #[test]
    fn episodic_life_really_resets_after_game_over() {
        let inner = ScriptedEnv::new(vec![1], 100).with_lives(1, 1);
        let mut env = EpisodicLife::new(inner);
        env.reset().unwrap();
        let over = env.step(0).unwrap();
        assert!(over.terminated);
        env.reset().unwrap();
        assert_eq!(env.env.resets, 2);
    }

    #[test]
    fn fire_reset_presses_fire_then_action_two() {
        let mut env = FireReset::new(ScriptedEnv::new(vec![1], 100)).unwrap();
        env.reset().unwrap();
        assert_eq!(env.env.actions, vec![1, 2]);
    }

    #[test]
    fn fire_reset_requires_fire_action() {
        let mut inner = ScriptedEnv::new(vec![1], 100);
        inner.meanings = vec![ActionMeaning::Noop, ActionMeaning::Right, ActionMeaning::Left];
        assert!(FireReset::new(inner).is_err());
    }

    #[test]
    fn clip_reward_keeps_sign() {
        assert_eq!(reward_sign(7.5), 1.0);
        assert_eq!(reward_sign(-0.1), -1.0);
        assert_eq!(reward_sign(0.0), 0.0);
        let mut inner = ScriptedEnv::new(vec![1], 100);
        inner.reward = 40.0;
        let mut env = ClipReward::new(inner);
        env.reset().unwrap();
        assert_eq!(env.step(0).unwrap().reward, 1.0);
    }

    #[test]
    fn resize_then_grayscale_then_stack() {
        let inner = ScriptedEnv::new(vec![10, 12, 3], 100);
        let env = ResizeObservation::new(inner, 6).unwrap();
        let env = GrayScaleObservation::new(env);
        let mut env = FrameStack::new(env, 4).unwrap();
        let (obs, _) = env.reset().unwrap();
        assert_eq!(obs.shape(), &[4, 6, 6]);
        let step = env.step(0).unwrap();
        assert_eq!(step.obs.shape(), &[4, 6, 6]);
        // newest frame is last
        let newest = &step.obs.data()[3 * 36..];
        let oldest = &step.obs.data()[..36];
        assert!(newest.iter().all(|&v| v == 1));
        assert!(oldest.iter().all(|&v| v == 0));
    }

    #[test]
    fn grayscale_uses_bt601_weights() {
        let rgb = Observation::new(
            vec![1, 4, 3],
            vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255],
        )
        .unwrap();
        let gray = to_grayscale(&rgb).unwrap();
        assert_eq!(gray.shape(), &[1, 4]);
        assert_eq!(gray.data(), &[76, 150, 29, 255]);
    }

    #[test]
    fn grayscale_rejects_non_rgb() {
        assert!(to_grayscale(&Observation::zeros(vec![4, 4])).is_err());
    }

    #[test]
    fn resize_handles_gray_frames() {
        let obs = Observation::new(vec![4, 4], vec![200; 16]).unwrap();
        let out = resize_frame(&obs, 2).unwrap();
        assert_eq!(out.shape(), &[2, 2]);
        assert!(out.data().iter().all(|&v| v == 200));
    }

    #[test]
    fn wrappers_forward_meanings_and_lives() {
        let inner = ScriptedEnv::new(vec![1], 100).with_lives(3, 50);
        let mut env = ClipReward::new(EpisodicLife::new(inner));
        env.reset().unwrap();
        assert_eq!(env.n_actions(), 4);
        assert_eq!(env.action_meanings()[1], ActionMeaning::Fire);
        assert_eq!(env.lives(), 3);
    }
}
