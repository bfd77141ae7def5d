use std::path::{Path, PathBuf};

use anyhow::Result;

use super::nes::{GameProfile, NesConfig, NesEnv};
use super::video::RecordVideo;
use super::wrappers::{
    ClipReward, EpisodicLife, FireReset, FrameStack, GrayScaleObservation, MaxAndSkip, NoopReset,
    RecordEpisodeStatistics, ResizeObservation,
};
use super::{ActionMeaning, Env, RenderMode};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Side length of the square frames fed to the model.
    pub dim: u32,
    pub capture_video: bool,
    /// Render mode of the base env when not capturing video.
    pub render_mode: RenderMode,
    pub frame_stack: bool,
    pub stack_size: usize,
    /// Off by default: the emulator env already repeats actions.
    pub max_and_skip: bool,
    pub skip: usize,
    pub noop_max: usize,
    pub clip_rewards: bool,
    pub video_dir: PathBuf,
    pub seed: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dim: 84,
            capture_video: true,
            render_mode: RenderMode::None,
            frame_stack: true,
            stack_size: 4,
            max_and_skip: false,
            skip: 4,
            noop_max: 30,
            clip_rewards: false,
            video_dir: PathBuf::from("videos"),
            seed: None,
        }
    }
}

/// Wraps `env` with the DeepMind-style preprocessing stack, outermost last:
/// video, statistics, noop reset, max-and-skip, episodic life, fire reset,
/// reward clipping, resize, grayscale, frame stack.
pub fn wrap_deepmind<E: Env + 'static>(env: E, config: &PipelineConfig) -> Result<Box<dyn Env>> {
    let env: Box<dyn Env> = if config.capture_video {
        Box::new(RecordVideo::new(env, &config.video_dir)?)
    } else {
        Box::new(env)
    };
    let env = RecordEpisodeStatistics::new(env);
    let env = NoopReset::new(env, config.noop_max, config.seed)?;
    let env: Box<dyn Env> = if config.max_and_skip {
        Box::new(MaxAndSkip::new(env, config.skip)?)
    } else {
        Box::new(env)
    };
    let env = EpisodicLife::new(env);
    let env: Box<dyn Env> = if env.action_meanings().get(1) == Some(&ActionMeaning::Fire) {
        Box::new(FireReset::new(env)?)
    } else {
        Box::new(env)
    };
    let env: Box<dyn Env> = if config.clip_rewards {
        Box::new(ClipReward::new(env))
    } else {
        env
    };
    let env = ResizeObservation::new(env, config.dim)?;
    let env = GrayScaleObservation::new(env);
    if config.frame_stack {
        Ok(Box::new(FrameStack::new(env, config.stack_size)?))
    } else {
        Ok(Box::new(env))
    }
}

/// Builds the emulator env for `rom` and wraps it. Video capture forces the
/// base env into RGB-array render mode.
pub fn make_env(
    rom: &Path,
    profile: GameProfile,
    nes_config: NesConfig,
    config: &PipelineConfig,
) -> Result<Box<dyn Env>> {
    let render_mode = if config.capture_video {
        RenderMode::RgbArray
    } else {
        config.render_mode
    };
    tracing::debug!(rom = %rom.display(), game = %profile.name, ?render_mode, "building env");
    let env = NesEnv::new(rom, profile, nes_config, render_mode)?;
    wrap_deepmind(env, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::testing::ScriptedEnv;

    fn config(dim: u32) -> PipelineConfig {
        PipelineConfig {
            dim,
            capture_video: false,
            seed: Some(3),
            ..Default::default()
        }
    }

    #[test]
    fn produces_stacked_square_frames() {
        let mut env = wrap_deepmind(ScriptedEnv::new(vec![30, 40, 3], 1000), &config(8)).unwrap();
        let (obs, _) = env.reset().unwrap();
        assert_eq!(obs.shape(), &[4, 8, 8]);
        let step = env.step(2).unwrap();
        assert_eq!(step.obs.shape(), &[4, 8, 8]);
        assert_eq!(env.n_actions(), 4);
    }

    #[test]
    fn unstacked_pipeline_yields_single_gray_frame() {
        let cfg = PipelineConfig {
            frame_stack: false,
            ..config(6)
        };
        let mut env = wrap_deepmind(ScriptedEnv::new(vec![12, 12, 3], 1000), &cfg).unwrap();
        let (obs, _) = env.reset().unwrap();
        assert_eq!(obs.shape(), &[6, 6]);
    }

    #[test]
    fn episode_statistics_reach_the_outer_layer() {
        let mut env = wrap_deepmind(ScriptedEnv::new(vec![4, 4, 3], 50), &config(4)).unwrap();
        env.reset().unwrap();
        let mut finished = None;
        for _ in 0..100 {
            let step = env.step(0).unwrap();
            if step.done() {
                finished = step.info.episode;
                break;
            }
        }
        let stats = finished.expect("episode should finish");
        assert_eq!(stats.length, 50);
    }

    #[test]
    fn clipping_and_max_and_skip_are_optional_layers() {
        let cfg = PipelineConfig {
            clip_rewards: true,
            max_and_skip: true,
            ..config(4)
        };
        let mut inner = ScriptedEnv::new(vec![4, 4, 3], 1000);
        inner.reward = 5.0;
        let mut env = wrap_deepmind(inner, &cfg).unwrap();
        env.reset().unwrap();
        assert_eq!(env.step(0).unwrap().reward, 1.0);
    }
}
