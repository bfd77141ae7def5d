//! Episode recording to animated GIFs.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, DynamicImage, Frame, RgbImage};

use super::{ActionMeaning, Env, Info, Observation, Step};

const FPS: u32 = 30;

/// Records episodes 0, 1, 8, 27, ..., 729, 1000, 2000, ...
pub fn capped_cubic_schedule(episode_id: u64) -> bool {
    if episode_id < 1000 {
        let root = (episode_id as f64).cbrt().round() as u64;
        root * root * root == episode_id
    } else {
        episode_id.is_multiple_of(1000)
    }
}

struct Recording {
    path: PathBuf,
    encoder: GifEncoder<BufWriter<File>>,
    frames: usize,
}

impl Recording {
    fn create(path: PathBuf) -> Result<Self> {
        let file = File::create(&path)
            .with_context(|| format!("failed to create video {}", path.display()))?;
        let mut encoder = GifEncoder::new(BufWriter::new(file));
        encoder.set_repeat(Repeat::Infinite)?;
        Ok(Self {
            path,
            encoder,
            frames: 0,
        })
    }

    fn push(&mut self, frame: &Observation) -> Result<()> {
        let [h, w, 3] = *frame.shape() else {
            bail!("video frames must be RGB, got {:?}", frame.shape());
        };
        let Some(rgb) = RgbImage::from_raw(w as u32, h as u32, frame.data().to_vec()) else {
            bail!("bad RGB frame of shape {:?}", frame.shape());
        };
        let rgba = DynamicImage::ImageRgb8(rgb).into_rgba8();
        let delay = Delay::from_numer_denom_ms(1000, FPS);
        self.encoder
            .encode_frame(Frame::from_parts(rgba, 0, 0, delay))?;
        self.frames += 1;
        Ok(())
    }
}

/// Writes selected episodes of the wrapped environment to
/// `<dir>/<env id>/episode-<n>.gif`. Frames come from `render`, so the base
/// environment must run in RGB-array mode.
pub struct RecordVideo<E> {
    env: E,
    dir: PathBuf,
    trigger: fn(u64) -> bool,
    episode_id: u64,
    recording: Option<Recording>,
}

impl<E: Env> RecordVideo<E> {
    pub fn new(env: E, root: impl AsRef<Path>) -> Result<Self> {
        let dir = root.as_ref().join(env.id());
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create video dir {}", dir.display()))?;
        Ok(Self {
            env,
            dir,
            trigger: capped_cubic_schedule,
            episode_id: 0,
            recording: None,
        })
    }

    pub fn with_trigger(mut self, trigger: fn(u64) -> bool) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn capture(&mut self) -> Result<()> {
        if self.recording.is_none() {
            return Ok(());
        }
        let Some(frame) = self.env.render()? else {
            tracing::warn!("render returned no frame; stopping video capture");
            self.recording = None;
            return Ok(());
        };
        if let Some(rec) = self.recording.as_mut() {
            rec.push(&frame)?;
        }
        Ok(())
    }

    /// Finishes the current recording, if any.
    pub fn close(&mut self) {
        if let Some(rec) = self.recording.take() {
            let Recording { path, frames, .. } = rec;
            tracing::info!(path = %path.display(), frames, "saved episode video");
        }
    }
}

impl<E: Env> Env for RecordVideo<E> {
    fn id(&self) -> &str {
        self.env.id()
    }

    fn reset(&mut self) -> Result<(Observation, Info)> {
        self.close();
        let out = self.env.reset()?;
        if (self.trigger)(self.episode_id) {
            let path = self.dir.join(format!("episode-{}.gif", self.episode_id));
            self.recording = Some(Recording::create(path)?);
            self.capture()?;
        }
        Ok(out)
    }

    fn step(&mut self, action: usize) -> Result<Step> {
        let step = self.env.step(action)?;
        self.capture()?;
        if step.done() {
            self.close();
            self.episode_id += 1;
        }
        Ok(step)
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
}

impl<E> Drop for RecordVideo<E> {
    fn drop(&mut self) {
        if let Some(rec) = self.recording.take() {
            tracing::warn!(
                path = %rec.path.display(),
                frames = rec.frames,
                "episode video closed before the episode finished"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::testing::ScriptedEnv;

    #[test]
    fn schedule_is_capped_cubic() {
        let picked: Vec<u64> = (0..1000).filter(|&e| capped_cubic_schedule(e)).collect();
        assert_eq!(picked, vec![0, 1, 8, 27, 64, 125, 216, 343, 512, 729]);
        assert!(capped_cubic_schedule(1000));
        assert!(capped_cubic_schedule(5000));
        assert!(!capped_cubic_schedule(1331));
    }

    #[test]
    fn records_scheduled_episodes_under_env_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = RecordVideo::new(ScriptedEnv::new(vec![1], 2), dir.path()).unwrap();
        assert_eq!(env.dir(), dir.path().join("scripted"));
        for _ in 0..3 {
            env.reset().unwrap();
            while !env.step(0).unwrap().done() {}
        }
        drop(env);
        let root = dir.path().join("scripted");
        assert!(root.join("episode-0.gif").exists());
        assert!(root.join("episode-1.gif").exists());
        assert!(!root.join("episode-2.gif").exists());
        let len = std::fs::metadata(root.join("episode-0.gif")).unwrap().len();
        assert!(len > 0);
    }

    #[test]
    fn custom_trigger_disables_recording() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = RecordVideo::new(ScriptedEnv::new(vec![1], 1), dir.path())
            .unwrap()
            .with_trigger(|_| false);
        env.reset().unwrap();
        env.step(0).unwrap();
        let entries = std::fs::read_dir(dir.path().join("scripted")).unwrap().count();
        assert_eq!(entries, 0);
    }
}
