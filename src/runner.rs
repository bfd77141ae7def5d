use anyhow::Result;
use candle_core::{D, Device};
use serde::Serialize;

use crate::cfc::RecurrentCore;
use crate::env::{Env, Observation};
use crate::model::ConvPolicy;
use crate::train::with_autorelease_pool;

/// Drives an environment with a trained policy, one greedy action per step.
///
/// The hidden state is carried across steps of an episode and dropped on
/// every reset. The model is only read.
pub struct ClosedLoopRunner<'a, R: RecurrentCore, E> {
    model: &'a ConvPolicy<R>,
    env: E,
    device: Device,
    hidden: Option<R::State>,
    resets: usize,
}

impl<'a, R: RecurrentCore, E: Env> ClosedLoopRunner<'a, R, E> {
    pub fn new(model: &'a ConvPolicy<R>, env: E, device: &Device) -> Self {
        Self {
            model,
            env,
            device: device.clone(),
            hidden: None,
            resets: 0,
        }
    }

    pub fn hidden(&self) -> Option<&R::State> {
        self.hidden.as_ref()
    }

    /// Environment resets performed so far.
    pub fn resets(&self) -> usize {
        self.resets
    }

    pub fn into_env(self) -> E {
        self.env
    }

    /// Picks the arg-max action for `obs` and advances the hidden state.
    pub fn act(&mut self, obs: &Observation) -> Result<usize> {
        with_autorelease_pool(|| {
            let xs = obs.to_tensor(&self.device)?.unsqueeze(0)?.unsqueeze(0)?;
            let (logits, hidden) = self.model.forward_t(&xs, self.hidden.take(), false)?;
            self.hidden = Some(hidden);
            let action = logits
                .squeeze(0)?
                .squeeze(0)?
                .argmax(D::Minus1)?
                .to_scalar::<u32>()?;
            Ok(action as usize)
        })
    }

    fn reset(&mut self) -> Result<Observation> {
        let (obs, _) = self.env.reset()?;
        self.resets += 1;
        self.hidden = None;
        Ok(obs)
    }

    /// Runs until `num_episodes` episodes have finished, or with `None` until
    /// the environment reports its window closed. Returns one total reward
    /// per finished episode.
    pub fn run(&mut self, num_episodes: Option<usize>) -> Result<Vec<f64>> {
        let mut returns = Vec::new();
        let mut remaining = num_episodes;
        if remaining == Some(0) {
            return Ok(returns);
        }

        let mut obs = self.reset()?;
        let mut total_reward = 0.0f64;
        loop {
            let action = self.act(&obs)?;
            let step = self.env.step(action)?;
            total_reward += step.reward;

            if step.done() {
                obs = self.reset()?;
                returns.push(total_reward);
                tracing::info!(
                    episode = returns.len(),
                    total_reward,
                    "closed-loop episode finished"
                );
                total_reward = 0.0;
                if let Some(left) = remaining.as_mut() {
                    *left -= 1;
                    if *left == 0 {
                        return Ok(returns);
                    }
                }
            } else {
                obs = step.obs;
            }

            if step.info.closed {
                tracing::info!(episodes = returns.len(), "window closed, stopping");
                return Ok(returns);
            }
        }
    }
}

/// Runs `model` in `env` for `num_episodes` episodes (or until the window
/// closes) and returns the episode returns.
pub fn run_closed_loop<R: RecurrentCore, E: Env>(
    model: &ConvPolicy<R>,
    env: E,
    device: &Device,
    num_episodes: Option<usize>,
) -> Result<Vec<f64>> {
    ClosedLoopRunner::new(model, env, device).run(num_episodes)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReturnSummary {
    pub episodes: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

pub fn summarize(returns: &[f64]) -> Option<ReturnSummary> {
    if returns.is_empty() {
        return None;
    }
    let sum: f64 = returns.iter().sum();
    let min = returns.iter().copied().fold(f64::INFINITY, f64::min);
    let max = returns.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some(ReturnSummary {
        episodes: returns.len(),
        mean: sum / returns.len() as f64,
        min,
        max,
    })
}
