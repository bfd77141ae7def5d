use anyhow::Result;

use super::{ActionMeaning, Env, Info, Observation, Step};

/// Deterministic in-memory environment for wrapper and runner tests.
///
/// Every frame is filled with the running step counter (wrapping at 256), so
/// tests can tell frames apart. With `per_episode_frames` the counter restarts
/// on every reset.
pub(crate) struct ScriptedEnv {
    pub meanings: Vec<ActionMeaning>,
    pub shape: Vec<usize>,
    pub episode_len: usize,
    pub reward: f64,
    pub start_lives: u32,
    pub life_loss_every: Option<usize>,
    /// Reports the window as closed from this total step count on.
    pub close_after: Option<usize>,
    pub per_episode_frames: bool,
    pub resets: usize,
    pub renders: usize,
    pub total_steps: usize,
    pub episode_steps: usize,
    pub actions: Vec<usize>,
    lives: u32,
}

impl ScriptedEnv {
    pub fn new(shape: Vec<usize>, episode_len: usize) -> Self {
        Self {
            meanings: vec![
                ActionMeaning::Noop,
                ActionMeaning::Fire,
                ActionMeaning::Right,
                ActionMeaning::Left,
            ],
            shape,
            episode_len,
            reward: 1.0,
            start_lives: 0,
            life_loss_every: None,
            close_after: None,
            per_episode_frames: false,
            resets: 0,
            renders: 0,
            total_steps: 0,
            episode_steps: 0,
            actions: Vec::new(),
            lives: 0,
        }
    }

    pub fn with_lives(mut self, lives: u32, every: usize) -> Self {
        self.start_lives = lives;
        self.life_loss_every = Some(every);
        self
    }

    fn frame(&self) -> Observation {
        let len: usize = self.shape.iter().product();
        let counter = if self.per_episode_frames {
            self.episode_steps
        } else {
            self.total_steps
        };
        Observation::new(self.shape.clone(), vec![counter as u8; len]).unwrap()
    }

    fn info(&self) -> Info {
        Info {
            lives: self.life_loss_every.map(|_| self.lives),
            frame_number: self.total_steps as u64,
            closed: self.close_after.is_some_and(|n| self.total_steps >= n),
            ..Default::default()
        }
    }
}

impl Env for ScriptedEnv {
    fn id(&self) -> &str {
        "scripted"
    }

    fn reset(&mut self) -> Result<(Observation, Info)> {
        self.resets += 1;
        self.episode_steps = 0;
        self.lives = self.start_lives;
        Ok((self.frame(), self.info()))
    }

    fn step(&mut self, action: usize) -> Result<Step> {
        self.actions.push(action);
        self.total_steps += 1;
        self.episode_steps += 1;
        if let Some(every) = self.life_loss_every {
            if self.episode_steps.is_multiple_of(every) {
                self.lives = self.lives.saturating_sub(1);
            }
        }
        let out_of_lives = self.life_loss_every.is_some() && self.lives == 0;
        Ok(Step {
            obs: self.frame(),
            reward: self.reward,
            terminated: self.episode_steps >= self.episode_len || out_of_lives,
            truncated: false,
            info: self.info(),
        })
    }

    fn action_meanings(&self) -> &[ActionMeaning] {
        &self.meanings
    }

    fn lives(&self) -> u32 {
        self.lives
    }

    fn render(&mut self) -> Result<Option<Observation>> {
        self.renders += 1;
        Ok(Some(Observation::new(
            vec![2, 2, 3],
            vec![self.total_steps as u8; 12],
        )?))
    }
}
