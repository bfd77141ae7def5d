use anyhow::{Context, Result, ensure};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};
use tetanes_core::input::JoypadBtnState;
use tetanes_core::mem::Read;
use tetanes_core::prelude::*;

use super::{ActionMeaning, Env, Info, Observation, RenderMode, Step};

pub const FRAME_WIDTH: usize = 256;
pub const FRAME_HEIGHT: usize = 240;

// =============================================================================
// Emulator Knobs
// =============================================================================

#[derive(Debug, Clone)]
pub struct NesConfig {
    /// Emulator frames per agent step; the action is held for all of them.
    pub frame_skip: u32,
    pub sticky_action_prob: f64,
    pub max_episode_frames: u64,
    /// Throttle to 60 frames per second.
    pub real_time: bool,
    pub seed: Option<u64>,
}

impl Default for NesConfig {
    fn default() -> Self {
        Self {
            frame_skip: 4,
            sticky_action_prob: 0.25,
            max_episode_frames: 108_000,
            real_time: false,
            seed: None,
        }
    }
}

// =============================================================================
// Game Profile
// =============================================================================

/// Per-game description: action set and where the game keeps its counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GameProfile {
    pub name: String,
    pub actions: Vec<ActionMeaning>,
    /// RAM address of the life counter. Without it no life or game-over
    /// signal is reported and episodes end by truncation only.
    pub lives_addr: Option<u16>,
    /// Score BCD digits, most significant first.
    pub score_digits: Vec<u16>,
    pub boot_frames: u32,
    pub start_press_frames: u32,
    pub settle_frames: u32,
}

impl Default for GameProfile {
    fn default() -> Self {
        Self {
            name: "breakout".to_string(),
            actions: vec![
                ActionMeaning::Noop,
                ActionMeaning::Fire,
                ActionMeaning::Right,
                ActionMeaning::Left,
            ],
            lives_addr: None,
            score_digits: Vec::new(),
            boot_frames: 120,
            start_press_frames: 2,
            settle_frames: 60,
        }
    }
}

impl GameProfile {
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open game profile: {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        let profile: GameProfile = serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse game profile: {}", path.display()))?;
        ensure!(
            !profile.actions.is_empty(),
            "game profile {} has an empty action set",
            profile.name
        );
        Ok(profile)
    }
}

// =============================================================================
// Pixel Helpers
// =============================================================================

pub(crate) fn rgba_to_rgb(fb: &[u8]) -> Vec<u8> {
    fb.chunks_exact(4)
        .flat_map(|px| px[..3].iter().copied())
        .collect()
}

fn blit_rgba_to_u32(fb: &[u8], out: &mut [u32]) {
    for (dst, src) in out.iter_mut().zip(fb.chunks_exact(4)) {
        *dst = ((src[0] as u32) << 16) | ((src[1] as u32) << 8) | (src[2] as u32);
    }
}

pub(crate) fn decode_bcd(digits: impl IntoIterator<Item = u8>) -> u32 {
    digits
        .into_iter()
        .fold(0u32, |acc, d| acc * 10 + (d & 0x0F) as u32)
}

pub(crate) fn joypad_state(meaning: ActionMeaning) -> JoypadBtnState {
    let mut state = JoypadBtnState::empty();
    state.set(JoypadBtnState::UP, meaning.has_up());
    state.set(JoypadBtnState::DOWN, meaning.has_down());
    state.set(JoypadBtnState::LEFT, meaning.has_left());
    state.set(JoypadBtnState::RIGHT, meaning.has_right());
    state.set(JoypadBtnState::A, meaning.has_fire());
    state
}

/// Per-frame actions for one skip window. Each frame repeats the previously
/// applied action with probability `sticky_prob`, so a switch can land
/// mid-window and then holds.
pub(crate) fn sticky_window<R: Rng>(
    rng: &mut R,
    sticky_prob: f64,
    mut last: usize,
    action: usize,
    frames: u32,
) -> Vec<usize> {
    (0..frames.max(1))
        .map(|_| {
            if rng.random::<f64>() >= sticky_prob {
                last = action;
            }
            last
        })
        .collect()
}

fn open_window(title: &str) -> Result<minifb::Window> {
    let mut window = minifb::Window::new(
        title,
        FRAME_WIDTH,
        FRAME_HEIGHT,
        minifb::WindowOptions {
            resize: true,
            scale: minifb::Scale::X2,
            ..Default::default()
        },
    )?;
    window.set_target_fps(60);
    Ok(window)
}

// =============================================================================
// NES Environment
// =============================================================================

pub struct NesEnv {
    deck: ControlDeck,
    profile: GameProfile,
    config: NesConfig,
    render_mode: RenderMode,
    window: Option<minifb::Window>,
    window_buf: Vec<u32>,
    rng: SmallRng,
    last_action: usize,
    frame_number: u64,
    episode_start_frame: u64,
    prev_score: u32,
    prev_lives: u32,
    next_frame_deadline: Option<Instant>,
    debug_state: bool,
}

impl NesEnv {
    pub fn new(
        rom_path: &Path,
        profile: GameProfile,
        config: NesConfig,
        render_mode: RenderMode,
    ) -> Result<Self> {
        ensure!(!profile.actions.is_empty(), "action set must not be empty");
        let mut deck = ControlDeck::new();
        deck.set_headless_mode(tetanes_core::control_deck::HeadlessMode::NO_AUDIO);
        deck.load_rom_path(rom_path)
            .with_context(|| format!("Failed to load ROM: {}", rom_path.display()))?;

        let window = match render_mode {
            RenderMode::Human => Some(open_window(&profile.name)?),
            _ => None,
        };
        let rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };

        Ok(Self {
            deck,
            profile,
            config,
            render_mode,
            window,
            window_buf: vec![0u32; FRAME_WIDTH * FRAME_HEIGHT],
            rng,
            last_action: 0,
            frame_number: 0,
            episode_start_frame: 0,
            prev_score: 0,
            prev_lives: 0,
            next_frame_deadline: None,
            debug_state: Self::debug_state_enabled(),
        })
    }

    fn debug_state_enabled() -> bool {
        match std::env::var("CFC_DEBUG_ENV") {
            Ok(val) => matches!(val.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"),
            Err(_) => false,
        }
    }

    fn log_state(&self, tag: &str) {
        if !self.debug_state {
            return;
        }
        eprintln!(
            "[env:{tag}] frame={frame} episode_frames={ep} score={score} lives={lives}",
            frame = self.frame_number,
            ep = self.frame_number - self.episode_start_frame,
            score = self.prev_score,
            lives = self.prev_lives,
        );
    }

    pub fn clock_frame(&mut self) -> Result<()> {
        self.deck.clock_frame()?;
        self.frame_number += 1;
        if self.config.real_time {
            self.throttle_frame();
        }
        Ok(())
    }

    fn throttle_frame(&mut self) {
        let frame_duration = Duration::from_nanos(1_000_000_000 / 60);
        let now = Instant::now();
        match self.next_frame_deadline {
            Some(deadline) if deadline > now => {
                std::thread::sleep(deadline - now);
                self.next_frame_deadline = Some(deadline + frame_duration);
            }
            _ => {
                self.next_frame_deadline = Some(now + frame_duration);
            }
        }
    }

    pub fn peek(&self, addr: u16) -> u8 {
        self.deck.bus().peek(addr)
    }

    pub fn read_score(&self) -> u32 {
        decode_bcd(self.profile.score_digits.iter().map(|&addr| self.peek(addr)))
    }

    fn read_lives(&self) -> Option<u32> {
        self.profile.lives_addr.map(|addr| self.peek(addr) as u32)
    }

    pub fn set_input_state(&mut self, btn_state: JoypadBtnState) {
        let joypad = self.deck.joypad_mut(Player::One);
        for button in [
            JoypadBtnState::LEFT,
            JoypadBtnState::RIGHT,
            JoypadBtnState::UP,
            JoypadBtnState::DOWN,
            JoypadBtnState::A,
            JoypadBtnState::B,
            JoypadBtnState::TURBO_A,
            JoypadBtnState::TURBO_B,
            JoypadBtnState::START,
            JoypadBtnState::SELECT,
        ] {
            joypad.set_button(button, btn_state.contains(button));
        }
    }

    pub fn press_start(&mut self, frames: u32) -> Result<()> {
        let mut btn_state = JoypadBtnState::empty();
        btn_state.set(JoypadBtnState::START, true);
        for _ in 0..frames {
            self.set_input_state(btn_state);
            self.clock_frame()?;
        }
        self.set_input_state(JoypadBtnState::empty());
        Ok(())
    }

    fn observation(&mut self) -> Result<Observation> {
        let rgb = rgba_to_rgb(self.deck.frame_buffer());
        Observation::new(vec![FRAME_HEIGHT, FRAME_WIDTH, 3], rgb)
    }

    fn info(&self) -> Info {
        Info {
            lives: self.read_lives(),
            frame_number: self.frame_number,
            ..Default::default()
        }
    }

    /// Returns whether the window is still open.
    fn draw_window(&mut self) -> Result<bool> {
        blit_rgba_to_u32(self.deck.frame_buffer(), &mut self.window_buf);
        match self.window.as_mut() {
            Some(window) => {
                window.update_with_buffer(&self.window_buf, FRAME_WIDTH, FRAME_HEIGHT)?;
                Ok(window.is_open())
            }
            None => Ok(true),
        }
    }
}

impl Env for NesEnv {
    fn id(&self) -> &str {
        &self.profile.name
    }

    fn reset(&mut self) -> Result<(Observation, Info)> {
        self.deck.reset(ResetKind::Soft);
        for _ in 0..self.profile.boot_frames {
            self.clock_frame()?;
        }
        self.press_start(self.profile.start_press_frames)?;
        for _ in 0..self.profile.settle_frames {
            self.clock_frame()?;
        }

        self.prev_score = self.read_score();
        self.prev_lives = self.read_lives().unwrap_or(0);
        self.episode_start_frame = self.frame_number;
        self.last_action = 0;
        self.log_state("reset");

        let mut info = self.info();
        if self.render_mode == RenderMode::Human {
            info.closed = !self.draw_window()?;
        }
        Ok((self.observation()?, info))
    }

    fn step(&mut self, action: usize) -> Result<Step> {
        ensure!(
            action < self.profile.actions.len(),
            "action {action} out of range for {} actions",
            self.profile.actions.len()
        );
        let window = sticky_window(
            &mut self.rng,
            self.config.sticky_action_prob,
            self.last_action,
            action,
            self.config.frame_skip,
        );

        let mut reward = 0.0;
        let mut terminated = false;
        for effective_action in window {
            self.last_action = effective_action;
            self.set_input_state(joypad_state(self.profile.actions[effective_action]));
            self.clock_frame()?;

            let score = self.read_score();
            reward += score.saturating_sub(self.prev_score) as f64;
            self.prev_score = score;

            if let Some(lives) = self.read_lives() {
                if lives == 0 && self.prev_lives > 0 {
                    terminated = true;
                }
                self.prev_lives = lives;
                if terminated {
                    break;
                }
            }
        }
        let truncated = !terminated
            && self.frame_number - self.episode_start_frame >= self.config.max_episode_frames;
        if terminated || truncated {
            self.log_state("done");
        }

        let mut info = self.info();
        if self.render_mode == RenderMode::Human {
            info.closed = !self.draw_window()?;
        }
        Ok(Step {
            obs: self.observation()?,
            reward,
            terminated,
            truncated,
            info,
        })
    }

    fn action_meanings(&self) -> &[ActionMeaning] {
        &self.profile.actions
    }

    fn lives(&self) -> u32 {
        self.read_lives().unwrap_or(0)
    }

    fn render(&mut self) -> Result<Option<Observation>> {
        match self.render_mode {
            RenderMode::RgbArray => Ok(Some(self.observation()?)),
            // the window is drawn by reset and step
            RenderMode::Human | RenderMode::None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bcd_digits_decode_most_significant_first() {
        assert_eq!(decode_bcd([0x01, 0x02, 0x03]), 123);
        assert_eq!(decode_bcd([0xF9, 0x00]), 90);
        assert_eq!(decode_bcd(std::iter::empty()), 0);
    }

    #[test]
    fn rgba_drops_alpha() {
        let fb = [1, 2, 3, 255, 4, 5, 6, 255];
        assert_eq!(rgba_to_rgb(&fb), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn blit_packs_rgb() {
        let fb = [0x12, 0x34, 0x56, 0xFF];
        let mut out = [0u32; 1];
        blit_rgba_to_u32(&fb, &mut out);
        assert_eq!(out[0], 0x123456);
    }

    #[test]
    fn sticky_extremes_hold_or_follow_the_action() {
        let mut rng = SmallRng::seed_from_u64(3);
        assert_eq!(sticky_window(&mut rng, 0.0, 2, 1, 4), vec![1; 4]);
        assert_eq!(sticky_window(&mut rng, 1.0, 2, 1, 4), vec![2; 4]);
        assert_eq!(sticky_window(&mut rng, 1.0, 2, 1, 0), vec![2]);
    }

    #[test]
    fn sticky_draw_happens_every_frame() {
        let mut rng = SmallRng::seed_from_u64(7);
        let mut switched_mid_window = 0;
        for _ in 0..200 {
            let window = sticky_window(&mut rng, 0.5, 0, 1, 4);
            // once the new action lands it is held for the rest of the window
            let first_new = window.iter().position(|&a| a == 1).unwrap_or(4);
            assert!(window[first_new..].iter().all(|&a| a == 1));
            assert!(window[..first_new].iter().all(|&a| a == 0));
            if first_new > 0 && first_new < 4 {
                switched_mid_window += 1;
            }
        }
        assert!(switched_mid_window > 0);
    }

    #[test]
    fn joypad_mapping_combines_directions_and_fire() {
        let state = joypad_state(ActionMeaning::UpLeftFire);
        assert!(state.contains(JoypadBtnState::UP));
        assert!(state.contains(JoypadBtnState::LEFT));
        assert!(state.contains(JoypadBtnState::A));
        assert!(!state.contains(JoypadBtnState::RIGHT));
        assert!(joypad_state(ActionMeaning::Noop).is_empty());
    }

    #[test]
    fn profile_fills_missing_fields_from_default() {
        let profile: GameProfile =
            serde_json::from_str(r#"{"name":"arkanoid","lives_addr":13}"#).unwrap();
        assert_eq!(profile.name, "arkanoid");
        assert_eq!(profile.lives_addr, Some(13));
        assert_eq!(profile.actions.len(), 4);
        assert_eq!(profile.actions[1], ActionMeaning::Fire);
    }
}
