//! Keyboard-driven play, independent of any model.
//!
//! A listener thread reads terminal key events and writes the chosen action
//! into a [`CommandSlot`]; the render loop polls the slot every step.

use std::io::stdout;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::event::{
    self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers, KeyboardEnhancementFlags,
    PopKeyboardEnhancementFlags, PushKeyboardEnhancementFlags,
};
use crossterm::execute;
use crossterm::terminal::{self, disable_raw_mode, enable_raw_mode};

use crate::env::{ActionMeaning, Env, action_index};

// =============================================================================
// Shared command slot
// =============================================================================

/// Pending action plus exit flag, shared between the listener and the loop.
#[derive(Debug, Default)]
pub struct CommandSlot {
    action: AtomicUsize,
    exit: AtomicBool,
}

impl CommandSlot {
    pub fn new(initial_action: usize) -> Arc<Self> {
        Arc::new(Self {
            action: AtomicUsize::new(initial_action),
            exit: AtomicBool::new(false),
        })
    }

    pub fn set_action(&self, action: usize) {
        self.action.store(action, Ordering::Relaxed);
    }

    pub fn action(&self) -> usize {
        self.action.load(Ordering::Relaxed)
    }

    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::Release);
    }

    pub fn should_exit(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }
}

// =============================================================================
// Key translation
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCommand {
    Act(usize),
    Exit,
    Ignore,
}

/// `a` and `d` map to the game's LEFT and RIGHT actions, when it has them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyBindings {
    pub left: Option<usize>,
    pub right: Option<usize>,
    /// Event kind that triggers a command.
    pub trigger: KeyEventKind,
}

impl KeyBindings {
    pub fn from_meanings(meanings: &[ActionMeaning], trigger: KeyEventKind) -> Self {
        Self {
            left: action_index(meanings, ActionMeaning::Left),
            right: action_index(meanings, ActionMeaning::Right),
            trigger,
        }
    }

    pub fn translate(&self, key: KeyEvent) -> KeyCommand {
        if key.kind != self.trigger {
            return KeyCommand::Ignore;
        }
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            return KeyCommand::Exit;
        }
        let action = match key.code {
            KeyCode::Esc => return KeyCommand::Exit,
            KeyCode::Char('a') => self.left,
            KeyCode::Char('d') => self.right,
            _ => None,
        };
        action.map_or(KeyCommand::Ignore, KeyCommand::Act)
    }
}

// =============================================================================
// Terminal + listener
// =============================================================================

/// Raw mode, plus release reporting where the terminal supports it. Both are
/// undone on drop.
pub struct TerminalGuard {
    enhanced: bool,
}

impl TerminalGuard {
    pub fn enter() -> Result<Self> {
        enable_raw_mode().context("Failed to enable raw mode")?;
        let mut guard = Self { enhanced: false };
        if matches!(terminal::supports_keyboard_enhancement(), Ok(true)) {
            let mut out = stdout();
            execute!(
                out,
                PushKeyboardEnhancementFlags(KeyboardEnhancementFlags::REPORT_EVENT_TYPES)
            )
            .context("Failed to enable key release events")?;
            guard.enhanced = true;
        }
        Ok(guard)
    }

    /// Key releases when the terminal reports them, presses otherwise.
    pub fn trigger(&self) -> KeyEventKind {
        if self.enhanced {
            KeyEventKind::Release
        } else {
            KeyEventKind::Press
        }
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if self.enhanced {
            let mut out = stdout();
            let _ = execute!(out, PopKeyboardEnhancementFlags);
        }
        let _ = disable_raw_mode();
    }
}

/// Reads key events until an exit key arrives or the slot's exit flag is set
/// elsewhere.
pub fn spawn_listener(slot: Arc<CommandSlot>, bindings: KeyBindings) -> JoinHandle<Result<()>> {
    thread::spawn(move || {
        while !slot.should_exit() {
            if !event::poll(Duration::from_millis(50))? {
                continue;
            }
            if let Event::Key(key) = event::read()? {
                match bindings.translate(key) {
                    KeyCommand::Act(action) => slot.set_action(action),
                    KeyCommand::Exit => slot.request_exit(),
                    KeyCommand::Ignore => {}
                }
            }
        }
        Ok(())
    })
}

// =============================================================================
// Play loop
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ManualStats {
    pub steps: u64,
    pub episodes: u64,
    pub total_reward: f64,
}

/// Steps `env` with the slot's pending action until exit is requested or the
/// window closes. A human-mode env draws its window inside `step`, so the loop
/// never calls `render`. Finished episodes are only reset when
/// `reset_on_done` is set.
pub fn play<E: Env>(env: &mut E, slot: &CommandSlot, reset_on_done: bool) -> Result<ManualStats> {
    let mut stats = ManualStats::default();
    env.reset()?;
    while !slot.should_exit() {
        let step = env.step(slot.action())?;
        stats.steps += 1;
        stats.total_reward += step.reward;
        if step.info.closed {
            slot.request_exit();
            break;
        }
        if step.done() {
            stats.episodes += 1;
            if reset_on_done {
                env.reset()?;
            }
        }
    }
    Ok(stats)
}
