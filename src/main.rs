// =============================================================================
// Behavioral cloning of NES game play with a convolutional CfC policy
// =============================================================================
// Build & Run:
//   cargo build --release
//   cargo run --release -- run    --rom breakout.nes --data data/breakout
//   cargo run --release -- play   --rom breakout.nes --checkpoint checkpoints
//   cargo run --release -- manual --rom breakout.nes

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use anyhow::{Context, Result, anyhow, ensure};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use cfc_cloning::checkpoint::{self, TrainMeta};
use cfc_cloning::dataset::{DataLoader, NpzDataset, Split};
use cfc_cloning::env::{Env, GameProfile, NesConfig, NesEnv, PipelineConfig, RenderMode, make_env};
use cfc_cloning::manual::{self, CommandSlot, KeyBindings, TerminalGuard};
use cfc_cloning::model::{CellKind, ConvConfig, ConvPolicy};
use cfc_cloning::runner::{run_closed_loop, summarize};
use cfc_cloning::train::{self, TrainConfig};
use cfc_cloning::{CfcConfig, CfcMode, RecurrentCore};

const BANNER: &str = "═══════════════════════════════════════════════════════════";

fn select_device(cpu: bool) -> Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }
    if candle_core::utils::cuda_is_available() {
        return Ok(Device::new_cuda(0)?);
    }
    Ok(Device::new_metal(0).unwrap_or(Device::Cpu))
}

fn load_profile(path: Option<&Path>) -> Result<GameProfile> {
    match path {
        Some(path) => GameProfile::load(path),
        None => Ok(GameProfile::default()),
    }
}

fn print_returns(label: &str, returns: &[f64]) {
    match summarize(returns) {
        Some(s) => eprintln!(
            "{label}: {n} episodes | mean {mean:.1} | min {min:.1} | max {max:.1}",
            n = s.episodes,
            mean = s.mean,
            min = s.min,
            max = s.max,
        ),
        None => eprintln!("{label}: no finished episodes"),
    }
}

// =============================================================================
// Run: train, evaluate, closed loop, visualize
// =============================================================================

fn run(args: &RunArgs) -> Result<()> {
    eprintln!("{BANNER}");
    eprintln!("  CLONING: CfC policy from recorded play (Rust + candle)");
    eprintln!("{BANNER}");

    let device = select_device(args.cpu)?;
    eprintln!("Device: {:?}", device);

    let profile = load_profile(args.profile.as_deref())?;
    let n_actions = profile.actions.len();
    let conv = ConvConfig {
        in_channels: args.stack_size,
        ..Default::default()
    };
    let cfc = CfcConfig {
        units: args.units,
        mode: args.mode,
        ..Default::default()
    };
    let train_cfg = TrainConfig {
        lr: args.lr,
        batch_size: args.batch_size,
        epochs: args.epochs,
        max_batches: args.max_batches,
        seed: args.seed,
    };

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    match args.cell {
        CellKind::Cfc => {
            let model = ConvPolicy::cfc(&conv, &cfc, n_actions, vb)?;
            run_with(args, &device, &varmap, &model, profile, conv, cfc, &train_cfg)
        }
        CellKind::Gru => {
            let model = ConvPolicy::gru(&conv, cfc.units, n_actions, vb)?;
            run_with(args, &device, &varmap, &model, profile, conv, cfc, &train_cfg)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_with<R: RecurrentCore>(
    args: &RunArgs,
    device: &Device,
    varmap: &VarMap,
    model: &ConvPolicy<R>,
    profile: GameProfile,
    conv: ConvConfig,
    cfc: CfcConfig,
    train_cfg: &TrainConfig,
) -> Result<()> {
    let train_set = NpzDataset::open(&args.data, Split::Train)?;
    let val_set = NpzDataset::open(&args.data, Split::Val)?;
    eprintln!(
        "Dataset: {} train / {} val sequences from {}",
        train_set.files().len(),
        val_set.files().len(),
        args.data.display()
    );
    let mut train_loader =
        DataLoader::new(train_set, train_cfg.batch_size, true, train_cfg.seed, device)?;
    let mut val_loader = DataLoader::new(val_set, train_cfg.batch_size, false, None, device)?;

    let mut optimizer = train::adam(varmap, train_cfg.lr)?;
    let mut last_train = None;
    let mut last_val = None;
    for epoch in 1..=train_cfg.epochs {
        let stats = train::train_one_epoch(
            model,
            &mut optimizer,
            &mut train_loader,
            train_cfg.max_batches,
        )?;
        let val = train::evaluate(model, &mut val_loader, train_cfg.max_batches)?;
        eprintln!(
            "Epoch {epoch:>3} | train loss {:.4} | val loss {:.4} | val acc {:.2}%",
            stats.loss,
            val.loss,
            val.accuracy * 100.0
        );
        last_train = Some(stats);
        last_val = Some(val);
    }

    let pipeline = PipelineConfig {
        capture_video: !args.no_video,
        stack_size: args.stack_size,
        seed: args.seed,
        ..Default::default()
    };
    let nes_config = NesConfig {
        frame_skip: args.frame_skip,
        seed: args.seed,
        ..Default::default()
    };
    let env = make_env(&args.rom, profile.clone(), nes_config.clone(), &pipeline)?;
    let returns = run_closed_loop(model, env, device, Some(args.eval_episodes))?;
    print_returns("Closed loop", &returns);

    let meta = TrainMeta {
        game: profile.name.clone(),
        n_actions: model.n_actions(),
        cell: args.cell,
        conv,
        cfc,
        epochs: train_cfg.epochs,
        train: last_train,
        val: last_val,
    };
    checkpoint::save_checkpoint(varmap, &meta, &args.checkpoint_dir)?;
    checkpoint::save_returns(&returns, &args.checkpoint_dir)?;
    eprintln!("💾 Checkpoint saved to {}", args.checkpoint_dir.display());

    if !args.no_visualize {
        eprintln!("Visualizing until the window is closed...");
        let pipeline = PipelineConfig {
            capture_video: false,
            render_mode: RenderMode::Human,
            ..pipeline
        };
        let nes_config = NesConfig {
            real_time: true,
            ..nes_config
        };
        let env = make_env(&args.rom, profile, nes_config, &pipeline)?;
        let returns = run_closed_loop(model, env, device, None)?;
        print_returns("Visualized", &returns);
    }
    Ok(())
}

// =============================================================================
// Play: closed loop from a checkpoint
// =============================================================================

fn play(args: &PlayArgs) -> Result<()> {
    eprintln!("{BANNER}");
    eprintln!("  PLAYING: cloned policy");
    eprintln!("{BANNER}");

    let device = select_device(args.cpu)?;
    let meta = checkpoint::load_meta(&args.checkpoint)?;
    let profile = load_profile(args.profile.as_deref())?;
    ensure!(
        profile.actions.len() == meta.n_actions,
        "checkpoint was trained for {} actions but the profile has {}",
        meta.n_actions,
        profile.actions.len()
    );
    eprintln!(
        "📂 {:?} policy for {} loaded from {}",
        meta.cell,
        meta.game,
        args.checkpoint.display()
    );

    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let pipeline = PipelineConfig {
        capture_video: args.video,
        render_mode: if args.headless {
            RenderMode::None
        } else {
            RenderMode::Human
        },
        stack_size: meta.conv.in_channels,
        ..Default::default()
    };
    let nes_config = NesConfig {
        frame_skip: args.frame_skip,
        real_time: !args.headless,
        ..Default::default()
    };
    let env = make_env(&args.rom, profile, nes_config, &pipeline)?;

    let returns = match meta.cell {
        CellKind::Cfc => {
            let model = ConvPolicy::cfc(&meta.conv, &meta.cfc, meta.n_actions, vb)?;
            checkpoint::load_weights(&mut varmap, &args.checkpoint)?;
            run_closed_loop(&model, env, &device, args.episodes)?
        }
        CellKind::Gru => {
            let model = ConvPolicy::gru(&meta.conv, meta.cfc.units, meta.n_actions, vb)?;
            checkpoint::load_weights(&mut varmap, &args.checkpoint)?;
            run_closed_loop(&model, env, &device, args.episodes)?
        }
    };
    print_returns("Played", &returns);
    Ok(())
}

// =============================================================================
// Manual: keyboard control
// =============================================================================

fn manual_play(args: &ManualArgs) -> Result<()> {
    eprintln!("{BANNER}");
    eprintln!("  MANUAL: keyboard play");
    eprintln!("{BANNER}");
    eprintln!("a: LEFT | d: RIGHT | Esc: Quit");

    let profile = load_profile(args.profile.as_deref())?;
    let nes_config = NesConfig {
        frame_skip: args.frame_skip,
        sticky_action_prob: 0.0,
        real_time: true,
        ..Default::default()
    };
    let mut env = NesEnv::new(&args.rom, profile, nes_config, RenderMode::Human)?;

    let slot = CommandSlot::new(0);
    let stats = {
        let guard = TerminalGuard::enter()?;
        let bindings = KeyBindings::from_meanings(env.action_meanings(), guard.trigger());
        let listener = manual::spawn_listener(slot.clone(), bindings);
        let stats = manual::play(&mut env, &slot, args.reset_on_done);
        slot.request_exit();
        listener
            .join()
            .map_err(|_| anyhow!("key listener thread panicked"))?
            .context("key listener failed")?;
        stats?
    };
    eprintln!(
        "Manual session: {} steps | {} episodes | reward {:.1}",
        stats.steps, stats.episodes, stats.total_reward
    );
    Ok(())
}

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "cfc-cloning", about = "Behavioral cloning with a convolutional CfC policy")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train on recorded play, evaluate, run the policy and visualize it
    Run(RunArgs),
    /// Run a saved policy in the emulator
    Play(PlayArgs),
    /// Play with the keyboard
    Manual(ManualArgs),
}

#[derive(Parser)]
struct RunArgs {
    #[arg(long)]
    rom: PathBuf,
    /// Game profile JSON (action set, RAM addresses)
    #[arg(long)]
    profile: Option<PathBuf>,
    /// Dataset root holding train/ and val/ shard directories
    #[arg(long, default_value = "data")]
    data: PathBuf,
    #[arg(long, default_value = "checkpoints")]
    checkpoint_dir: PathBuf,
    #[arg(long, default_value_t = 1)]
    epochs: usize,
    #[arg(long, default_value_t = 32)]
    batch_size: usize,
    #[arg(long, default_value_t = 1e-4)]
    lr: f64,
    /// Cap on batches per training and evaluation pass
    #[arg(long)]
    max_batches: Option<usize>,
    #[arg(long, value_enum, default_value_t = CellKind::Cfc)]
    cell: CellKind,
    #[arg(long, value_enum, default_value_t = CfcMode::Gated)]
    mode: CfcMode,
    #[arg(long, default_value_t = 64)]
    units: usize,
    #[arg(long, default_value_t = 4)]
    stack_size: usize,
    #[arg(long, default_value_t = 4)]
    frame_skip: u32,
    #[arg(long, default_value_t = 10)]
    eval_episodes: usize,
    #[arg(long, default_value_t = false)]
    no_video: bool,
    #[arg(long, default_value_t = false)]
    no_visualize: bool,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value_t = false)]
    cpu: bool,
}

#[derive(Parser)]
struct PlayArgs {
    #[arg(long)]
    rom: PathBuf,
    #[arg(long)]
    profile: Option<PathBuf>,
    #[arg(long, default_value = "checkpoints")]
    checkpoint: PathBuf,
    /// Stop after this many episodes instead of when the window closes.
    /// Required without a window (`--video`, `--headless`).
    #[arg(long)]
    episodes: Option<usize>,
    #[arg(long, default_value_t = 4)]
    frame_skip: u32,
    /// Record episode GIFs instead of opening a window
    #[arg(long, default_value_t = false, requires = "episodes")]
    video: bool,
    #[arg(long, default_value_t = false, requires = "episodes")]
    headless: bool,
    #[arg(long, default_value_t = false)]
    cpu: bool,
}

#[derive(Parser)]
struct ManualArgs {
    #[arg(long)]
    rom: PathBuf,
    #[arg(long)]
    profile: Option<PathBuf>,
    #[arg(long, default_value_t = 1)]
    frame_skip: u32,
    /// Reset the game after it ends (off: the game stays on its final screen)
    #[arg(long, default_value_t = false)]
    reset_on_done: bool,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn,cfc_cloning=info".to_string()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Run(args) => run(args),
        Commands::Play(args) => play(args),
        Commands::Manual(args) => manual_play(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(["cfc-cloning", "play", "--rom", "game.nes"].iter().chain(args).copied())
    }

    #[test]
    fn windowless_play_needs_an_episode_count() {
        assert!(parse(&["--video"]).is_err());
        assert!(parse(&["--headless"]).is_err());
        assert!(parse(&["--video", "--episodes", "3"]).is_ok());
        assert!(parse(&["--headless", "--episodes", "1"]).is_ok());
    }

    #[test]
    fn windowed_play_runs_until_closed() {
        let Commands::Play(args) = parse(&[]).unwrap().command else {
            panic!("expected the play subcommand");
        };
        assert!(args.episodes.is_none());
        assert!(!args.video && !args.headless);
    }
}
