pub mod cfc;
pub mod checkpoint;
pub mod dataset;
pub mod env;
pub mod manual;
pub mod model;
pub mod runner;
pub mod train;

pub use cfc::{Cfc, CfcConfig, CfcMode, GruCore, RecurrentCore};
pub use checkpoint::{TrainMeta, load_meta, load_weights, save_checkpoint, save_returns};
pub use dataset::{DataLoader, InMemoryDataset, NpzDataset, Sequence, SequenceSource, Split};
pub use env::{
    ActionMeaning, Env, GameProfile, Info, NesConfig, NesEnv, Observation, PipelineConfig,
    RenderMode, Step, make_env, wrap_deepmind,
};
pub use model::{CellKind, ConvBlock, ConvConfig, ConvPolicy};
pub use runner::{ClosedLoopRunner, ReturnSummary, run_closed_loop, summarize};
pub use train::{EvalStats, TrainConfig, TrainStats, adam, evaluate, train_one_epoch};
