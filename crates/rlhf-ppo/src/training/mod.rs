//! PPO training: configuration, the training loop and its bookkeeping.

mod config;
mod context;
mod meter;
mod optimizer;
mod reward;
mod state;
mod trainer;

pub use config::PpoTrainerConfig;
pub use context::{ProcessContext, SingleProcess, StaticRank};
pub use meter::AverageMeter;
pub use optimizer::{PolicyOptimizer, StepStats, LEARNING_RATE_KEY, LOSS_TOTAL_KEY};
pub use reward::{compute_rewards, last_position_values};
pub use state::{LogRecord, TrainerState, TRAINER_STATE_NAME};
pub use trainer::{max_steps, steps_per_epoch, PpoTrainer};
