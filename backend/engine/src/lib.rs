pub mod arith;
pub mod calculator;
pub mod clock;
pub mod config;
pub mod error;
pub mod lp;
pub mod orchestrator;
pub mod packer;
pub mod size_oracle;
pub mod solver;
pub mod stages;
pub mod utxo;

pub use calculator::{Calculator, ClaimDraft, ContributionInput, DistributionOutcome, DistributionPlan};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use lp::{LoggingLpBootstrap, LpBootstrap};
pub use orchestrator::Orchestrator;
pub use packer::{MultiplierPacker, PackedEntry, Packing};
pub use size_oracle::{SizeEstimate, SizeOracle};
pub use solver::{Batch, BatchPlan, BatchSolver};
pub use utxo::{UtxoSelection, UtxoSelector};
