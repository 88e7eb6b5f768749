pub mod battle;
pub mod clan;
pub mod elo;
pub mod problem;
pub mod protocol;
pub mod selection;
pub mod verdict;

pub use battle::{BattleKind, BattleStatus, QueueStatus};
pub use problem::{Problem, ProblemKey, Submission};
pub use protocol::{ClientMessage, ServerMessage};
pub use verdict::Verdict;
