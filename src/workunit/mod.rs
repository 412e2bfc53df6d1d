mod result;
mod state;
mod wu;

pub use result::{ResultStatus, WuResult};
pub use state::{IllegalTransition, StateMachine, WuEvent, WuState};
pub use wu::{make_wu_name, validate_identifier, CorrelationId, InputFile, TransferMode, WorkUnit};
