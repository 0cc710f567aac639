pub mod command;
pub mod process;
pub mod protocol;
pub mod supervisor;

pub use command::{API_KEY_ENV, LaunchPlan, build_launch_plan, resolve_executable};
pub use process::{
    AssistantEvent, ProcessExit, ProcessInfo, ProcessStatus, ShutdownOutcome, TurnReply,
};
pub use protocol::{InputFormat, StreamMessage, TurnOutcome, TurnResult, encode_user_message};
pub use supervisor::{AssistantEvents, AssistantSupervisor, StartRequest, StopAllReport};
