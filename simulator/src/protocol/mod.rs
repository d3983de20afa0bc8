pub mod messages;
pub mod reader;
pub mod writer;

pub use messages::{
    call_me_later_types, kill_types, ExecuteJobCommand, IoOverlay, KillRequest, MetricKind,
    SchedulerCommand, SchedulerReply, TimedCommand,
};
pub use reader::JsonProtocolReader;
pub use writer::JsonProtocolWriter;
