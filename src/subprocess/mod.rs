pub mod cancel;
pub mod command;
pub mod ephemeral;
pub mod error;
pub mod failure;
pub mod mock;
pub mod serializer;
pub mod split;
pub mod stderr;
pub mod streaming;
pub mod worker;

#[cfg(test)]
mod tests;

pub use cancel::{classify_failure, kill_process_tree, kill_process_tree_off_runtime, CancelHook};
pub use command::{encode_request, ToolCommand, ToolCommandBuilder};
pub use ephemeral::{EphemeralRunner, LineResponder, RunOptions};
pub use error::ProcessError;
pub use failure::{translate, ExitStatus, StructuredFailure};
pub use mock::{FakeReply, MockEvent, MockWorkerLauncher};
pub use serializer::{CommandQueue, CommandSerializer, PendingCommand, RestartHook};
pub use split::{Record, RecordReader, SeparatorSet, StreamSplitter};
pub use streaming::{EventStream, StreamOptions, StreamingEventReader};
pub use worker::{
    ResponseAccumulator, ToolWorkerLauncher, WorkerChannel, WorkerEvent, WorkerLauncher,
    WorkerProcess, WorkerSettings, WorkerState,
};
