pub mod bus;
pub mod protocol;

pub use bus::{run_event_writer, EventBus};
pub use protocol::{classify, run_protocol_writer, ProtocolRecorder};
