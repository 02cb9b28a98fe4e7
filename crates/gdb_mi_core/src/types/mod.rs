mod record;
mod responses;

pub use record::{ExecState, Message, NamedValue, Nature, Record, Value};
pub use responses::{FrameInfo, FrameVariables, Response, ThreadInfo, ThreadSnapshot};
