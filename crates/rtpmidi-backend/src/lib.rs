//! RTP-MIDI / AppleMIDI network backend.
//!
//! A [`Backend`] owns a set of named instances. Each instance speaks
//! RTP-MIDI either directly with a fixed set of peers (`direct` mode) or
//! through negotiated AppleMIDI sessions (`apple` mode). Protocol state lives
//! in a sans-I/O [`Instance`]; the backend drains non-blocking sockets into
//! it once per dispatch cycle and flushes whatever it queued.

pub mod backend;
pub mod config;
pub mod discovery;
pub mod error;
pub mod instance;
pub mod peers;
pub mod session;
pub mod socket;

pub use backend::{Backend, EventSink, InstanceId};
pub use config::{GlobalConfig, InstanceConfig, Mode};
pub use error::{BackendError, ConfigError, InstanceFailure};
pub use instance::{ChannelEvent, Instance, Outgoing};
pub use session::{Port, SessionState, SessionTiming};
