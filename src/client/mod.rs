//! Client half of the engine
//!
//! - `source`: reconnecting [`EventSource`] that pushes events to listeners
//! - `listener`: closure-based listeners and their registry
//! - `input`: pull-based [`EventInput`] for one-shot reads

mod connect;
pub mod input;
pub mod listener;
pub mod source;

pub use input::EventInput;
pub use listener::{Listener, ListenerId, ListenerRegistry};
pub use source::{EventSource, EventSourceConfig, ReadyState, DEFAULT_READ_TIMEOUT, DEFAULT_RECONNECT_DELAY};
