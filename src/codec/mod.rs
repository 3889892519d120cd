//! Wire codec for `text/event-stream`
//!
//! ```text
//! : comment
//! event: update
//! id: 7
//! retry: 3000
//! data: first line
//! data: second line
//! <blank line>
//! ```
//!
//! - `encoder`: outbound event -> framed bytes (server side)
//! - `parser`: byte chunks -> inbound events (client side)

pub mod encoder;
pub mod parser;

pub use encoder::{encode, encode_with};
pub use parser::{EventParser, Events, ParserState};
