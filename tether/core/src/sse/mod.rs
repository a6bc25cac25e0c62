//! Server-Sent Events
//!
//! Turns a raw byte stream into [`StreamEvent`]s and decodes their JSON
//! payloads. No knowledge of networking or app lifecycle lives here.
//!
//! # Example
//!
//! ```
//! use tether_core::sse::{decode_payload, EventParser, ParserConfig};
//! use tokio::sync::mpsc;
//!
//! let (tx, mut rx) = mpsc::unbounded_channel();
//! let mut parser = EventParser::new(ParserConfig::default(), tx);
//! parser.feed(": keep-alive\ndata: {\"content\":\"Hi\"}\n\n");
//!
//! let event = rx.try_recv().unwrap();
//! assert_eq!(decode_payload(&event.data).unwrap().content(), Some("Hi"));
//! ```

mod event;
mod parser;
mod payload;

pub use event::{StreamEvent, DONE_SENTINEL};
pub use parser::{EventParser, EventSink, ParserConfig, ParserStats, StaleConnection};
pub use payload::{decode_payload, Payload};
