mod bridge;
mod sse;

pub use bridge::{PushEvent, RealtimeBridge, StreamConfig};
pub use sse::{SseDecoder, SseEvent};
