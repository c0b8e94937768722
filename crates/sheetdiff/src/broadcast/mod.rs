//! Broadcasting for real-time event streaming.

pub mod stage_events;

pub use stage_events::{StageEvent, StageEventBroadcaster, StageEventKind};
