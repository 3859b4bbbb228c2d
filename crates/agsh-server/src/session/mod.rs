//! Session engine: PTY lifecycle, replay buffer, output fan-out, reaping.

pub mod hub;
pub mod pty;
pub mod reaper;
pub mod registry;
pub mod ring_buffer;

pub use hub::{BroadcastHub, SessionEvent, Subscription};
pub use pty::PtyProcess;
pub use reaper::IdleReaper;
pub use registry::{CreateParams, Session, SessionLimits, SessionRegistry, SpawnSpec};
pub use ring_buffer::RingBuffer;
