pub mod clock;
pub mod daemon;
pub mod policy;

pub use clock::{Clock, ManualClock, SystemClock};
pub use daemon::{Autopump, PumpKicker, PumpState, TickReport};
pub use policy::{RandomSource, SeededRandom, ThreadRandom};
