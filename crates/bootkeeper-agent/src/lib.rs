pub mod broadcaster;
pub mod config;
pub mod error;
pub mod output_buffer;
mod output_pump;
pub mod process_handle;
mod sequencer;
pub mod slots;
pub mod supervisor;

pub use broadcaster::{Broadcaster, Subscription};
pub use config::SupervisorConfig;
pub use error::SupervisorError;
pub use slots::{SlotRegistry, SlotSpec};
pub use supervisor::Supervisor;
