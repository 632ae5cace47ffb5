// FreEstream Services
// Relay supervision and the plumbing around it

mod events;
mod encoding_args;
mod platform_registry;
mod ffmpeg_process;
pub mod ffmpeg_locator;
mod secrets;
mod settings_manager;
mod connection_tester;
mod ffmpeg_handler;
mod ingest;
mod stream_monitor;

#[cfg(test)]
mod test_support;

pub use events::*;
pub use encoding_args::*;
pub use platform_registry::*;
pub use ffmpeg_locator::AvailableEncoders;
pub use secrets::*;
pub use settings_manager::*;
pub use connection_tester::*;
pub use ffmpeg_handler::*;
pub use ingest::*;
pub use stream_monitor::*;
