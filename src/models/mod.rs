// FreEstream Models
// Data structures for the application

mod settings;
mod destination;
mod stream_stats;
mod status;

pub use settings::*;
pub use destination::*;
pub use stream_stats::*;
pub use status::*;
