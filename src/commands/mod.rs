// FreEstream Commands
// Handlers a host (IPC bridge, HTTP layer) calls into

mod invoke;
mod stream;
mod system;

pub use invoke::*;
pub use stream::*;
pub use system::*;
