mod global;
mod schedule;
mod server;

pub use global::*;
pub use schedule::*;
pub use server::*;
