mod collector;
mod models;
mod store;

pub use collector::Collector;
pub use models::*;
pub use store::*;
