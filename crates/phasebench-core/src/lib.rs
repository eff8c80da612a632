pub mod category;
pub mod config;
pub mod pool;
pub mod probe;
pub mod report;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod worker;

pub use category::*;
pub use config::*;
pub use pool::*;
pub use probe::*;
pub use report::*;
pub use scheduler::*;
pub use store::*;
pub use worker::*;
