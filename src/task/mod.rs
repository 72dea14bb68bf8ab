pub mod graph;
pub mod history;
pub mod idle;
pub mod manager;
pub mod schedule;
pub mod sink;
pub mod types;


pub use graph::*;
pub use history::*;
pub use idle::*;
pub use manager::*;
pub use sink::*;
pub use types::*;
