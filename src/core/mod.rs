pub mod error;
pub mod lifecycle;
pub mod model;
pub mod orchestrator;
pub mod store;
pub mod terminal;
pub mod tools;
