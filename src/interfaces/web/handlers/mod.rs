pub mod admin;
pub mod health;
pub mod runs;
pub mod tools;
