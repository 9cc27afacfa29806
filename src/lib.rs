pub mod bridge;
pub mod cli;
pub mod domains;
pub mod infrastructure;
pub mod services;
