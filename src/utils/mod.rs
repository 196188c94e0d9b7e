pub mod privilege;
pub mod scheduler;
