pub mod capturer;
pub mod encoders;
pub mod error;
pub mod frame;
pub mod scheduler;
pub mod session;
