pub mod display;
pub mod frame;
pub mod ipc;
