pub mod duck;
pub mod fetch;
pub mod pipeline;
pub mod process;
pub mod verify;
