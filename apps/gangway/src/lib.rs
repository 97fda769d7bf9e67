pub mod config;
pub mod control;
pub mod layout;
pub mod logging;
pub mod messenger;
pub mod observer;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod transport;
