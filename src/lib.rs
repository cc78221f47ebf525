//! Mask Write Register master and process-image serving slave for Modbus.

pub mod cli;
pub mod connection;
pub mod error;
pub mod logging;
pub mod mask_write;
pub mod process_image;
pub mod responder;
pub mod transaction;
