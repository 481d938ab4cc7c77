pub mod bluetooth;
pub mod configuration;
pub mod error;
pub mod log;
pub mod network;
pub mod obex;
pub mod operation;
pub mod session;

pub use configuration::Conf;
pub use error::{DecodeError, Error, Result};
pub use session::Session;
