pub mod config;
pub mod error;
pub mod event;
pub mod policy;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{ErrorKind, MarshalError, Result};
pub use event::{EventBus, EventSink};
pub use types::*;
