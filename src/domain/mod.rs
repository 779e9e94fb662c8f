pub mod agent;
pub mod error;
pub mod message;
pub mod run;
pub mod session;

pub use agent::AgentSpec;
pub use error::BridgeError;
pub use message::{ContentBlock, Message, Role};
pub use run::{Run, RunError, RunMode, RunStatus, TurnContent, UpdateEvent};
pub use session::{Session, SessionStatus};
