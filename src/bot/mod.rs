/// Command and dialogue handlers
pub mod handlers;
/// Retrying wrappers around Telegram send and edit calls
pub mod resilient;
/// Dialogue state for the provisioning flow
pub mod state;
