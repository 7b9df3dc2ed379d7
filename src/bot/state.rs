use serde::{Deserialize, Serialize};

/// Represents the current step of the provisioning dialogue
#[derive(Clone, Serialize, Deserialize, Default)]
pub enum State {
    /// No provisioning in progress
    #[default]
    Idle,
    /// Waiting for the user to send a username
    AwaitingUsername,
    /// Waiting for the user to send a password for the reserved username
    AwaitingPassword {
        /// The username candidate confirmed free on the panel side
        username: String,
    },
}
