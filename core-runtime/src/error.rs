use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or inconsistent configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A bridge was not injected and the build has no default for it.
    #[error("Capability missing: {capability} - {message}")]
    CapabilityMissing { capability: String, message: String },

    /// A default bridge could not be constructed.
    #[error("Bridge initialization failed: {0}")]
    BridgeInit(String),
}

pub type Result<T> = std::result::Result<T, Error>;
