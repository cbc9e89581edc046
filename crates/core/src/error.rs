use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid config value for {key}: {message}")]
    Config { key: &'static str, message: String },
}

impl CoreError {
    pub fn config(key: &'static str, message: impl Into<String>) -> Self {
        Self::Config {
            key,
            message: message.into(),
        }
    }
}
