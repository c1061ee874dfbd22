use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}

impl CoreError {
    pub fn unknown(kind: &'static str, value: impl Into<String>) -> Self {
        Self::UnknownVariant {
            kind,
            value: value.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
