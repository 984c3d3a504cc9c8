use thiserror::Error;

use crate::case::Location;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("duplicate fixture '{name}' registered at {location}")]
    DuplicateFixture { name: String, location: Location },

    #[error("unknown fixture '{name}'")]
    NoSuchFixture { name: String },

    #[error("fixture '{name}': {detail}")]
    ScopeMismatch { name: String, detail: String },

    #[error("fixture dependency cycle: {}", path.join(" -> "))]
    FixtureCycle { path: Vec<String> },

    #[error("fixture '{name}' yielded more than once")]
    FixtureDoubleYield { name: String },

    #[error("focused tests are forbidden: {0}")]
    ForbidOnly(String),

    #[error("no tests matched the current filters")]
    NoTests,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
