// Error types for the Flick JNI library

use flick_core::{EngineError, FlickError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("JNI error: {0}")]
    Jni(#[from] jni::errors::Error),

    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error("{0}")]
    Flick(#[from] FlickError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, Error>;
