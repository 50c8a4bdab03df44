mod recorder_error;

pub use recorder_error::RecorderError;
pub type Result<T> = std::result::Result<T, RecorderError>;
