mod recorder_config;

pub use recorder_config::RecorderConfig;
