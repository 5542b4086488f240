use thiserror::Error;

/// All errors produced by repeater-core.
#[derive(Debug, Error)]
pub enum RepeaterError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("audio device disconnected: {0}")]
    DeviceDisconnected(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("cannot switch mode to {target} while the engine is running")]
    ModeSwitchWhileRunning { target: crate::engine::RepeaterMode },

    #[error("WAV input error: {0}")]
    Wav(#[from] hound::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RepeaterError {
    /// Device-class failures end the affected loop but never the process.
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            RepeaterError::AudioDevice(_)
                | RepeaterError::AudioStream(_)
                | RepeaterError::NoDefaultInputDevice
                | RepeaterError::NoDefaultOutputDevice
                | RepeaterError::DeviceDisconnected(_)
        )
    }

    /// Rejections that leave the engine exactly as it was.
    pub fn is_state_violation(&self) -> bool {
        matches!(
            self,
            RepeaterError::AlreadyRunning
                | RepeaterError::NotRunning
                | RepeaterError::ModeSwitchWhileRunning { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RepeaterError>;
