use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("Join a voice channel first")]
    MissingVoiceChannel,

    #[error("Video not found: {0}")]
    VideoNotFound(String),

    #[error("Acquisition failed: {0}")]
    AcquisitionFailed(String),

    #[error("Transport failed: {0}")]
    TransportFailed(String),

    #[error("Index {index} is out of range (queue has {len} items)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("This command only works in a guild")]
    UnresolvableGuild,

    #[error("Failed to join voice channel: {0}")]
    JoinFailed(String),

    #[error("Nothing is playing")]
    NothingPlaying,

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PlaybackResult<T> = Result<T, PlaybackError>;
