//! Voice-channel video/audio playback for Discord guilds: one active stream
//! per guild, a FIFO queue behind it, background prefetch of the next item
//! and cancellation that reaches through download and transport.

pub mod cancel;
pub mod config;
pub mod error;
pub mod ffmpeg;
pub mod guild_state;
pub mod library;
pub mod media;
pub mod music;
pub mod orchestrator;
pub mod prefetch;
pub mod queue;
pub mod voice;
pub mod ytdlp;

pub use error::{PlaybackError, PlaybackResult};
pub use orchestrator::{Admission, Collaborators, PlayRequest, PlaybackOrchestrator, PlaybackSettings};
