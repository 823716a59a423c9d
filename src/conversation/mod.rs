pub mod driver;
pub mod transcript;

pub use driver::{ConversationDriver, ConversationPolicy, ConversationState, DriverEvent, Opening};
pub use transcript::{SessionOutcome, Speaker, Transcript, TranscriptError, Turn};
