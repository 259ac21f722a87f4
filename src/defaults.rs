//! Default configuration constants for parley.
//!
//! Shared by the config file sections, the task parameters and the
//! demo binary so every entry point starts from the same values.

/// Default audio sample rate in Hz.
pub const SAMPLE_RATE: u32 = 16000;

/// Capacity of each bounded data queue between two stages.
///
/// When a downstream queue is full the upstream stage's emission waits.
/// Priority control frames never count against this capacity.
pub const QUEUE_CAPACITY: usize = 64;

/// Capacity of the transport ingress queue feeding the first stage.
pub const INGRESS_CAPACITY: usize = 256;

/// Default timeout for a single backend await (one recognition call, one
/// generated token, one synthesized chunk), in milliseconds.
pub const BACKEND_TIMEOUT_MS: u64 = 10_000;

/// How long a cancelled task waits for its stages to release resources
/// before force-dropping them, in milliseconds.
pub const CANCEL_GRACE_MS: u64 = 500;

/// Word count that lets the user interrupt the assistant.
pub const MIN_WORDS: usize = 3;

/// User silence after which accumulated interruption evidence is forgotten,
/// in milliseconds.
pub const SILENCE_RESET_MS: u64 = 1500;

/// RMS energy (0.0 to 1.0) above which a user audio frame counts as voiced
/// for the voice-activity interruption policy.
pub const VOICE_ENERGY_THRESHOLD: f32 = 0.02;

/// Consecutive voiced frames required by the voice-activity policy.
pub const VOICE_MIN_FRAMES: usize = 5;

/// System prompt seeded into every new conversation.
pub const SYSTEM_PROMPT: &str = "You are a helpful assistant in a live voice call. \
Show what you can do briefly. Your replies are spoken aloud, so avoid special \
characters and markdown. Answer what the user said in a creative and helpful way.";

/// System message appended when a client connects, so the assistant speaks first.
pub const GREETING: &str = "Please introduce yourself to the user.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_rate_is_speech_rate() {
        assert_eq!(SAMPLE_RATE, 16000);
    }

    #[test]
    fn test_min_words_default() {
        assert_eq!(MIN_WORDS, 3);
    }

    #[test]
    fn test_voice_energy_threshold_in_range() {
        assert!(VOICE_ENERGY_THRESHOLD > 0.0 && VOICE_ENERGY_THRESHOLD < 1.0);
    }

    #[test]
    fn test_ingress_holds_at_least_one_queue() {
        assert!(INGRESS_CAPACITY >= QUEUE_CAPACITY);
    }
}
