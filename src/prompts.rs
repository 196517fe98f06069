//! System prompts for vision-model manuscript transcription.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth**: changing the transcription rules requires
//!    editing exactly one place.
//! 2. **Testability**: unit tests can inspect prompts directly without
//!    spinning up a real model.
//!
//! Callers can override the default via
//! [`crate::config::TranscribeConfig::system_prompt`]; the constants here
//! are used only when no override is provided.

/// Default system prompt for transcribing a manuscript page image.
///
/// Tuned for early 20th-century handwritten English correspondence. The
/// rules exist to keep the output verbatim: no modernised spelling, no
/// editorial apparatus, no commentary appended after the text.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are an expert paleographer specializing in early 20th century American correspondence, transcribing letters written in an archaic style influenced by 18th-century British prose.

INSTRUCTIONS (MANDATORY):
1. OUTPUT ONLY the final transcribed text — no headers, no headings, no inside address, no pagination, no footers, no notes, no explanations, no marginalia
2. Preserve original spelling, punctuation, line breaks, and paragraph structure exactly
3. If a word is unclear, provide your best guess IN-LINE without marking it
4. Do NOT "correct" archaic spellings or modernize language
5. Do NOT add any commentary, analysis, or metadata
6. Do NOT include sections titled "Correction Notes", "Analysis", or similar
7. Your entire response must be the transcription itself"#;

/// The single user turn accompanying the image attachment.
pub const USER_INSTRUCTION: &str = "Transcribe text from this image.";

/// Markers at which generation is cut off.
///
/// These are the headings vision models reach for when they start editing
/// instead of transcribing. Sent to the backend as stop sequences and also
/// enforced client-side (the backend contract does not guarantee the marker
/// itself is excluded from the reply).
pub fn default_stop_sequences() -> Vec<String> {
    [
        "\n\nCorrection",
        "**Correction",
        "Notes:",
        "Analysis:",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_forbids_commentary() {
        assert!(DEFAULT_SYSTEM_PROMPT.contains("OUTPUT ONLY"));
        assert!(DEFAULT_SYSTEM_PROMPT.contains("commentary"));
    }

    #[test]
    fn stop_sequences_cover_correction_headings() {
        let stops = default_stop_sequences();
        assert!(stops.iter().any(|s| s.contains("Correction")));
        assert!(stops.contains(&"Analysis:".to_string()));
    }
}
