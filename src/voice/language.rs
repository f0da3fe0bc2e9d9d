//! Voice selection by detected language
//!
//! Aura-2 voice names are language-specific, so text written in a supported
//! non-English language is spoken with a fixed per-language voice instead of
//! the user's selection.

use whatlang::Lang;

/// Default voice when nothing else is configured
pub const DEFAULT_VOICE: &str = "aura-2-thalia-en";

/// Per-language voice overrides
const LANGUAGE_VOICES: &[(Lang, &str)] = &[
    (Lang::Fra, "aura-2-agathe-fr"),
    (Lang::Spa, "aura-2-agustina-es"),
    (Lang::Jpn, "aura-2-ama-ja"),
    (Lang::Deu, "aura-2-aurelia-de"),
    (Lang::Nld, "aura-2-beatrix-nl"),
    (Lang::Ita, "aura-2-cesare-it"),
];

/// Voice override for a language, if one exists
#[must_use]
pub fn voice_for_language(lang: Lang) -> Option<&'static str> {
    LANGUAGE_VOICES
        .iter()
        .find(|(l, _)| *l == lang)
        .map(|(_, voice)| *voice)
}

/// Pick the voice for `text`
///
/// Uses `selected` unless the dominant language is a supported non-English
/// one. Short phrases rarely reach whatlang's reliability bar, so the best
/// guess is taken as is.
#[must_use]
pub fn resolve_voice(text: &str, selected: &str) -> String {
    let Some(info) = whatlang::detect(text) else {
        return selected.to_string();
    };

    if info.lang() == Lang::Eng {
        return selected.to_string();
    }

    voice_for_language(info.lang()).map_or_else(
        || selected.to_string(),
        |voice| {
            tracing::info!(
                language = info.lang().code(),
                confidence = info.confidence(),
                voice,
                "detected language, overriding voice"
            );
            voice.to_string()
        },
    )
}
