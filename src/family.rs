//! Model family classifier — maps a model id string to a coarse family
//! tag used everywhere for quota accounting and key routing.
//!
//! Grounded on the teacher's `pool::registry` (static per-model metadata
//! tables keyed by provider) and `pool::classifier` (ordered pattern
//! matching over free text) — here the patterns match model ids instead
//! of prompt text, and the output is a closed family enum instead of a
//! task-complexity tier.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The upstream service a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Service {
    OpenAi,
    Anthropic,
    Google,
    Aws,
    Mistral,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Service::OpenAi => "openai",
            Service::Anthropic => "anthropic",
            Service::Google => "google",
            Service::Aws => "aws",
            Service::Mistral => "mistral",
        };
        f.write_str(s)
    }
}

/// Closed enumeration of model families. Unit of quota and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelFamily {
    Turbo,
    Gpt4,
    Gpt4_32k,
    Gpt4Turbo,
    DallE,
    Claude,
    Bison,
    AwsClaude,
    MistralTiny,
    MistralSmall,
    MistralMedium,
    MistralLarge,
    /// Provider-specific catch-all for ids that match nothing known.
    /// Carries the provider tag so two unknown ids from different
    /// providers are never confused for the same family.
    Unknown(UnknownProvider),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnknownProvider {
    OpenAi,
    Anthropic,
    Google,
    Aws,
    Mistral,
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelFamily::Turbo => "turbo",
            ModelFamily::Gpt4 => "gpt4",
            ModelFamily::Gpt4_32k => "gpt4-32k",
            ModelFamily::Gpt4Turbo => "gpt4-turbo",
            ModelFamily::DallE => "dall-e",
            ModelFamily::Claude => "claude",
            ModelFamily::Bison => "bison",
            ModelFamily::AwsClaude => "aws-claude",
            ModelFamily::MistralTiny => "mistral-tiny",
            ModelFamily::MistralSmall => "mistral-small",
            ModelFamily::MistralMedium => "mistral-medium",
            ModelFamily::MistralLarge => "mistral-large",
            ModelFamily::Unknown(UnknownProvider::OpenAi) => "openai-unknown",
            ModelFamily::Unknown(UnknownProvider::Anthropic) => "anthropic-unknown",
            ModelFamily::Unknown(UnknownProvider::Google) => "google-unknown",
            ModelFamily::Unknown(UnknownProvider::Aws) => "aws-unknown",
            ModelFamily::Unknown(UnknownProvider::Mistral) => "mistral-unknown",
        };
        f.write_str(s)
    }
}

/// Inverse of `Display`, restricted to the closed, non-`Unknown`
/// variants — used to resolve configuration that names a family by its
/// wire string (e.g. `tokenQuota`'s map keys). Unrecognized strings
/// return `None` rather than guessing a provider's `Unknown` tag, since
/// there is no model id to classify here, only a bare family name.
pub fn parse_known(s: &str) -> Option<ModelFamily> {
    Some(match s {
        "turbo" => ModelFamily::Turbo,
        "gpt4" => ModelFamily::Gpt4,
        "gpt4-32k" => ModelFamily::Gpt4_32k,
        "gpt4-turbo" => ModelFamily::Gpt4Turbo,
        "dall-e" => ModelFamily::DallE,
        "claude" => ModelFamily::Claude,
        "bison" => ModelFamily::Bison,
        "aws-claude" => ModelFamily::AwsClaude,
        "mistral-tiny" => ModelFamily::MistralTiny,
        "mistral-small" => ModelFamily::MistralSmall,
        "mistral-medium" => ModelFamily::MistralMedium,
        "mistral-large" => ModelFamily::MistralLarge,
        _ => return None,
    })
}

/// Ordered `(pattern, family)` table for OpenAI — first match wins.
/// Order matters: `gpt-4-32k` must be checked before the bare `gpt-4`
/// pattern, and `gpt-4-turbo`/`gpt-4o` before the generic gpt4 catch-all.
static OPENAI_PATTERNS: Lazy<Vec<(Regex, ModelFamily)>> = Lazy::new(|| {
    vec![
        (Regex::new(r"^dall-e").unwrap(), ModelFamily::DallE),
        (
            Regex::new(r"^gpt-4-32k").unwrap(),
            ModelFamily::Gpt4_32k,
        ),
        (
            Regex::new(r"^gpt-4(-1106|-0125|-turbo|o)").unwrap(),
            ModelFamily::Gpt4Turbo,
        ),
        (Regex::new(r"^gpt-4").unwrap(), ModelFamily::Gpt4),
        (
            Regex::new(r"^(gpt-3\.5|turbo|text-davinci)").unwrap(),
            ModelFamily::Turbo,
        ),
    ]
});

static BISON_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\w+-bison-\d{3}$").unwrap());

/// Classify a model id for the given service. Pure function — no I/O,
/// no shared state beyond the read-only pattern tables above.
///
/// Unknown ids never fail classification: they fall through to a
/// provider-tagged `Unknown` family so routing and quota accounting
/// keep working (with a one-time warning logged by the caller), per
/// §4.1's "Unknown → provider default with a warning (never fatal)".
pub fn classify(service: Service, model_id: &str) -> ModelFamily {
    match service {
        Service::OpenAi => {
            for (pattern, family) in OPENAI_PATTERNS.iter() {
                if pattern.is_match(model_id) {
                    return *family;
                }
            }
            tracing::warn!(service = %service, model = model_id, "unrecognized OpenAI model id");
            ModelFamily::Unknown(UnknownProvider::OpenAi)
        }
        Service::Anthropic => {
            if model_id.starts_with("anthropic.") {
                ModelFamily::AwsClaude
            } else {
                ModelFamily::Claude
            }
        }
        Service::Google => {
            if BISON_PATTERN.is_match(model_id) {
                ModelFamily::Bison
            } else {
                tracing::warn!(service = %service, model = model_id, "unrecognized Google model id");
                ModelFamily::Unknown(UnknownProvider::Google)
            }
        }
        Service::Aws => ModelFamily::AwsClaude,
        Service::Mistral => match model_id {
            "mistral-tiny" => ModelFamily::MistralTiny,
            "mistral-small" => ModelFamily::MistralSmall,
            "mistral-medium" => ModelFamily::MistralMedium,
            "mistral-large" | "mistral-large-latest" => ModelFamily::MistralLarge,
            other => {
                tracing::warn!(service = %service, model = other, "unrecognized Mistral model id");
                ModelFamily::Unknown(UnknownProvider::Mistral)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_ordered_match_prefers_32k_over_gpt4() {
        assert_eq!(
            classify(Service::OpenAi, "gpt-4-32k-0613"),
            ModelFamily::Gpt4_32k
        );
        assert_eq!(classify(Service::OpenAi, "gpt-4-0613"), ModelFamily::Gpt4);
    }

    #[test]
    fn openai_turbo_instruct_maps_to_turbo() {
        assert_eq!(
            classify(Service::OpenAi, "gpt-3.5-turbo-instruct"),
            ModelFamily::Turbo
        );
    }

    #[test]
    fn openai_gpt4_turbo_variants() {
        assert_eq!(
            classify(Service::OpenAi, "gpt-4-1106-preview"),
            ModelFamily::Gpt4Turbo
        );
        assert_eq!(classify(Service::OpenAi, "gpt-4o"), ModelFamily::Gpt4Turbo);
    }

    #[test]
    fn openai_unknown_falls_back_with_provider_tag() {
        assert_eq!(
            classify(Service::OpenAi, "some-new-model"),
            ModelFamily::Unknown(UnknownProvider::OpenAi)
        );
    }

    #[test]
    fn anthropic_bedrock_prefix_routes_to_aws_claude() {
        assert_eq!(
            classify(Service::Anthropic, "anthropic.claude-v2"),
            ModelFamily::AwsClaude
        );
        assert_eq!(
            classify(Service::Anthropic, "claude-3-opus-20240229"),
            ModelFamily::Claude
        );
    }

    #[test]
    fn google_bison_pattern() {
        assert_eq!(classify(Service::Google, "chat-bison-001"), ModelFamily::Bison);
        assert_eq!(
            classify(Service::Google, "gemini-pro"),
            ModelFamily::Unknown(UnknownProvider::Google)
        );
    }

    #[test]
    fn aws_is_always_aws_claude() {
        assert_eq!(classify(Service::Aws, "anything"), ModelFamily::AwsClaude);
    }

    #[test]
    fn parse_known_round_trips_display_for_closed_variants() {
        for family in [
            ModelFamily::Turbo,
            ModelFamily::Gpt4,
            ModelFamily::Gpt4_32k,
            ModelFamily::Gpt4Turbo,
            ModelFamily::DallE,
            ModelFamily::Claude,
            ModelFamily::Bison,
            ModelFamily::AwsClaude,
            ModelFamily::MistralTiny,
            ModelFamily::MistralSmall,
            ModelFamily::MistralMedium,
            ModelFamily::MistralLarge,
        ] {
            assert_eq!(parse_known(&family.to_string()), Some(family));
        }
    }

    #[test]
    fn parse_known_rejects_unrecognized_and_unknown_strings() {
        assert_eq!(parse_known("not-a-family"), None);
        assert_eq!(parse_known("openai-unknown"), None);
    }

    #[test]
    fn mistral_table_lookup() {
        assert_eq!(
            classify(Service::Mistral, "mistral-large-latest"),
            ModelFamily::MistralLarge
        );
        assert_eq!(
            classify(Service::Mistral, "mistral-nope"),
            ModelFamily::Unknown(UnknownProvider::Mistral)
        );
    }
}
