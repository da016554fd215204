/// Model catalog: canonical ids, per-model output ceilings, context windows,
/// and the normalization table for long/vendor-prefixed aliases.

use once_cell::sync::Lazy;
use serde::Serialize;

pub const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: &'static str,
    /// Upstream provider family this model belongs to.
    pub provider: &'static str,
    /// Per-model ceiling for `max_tokens`.
    pub max_tokens: u32,
    pub context_window: u32,
    /// Minimum session account type able to serve this model.
    pub requires_pro_account: bool,
    #[serde(skip)]
    pub aliases: &'static [&'static str],
}

static MODEL_CATALOG: Lazy<Vec<ModelInfo>> = Lazy::new(|| {
    vec![
        ModelInfo {
            id: "gpt-4o",
            provider: "openai",
            max_tokens: 16384,
            context_window: 128_000,
            requires_pro_account: false,
            aliases: &["openai/gpt-4o", "gpt-4o-2024-11-20"],
        },
        ModelInfo {
            id: "gpt-4o-mini",
            provider: "openai",
            max_tokens: 16384,
            context_window: 128_000,
            requires_pro_account: false,
            aliases: &["openai/gpt-4o-mini", "gpt-4o-mini-2024-07-18"],
        },
        ModelInfo {
            id: "gpt-4-turbo",
            provider: "openai",
            max_tokens: 4096,
            context_window: 128_000,
            requires_pro_account: false,
            aliases: &["openai/gpt-4-turbo", "gpt-4-turbo-2024-04-09"],
        },
        ModelInfo {
            id: "claude-4-sonnet",
            provider: "anthropic",
            max_tokens: 64_000,
            context_window: 200_000,
            requires_pro_account: false,
            aliases: &[
                "anthropic/claude-4-sonnet",
                "claude-sonnet-4",
                "claude-sonnet-4-20250514",
            ],
        },
        ModelInfo {
            id: "claude-4-opus",
            provider: "anthropic",
            max_tokens: 32_000,
            context_window: 200_000,
            requires_pro_account: true,
            aliases: &[
                "anthropic/claude-4-opus",
                "claude-opus-4",
                "claude-opus-4-20250514",
            ],
        },
        ModelInfo {
            id: "claude-3-5-sonnet",
            provider: "anthropic",
            max_tokens: 8192,
            context_window: 200_000,
            requires_pro_account: false,
            aliases: &[
                "anthropic/claude-3-5-sonnet",
                "claude-3-5-sonnet-20241022",
                "claude-3-5-sonnet-latest",
            ],
        },
        ModelInfo {
            id: "claude-3-5-haiku",
            provider: "anthropic",
            max_tokens: 8192,
            context_window: 200_000,
            requires_pro_account: false,
            aliases: &[
                "anthropic/claude-3-5-haiku",
                "claude-3-5-haiku-20241022",
                "claude-3-5-haiku-latest",
            ],
        },
    ]
});

/// Resolves a caller-supplied model id (canonical or alias) to its catalog
/// entry. Returns `None` for unrecognized ids; callers map that to
/// `invalid_model`.
pub fn find_model(model: &str) -> Option<&'static ModelInfo> {
    let model = model.trim();
    MODEL_CATALOG
        .iter()
        .find(|info| info.id == model || info.aliases.contains(&model))
}

/// Canonical short id for a caller-supplied model, if recognized.
pub fn normalize_model(model: &str) -> Option<&'static str> {
    find_model(model).map(|info| info.id)
}

pub fn list_models() -> &'static [ModelInfo] {
    &MODEL_CATALOG
}

/// Applies the default / per-model ceiling rules: absent or zero becomes the
/// model default (or the ceiling if the default exceeds it), oversized values
/// are clamped.
pub fn clamp_max_tokens(info: &ModelInfo, requested: Option<u32>) -> u32 {
    match requested {
        None | Some(0) => DEFAULT_MAX_TOKENS.min(info.max_tokens),
        Some(n) => n.min(info.max_tokens),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_normalize_to_canonical_ids() {
        assert_eq!(normalize_model("claude-sonnet-4-20250514"), Some("claude-4-sonnet"));
        assert_eq!(normalize_model("openai/gpt-4o"), Some("gpt-4o"));
        assert_eq!(normalize_model("gpt-4o"), Some("gpt-4o"));
        assert_eq!(normalize_model("gpt-5-ultra"), None);
    }

    #[test]
    fn max_tokens_defaults_and_clamps() {
        let info = find_model("gpt-4o").unwrap();
        assert_eq!(clamp_max_tokens(info, None), 4096);
        assert_eq!(clamp_max_tokens(info, Some(0)), 4096);
        assert_eq!(clamp_max_tokens(info, Some(999_999)), info.max_tokens);
        assert_eq!(clamp_max_tokens(info, Some(1024)), 1024);
    }

    #[test]
    fn default_never_exceeds_a_small_ceiling() {
        let tight = ModelInfo {
            id: "tiny",
            provider: "openai",
            max_tokens: 2048,
            context_window: 8192,
            requires_pro_account: false,
            aliases: &[],
        };
        assert_eq!(clamp_max_tokens(&tight, None), 2048);
    }
}
