//! Model alias resolution.

use crate::openai::{ModelInfo, ModelList};

/// Short aliases accepted in the `model` field and the concrete agent model
/// ids they stand for.
pub const MODEL_ALIASES: [(&str, &str); 3] = [
    ("opus", "claude-opus-4-1-20250805"),
    ("sonnet", "claude-sonnet-4-5-20250929"),
    ("haiku", "claude-3-5-haiku-20241022"),
];

/// Resolve the requested model id.
///
/// Aliases map to their concrete id, unknown ids pass through verbatim, and
/// an absent (or blank) id falls back to `default_model`, which is itself
/// alias-resolved.
pub fn resolve_model(requested: Option<&str>, default_model: &str) -> String {
    let requested = requested.map(str::trim).filter(|m| !m.is_empty());
    let id = requested.unwrap_or(default_model);
    resolve_alias(id).to_string()
}

fn resolve_alias(id: &str) -> &str {
    MODEL_ALIASES
        .iter()
        .find(|(alias, _)| alias.eq_ignore_ascii_case(id))
        .map(|(_, concrete)| *concrete)
        .unwrap_or(id)
}

/// Model listing advertised on `/v1/models`: every alias and concrete id.
pub fn model_list() -> ModelList {
    let created = chrono::Utc::now().timestamp();
    let data = MODEL_ALIASES
        .iter()
        .flat_map(|(alias, concrete)| [*alias, *concrete])
        .map(|id| ModelInfo {
            id: id.to_string(),
            object: "model".to_string(),
            created,
            owned_by: "anthropic".to_string(),
        })
        .collect();

    ModelList {
        object: "list".to_string(),
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliases_resolve() {
        assert_eq!(resolve_model(Some("opus"), "sonnet"), "claude-opus-4-1-20250805");
        assert_eq!(resolve_model(Some("Haiku"), "sonnet"), "claude-3-5-haiku-20241022");
    }

    #[test]
    fn test_unknown_model_passes_through() {
        assert_eq!(resolve_model(Some("my-custom-model"), "sonnet"), "my-custom-model");
    }

    #[test]
    fn test_absent_model_uses_default() {
        assert_eq!(resolve_model(None, "sonnet"), "claude-sonnet-4-5-20250929");
        assert_eq!(resolve_model(Some("  "), "explicit-id"), "explicit-id");
    }

    #[test]
    fn test_model_list_contains_aliases_and_ids() {
        let list = model_list();
        assert_eq!(list.data.len(), 6);
        assert!(list.data.iter().any(|m| m.id == "sonnet"));
        assert!(list.data.iter().any(|m| m.id == "claude-opus-4-1-20250805"));
    }
}
