//! Tag policy

pub const DEFAULT_TAG: &str = "latest";

/// Tags to push, in push order.
///
/// Explicit tags are used verbatim, duplicates included. Without any, pushes to the
/// built-in registry also get a `{branch}-{commit}` tag.
pub fn build_tags(explicit: &[String], builtin_registry: bool, branch: &str, commit: &str) -> Vec<String> {
    if !explicit.is_empty() {
        return explicit.to_vec();
    }
    if builtin_registry {
        vec![DEFAULT_TAG.to_string(), format!("{}-{}", branch, commit)]
    } else {
        vec![DEFAULT_TAG.to_string()]
    }
}
