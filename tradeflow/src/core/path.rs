//! Dotted-path lookups into JSON values (`option_chain.atm.strike`, `expiries.0`).

use serde_json::{Map, Value};

/// Path that addresses the whole value rather than a field inside it.
pub const WHOLE_VALUE: &str = "$";

/// Resolve `path` inside `root`.
///
/// Segments are separated by `.`; numeric segments index into arrays. `null`
/// values count as missing so a tool that "produced nothing" never satisfies a
/// dependency.
pub fn resolve<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() || path == WHOLE_VALUE {
        return non_null(root);
    }
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    non_null(current)
}

/// Resolve `path` where the first segment is a key of `map`.
pub fn resolve_in<'a>(map: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let value = map.get(head)?;
    match rest {
        Some(rest) => resolve(value, rest),
        None => non_null(value),
    }
}

/// True if `path` is syntactically usable (no empty segments).
pub fn is_valid_path(path: &str) -> bool {
    let path = path.trim();
    path == WHOLE_VALUE || (!path.is_empty() && path.split('.').all(|seg| !seg.is_empty()))
}

/// True if `path` can address a context key. The context is looked up key
/// first, so the whole-value path `$` never resolves there.
pub fn is_valid_context_path(path: &str) -> bool {
    path.trim() != WHOLE_VALUE && is_valid_path(path)
}

fn non_null(value: &Value) -> Option<&Value> {
    if value.is_null() { None } else { Some(value) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_nested_objects_and_arrays() {
        let value = json!({"chain": {"strikes": [{"strike": 22000}, {"strike": 22100}]}});
        assert_eq!(
            resolve(&value, "chain.strikes.1.strike"),
            Some(&json!(22100))
        );
        assert_eq!(resolve(&value, "chain.strikes.9"), None);
        assert_eq!(resolve(&value, "chain.missing"), None);
    }

    #[test]
    fn whole_value_path_returns_root() {
        let value = json!({"a": 1});
        assert_eq!(resolve(&value, WHOLE_VALUE), Some(&value));
        assert_eq!(resolve(&value, ""), Some(&value));
    }

    #[test]
    fn null_counts_as_missing() {
        let map = json!({"trend": null, "plan": {"entry": null}})
            .as_object()
            .cloned()
            .expect("object");
        assert_eq!(resolve_in(&map, "trend"), None);
        assert_eq!(resolve_in(&map, "plan.entry"), None);
        assert!(resolve_in(&map, "plan").is_some());
    }

    #[test]
    fn rejects_empty_segments() {
        assert!(is_valid_path("instrument.symbol"));
        assert!(is_valid_path("$"));
        assert!(!is_valid_path("instrument..symbol"));
        assert!(!is_valid_path(""));
    }

    #[test]
    fn context_paths_need_a_leading_key() {
        let map = json!({"expiry": "2024-06-27"}).as_object().cloned().expect("object");
        assert_eq!(resolve_in(&map, WHOLE_VALUE), None);
        assert!(!is_valid_context_path(WHOLE_VALUE));
        assert!(!is_valid_context_path(" $ "));
        assert!(is_valid_context_path("expiry"));
        assert!(!is_valid_context_path("plan..entry"));
    }
}
