//! Dot-path flat rows to nested objects.

use serde_json::{Map as JsonMap, Value as JsonValue};

/// Converts dot-path-keyed objects into nested objects, recursing into lists
/// element-wise. Keys containing a `__`-prefixed segment — synthetic
/// placeholder columns and anonymous junction hops — are dropped. Idempotent
/// on already-nested input.
pub fn unflatten(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Array(items) => JsonValue::Array(items.into_iter().map(unflatten).collect()),
        JsonValue::Object(map) => {
            let mut out = JsonMap::new();
            for (key, inner) in map {
                if key.split('.').any(|segment| segment.starts_with("__")) {
                    continue;
                }
                let inner = unflatten(inner);
                insert_at_path(&mut out, &key, inner);
            }
            JsonValue::Object(out)
        }
        other => other,
    }
}

fn insert_at_path(map: &mut JsonMap<String, JsonValue>, key: &str, value: JsonValue) {
    let mut current = map;
    let mut segments = key.split('.').peekable();
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return;
        }
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| JsonValue::Object(JsonMap::new()));
        match entry {
            JsonValue::Object(inner) => current = inner,
            // a scalar already sits where a container is needed; drop the
            // nested key rather than clobbering the scalar
            _ => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn splits_dotted_keys_into_nested_objects() {
        let flat = json!({
            "id": 1,
            "name": "Germany",
            "continent.id": 3,
            "continent.name": "Europe"
        });
        assert_eq!(
            unflatten(flat),
            json!({
                "id": 1,
                "name": "Germany",
                "continent": { "id": 3, "name": "Europe" }
            })
        );
    }

    #[test]
    fn drops_synthetic_segments() {
        let flat = json!({
            "__": 1,
            "languages.__through_0.country_id": 5,
            "languages.id": 2
        });
        assert_eq!(unflatten(flat), json!({ "languages": { "id": 2 } }));
    }

    #[test]
    fn recurses_into_lists_element_wise() {
        let flat = json!([
            { "id": 1, "states": [ { "id": 4, "country.id": 1 } ] },
            { "id": 2, "states": [] }
        ]);
        assert_eq!(
            unflatten(flat),
            json!([
                { "id": 1, "states": [ { "id": 4, "country": { "id": 1 } } ] },
                { "id": 2, "states": [] }
            ])
        );
    }

    #[test]
    fn idempotent_on_nested_input() {
        let flat = json!({
            "id": 1,
            "continent.id": 3,
            "states": [ { "id": 4, "cities": [ { "code.plain": "x" } ] } ]
        });
        let once = unflatten(flat);
        let twice = unflatten(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn scalars_pass_through() {
        assert_eq!(unflatten(json!(42)), json!(42));
        assert_eq!(unflatten(JsonValue::Null), JsonValue::Null);
    }
}
