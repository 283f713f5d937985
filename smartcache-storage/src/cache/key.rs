//! Canonical cache keys.
//!
//! A key is `<resource path>:<name>=<value>:<name>=<value>...` with the
//! parameters sorted by name, e.g. `orders:page=1:size=50:type=all`. The
//! resource path may itself contain `:`-separated segments (`orders:list`),
//! which is what makes group eviction by prefix work.
//!
//! `CacheKey` has a private constructor: the only ways to obtain one are
//! [`build_key`] / [`KeyBuilder`], which canonicalise and escape, and
//! [`CacheKey::parse`], which rejects anything `build_key` could not have
//! produced. Two distinct logical requests therefore can never share a key.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;
use smartcache_core::KeyError;

/// Separator between path segments and parameters.
const SEGMENT_SEPARATOR: char = ':';

/// Separator between a parameter name and its value.
const ASSIGN: char = '=';

/// Escape introducer. Escapes are always `%` plus two uppercase hex digits.
const ESCAPE: char = '%';

/// A canonical cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    /// Private inner data - cannot be constructed externally
    inner: String,
}

impl CacheKey {
    /// Start building a key for a resource.
    pub fn builder(resource: impl Into<String>) -> KeyBuilder {
        KeyBuilder::new(resource)
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    pub fn into_string(self) -> String {
        self.inner
    }

    /// First path segment, unescaped. For `orders:list:page=1` this is `orders`.
    pub fn group(&self) -> String {
        self.inner
            .split(SEGMENT_SEPARATOR)
            .next()
            .map(unescape_lossy)
            .unwrap_or_default()
    }

    /// The resource path, unescaped, without parameters.
    pub fn resource(&self) -> String {
        self.inner
            .split(SEGMENT_SEPARATOR)
            .take_while(|segment| !segment.contains(ASSIGN))
            .map(unescape_lossy)
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Decoded parameters.
    pub fn params(&self) -> Params {
        let mut params = Params::new();
        for segment in self
            .inner
            .split(SEGMENT_SEPARATOR)
            .skip_while(|segment| !segment.contains(ASSIGN))
        {
            if let Some((name, value)) = segment.split_once(ASSIGN) {
                params.insert(unescape_lossy(name), unescape_lossy(value));
            }
        }
        params
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.inner.starts_with(prefix)
    }

    /// Prefix matching every key of a group and nothing else, e.g. `orders:`.
    ///
    /// Plain `"orders"` would also match a hypothetical `ordersArchive` group.
    pub fn group_prefix(group: &str) -> String {
        let mut prefix = String::with_capacity(group.len() + 1);
        escape_into(group, false, &mut prefix);
        prefix.push(SEGMENT_SEPARATOR);
        prefix
    }

    /// Validate a raw key, e.g. one read back from a durable mirror.
    ///
    /// Returns `KeyError::InvalidKey` if the string is not in the exact
    /// canonical form `build_key` emits:
    /// - every `%` starts a known escape (`%25`, `%3A`, `%3D`)
    /// - path segments contain no `=`
    /// - parameter segments contain exactly one `=` and follow all path segments
    /// - parameter names are strictly increasing (sorted, no duplicates)
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        let invalid = |reason: &str| KeyError::InvalidKey {
            key: raw.to_string(),
            reason: reason.to_string(),
        };

        let mut in_params = false;
        let mut last_name: Option<String> = None;

        for segment in raw.split(SEGMENT_SEPARATOR) {
            validate_escapes(segment).map_err(|reason| invalid(&reason))?;

            match segment.matches(ASSIGN).count() {
                0 if in_params => return Err(invalid("path segment after parameters")),
                0 => {}
                1 => {
                    in_params = true;
                    let (name, _) = segment.split_once(ASSIGN).unwrap_or((segment, ""));
                    let name = unescape_lossy(name);
                    if let Some(previous) = &last_name {
                        if *previous >= name {
                            return Err(invalid("parameters not in canonical order"));
                        }
                    }
                    last_name = Some(name);
                }
                _ => return Err(invalid("unescaped '=' in parameter")),
            }
        }

        Ok(Self {
            inner: raw.to_string(),
        })
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.inner
    }
}

/// Request parameters, kept sorted by name.
///
/// Insertion order never matters: `{page: 1, size: 50}` and
/// `{size: 50, page: 1}` are the same `Params`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    inner: BTreeMap<String, String>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter (builder pattern). A repeated name replaces the value.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl fmt::Display) -> Option<String> {
        self.inner.insert(name.into(), value.to_string())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Parameters in canonical (name) order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Canonicalise a JSON object of request parameters.
    ///
    /// Non-string values are rendered as JSON with object keys sorted at
    /// every depth (`1` becomes `1`, `null` becomes `null`). Strings are
    /// rendered bare (`"all"` becomes `all`) unless their text is itself
    /// valid JSON, in which case they keep their quotes (`"1"` becomes
    /// `"1"`). Distinct objects therefore never share a rendering.
    pub fn from_json(value: &Value) -> Result<Self, KeyError> {
        let object = value.as_object().ok_or_else(|| KeyError::ParamsNotAnObject {
            found: json_kind(value).to_string(),
        })?;

        let mut params = Self::new();
        for (name, value) in object {
            let rendered = match value {
                Value::String(s) if serde_json::from_str::<Value>(s).is_err() => s.clone(),
                other => {
                    let mut out = String::new();
                    canonical_json(other, &mut out);
                    out
                }
            };
            params.inner.insert(name.clone(), rendered);
        }
        Ok(params)
    }
}

impl<K, V> FromIterator<(K, V)> for Params
where
    K: Into<String>,
    V: fmt::Display,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (name, value) in iter {
            params.insert(name, value);
        }
        params
    }
}

/// Fluent key construction.
///
/// ```
/// use smartcache_storage::cache::CacheKey;
///
/// let key = CacheKey::builder("orders")
///     .param("type", "all")
///     .param("page", 1)
///     .param("size", 50)
///     .build();
/// assert_eq!(key.as_str(), "orders:page=1:size=50:type=all");
/// ```
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    resource: String,
    params: Params,
}

impl KeyBuilder {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            params: Params::new(),
        }
    }

    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.params.insert(name, value);
        self
    }

    #[must_use]
    pub fn params(mut self, params: &Params) -> Self {
        for (name, value) in params.iter() {
            self.params.insert(name, value);
        }
        self
    }

    pub fn build(&self) -> CacheKey {
        build_key(&self.resource, &self.params)
    }
}

/// Build the canonical key for a resource and its parameters.
///
/// `:` inside `resource` separates path segments; everywhere else the
/// delimiters are escaped, so this function cannot produce colliding keys.
pub fn build_key(resource: &str, params: &Params) -> CacheKey {
    let mut key = String::with_capacity(resource.len() + params.len() * 16);

    for (i, segment) in resource.split(SEGMENT_SEPARATOR).enumerate() {
        if i > 0 {
            key.push(SEGMENT_SEPARATOR);
        }
        escape_into(segment, false, &mut key);
    }

    for (name, value) in params.iter() {
        key.push(SEGMENT_SEPARATOR);
        escape_into(name, true, &mut key);
        key.push(ASSIGN);
        escape_into(value, true, &mut key);
    }

    CacheKey { inner: key }
}

/// Escape reserved characters. `:` is only reserved inside parameters;
/// in the resource path it is the segment separator.
fn escape_into(raw: &str, in_param: bool, out: &mut String) {
    for c in raw.chars() {
        match c {
            ESCAPE => out.push_str("%25"),
            ASSIGN => out.push_str("%3D"),
            SEGMENT_SEPARATOR if in_param => out.push_str("%3A"),
            _ => out.push(c),
        }
    }
}

fn validate_escapes(segment: &str) -> Result<(), String> {
    let mut rest = segment;
    while let Some(pos) = rest.find(ESCAPE) {
        let code = rest.get(pos + 1..pos + 3).unwrap_or("");
        if !matches!(code, "25" | "3A" | "3D") {
            return Err(format!("bad escape sequence '%{}'", code));
        }
        rest = &rest[pos + 3..];
    }
    Ok(())
}

/// Reverse `escape_into`. Unknown sequences are kept verbatim; `parse` has
/// already rejected them for any key that reached this point.
fn unescape_lossy(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(pos) = rest.find(ESCAPE) {
        out.push_str(&rest[..pos]);
        match rest.get(pos + 1..pos + 3) {
            Some("25") => out.push(ESCAPE),
            Some("3A") => out.push(SEGMENT_SEPARATOR),
            Some("3D") => out.push(ASSIGN),
            _ => {
                out.push(ESCAPE);
                rest = &rest[pos + 1..];
                continue;
            }
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    out
}

fn canonical_json(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                canonical_json(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                canonical_json(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_documented_layout() {
        let params = Params::new().with("page", 1).with("size", 50).with("type", "all");
        assert_eq!(
            build_key("orders", &params).as_str(),
            "orders:page=1:size=50:type=all"
        );
    }

    #[test]
    fn test_parameter_order_does_not_matter() {
        let a = Params::new().with("page", 1).with("pageSize", 50);
        let b = Params::new().with("pageSize", 50).with("page", 1);
        assert_eq!(build_key("shipments", &a), build_key("shipments", &b));
    }

    #[test]
    fn test_no_params_is_just_the_resource() {
        assert_eq!(build_key("warehouses", &Params::new()).as_str(), "warehouses");
    }

    #[test]
    fn test_resource_path_segments() {
        let key = build_key("orders:list", &Params::new().with("page", 2));
        assert_eq!(key.as_str(), "orders:list:page=2");
        assert_eq!(key.group(), "orders");
        assert_eq!(key.resource(), "orders:list");
        assert!(key.starts_with(&CacheKey::group_prefix("orders")));
    }

    #[test]
    fn test_delimiters_in_values_are_escaped() {
        // Without escaping both would serialize to "orders:a=1:b=2".
        let one = Params::new().with("a", "1:b=2");
        let two = Params::new().with("a", 1).with("b", 2);

        let k1 = build_key("orders", &one);
        let k2 = build_key("orders", &two);

        assert_ne!(k1, k2);
        assert_eq!(k1.as_str(), "orders:a=1%3Ab%3D2");
    }

    #[test]
    fn test_escape_char_itself_is_escaped() {
        let literal = Params::new().with("q", "%3A");
        let colon = Params::new().with("q", ":");
        assert_ne!(build_key("couriers", &literal), build_key("couriers", &colon));
        assert_eq!(build_key("couriers", &literal).as_str(), "couriers:q=%253A");
    }

    #[test]
    fn test_equals_in_resource_is_escaped() {
        let key = build_key("orders:page=1", &Params::new());
        assert_eq!(key.as_str(), "orders:page%3D1");
        assert!(key.params().is_empty());
    }

    #[test]
    fn test_params_decode() {
        let params = Params::new().with("city", "Köln: Süd").with("page", 3);
        let key = build_key("couriers", &params);
        assert_eq!(key.params(), params);
        assert_eq!(key.resource(), "couriers");
    }

    #[test]
    fn test_builder_matches_free_function() {
        let built = CacheKey::builder("orders")
            .param("type", "all")
            .param("page", 1)
            .build();
        let params = Params::new().with("page", 1).with("type", "all");
        assert_eq!(built, build_key("orders", &params));
    }

    #[test]
    fn test_from_json_sorts_nested_objects() {
        let a = Params::from_json(&json!({"filter": {"b": 1, "a": [2, {"z": 0, "y": 1}]}, "page": 1}))
            .expect("object");
        let b = Params::from_json(&json!({"page": 1, "filter": {"a": [2, {"y": 1, "z": 0}], "b": 1}}))
            .expect("object");

        assert_eq!(a, b);
        assert_eq!(a.get("filter"), Some(r#"{"a":[2,{"y":1,"z":0}],"b":1}"#));
        assert_eq!(a.get("page"), Some("1"));
    }

    #[test]
    fn test_from_json_renders_strings_bare() {
        let params = Params::from_json(&json!({"type": "all"})).expect("object");
        assert_eq!(build_key("orders", &params).as_str(), "orders:type=all");
    }

    #[test]
    fn test_from_json_strings_never_collide_with_json_values() {
        let key = |value: Value| {
            build_key("orders", &Params::from_json(&value).expect("object")).into_string()
        };

        assert_ne!(key(json!({"ids": "[1,2]"})), key(json!({"ids": [1, 2]})));
        assert_ne!(key(json!({"q": "null"})), key(json!({"q": null})));
        assert_ne!(key(json!({"page": "1"})), key(json!({"page": 1})));
        assert_ne!(key(json!({"flag": "true"})), key(json!({"flag": true})));

        // Numbers still match the typed builder.
        assert_eq!(key(json!({"page": 1})), build_key("orders", &Params::new().with("page", 1)).into_string());
    }

    #[test]
    fn test_from_json_rejects_non_objects() {
        let err = Params::from_json(&json!([1, 2])).unwrap_err();
        assert_eq!(
            err,
            KeyError::ParamsNotAnObject {
                found: "array".to_string()
            }
        );
    }

    #[test]
    fn test_parse_accepts_built_keys() {
        let key = build_key("orders:list", &Params::new().with("a", "x:y").with("b", "%"));
        assert_eq!(CacheKey::parse(key.as_str()), Ok(key));
    }

    #[test]
    fn test_parse_rejects_unsorted_params() {
        let err = CacheKey::parse("orders:size=50:page=1").unwrap_err();
        assert!(matches!(err, KeyError::InvalidKey { ref reason, .. } if reason.contains("order")));
    }

    #[test]
    fn test_parse_rejects_duplicate_params() {
        assert!(CacheKey::parse("orders:page=1:page=2").is_err());
    }

    #[test]
    fn test_parse_rejects_double_equals() {
        assert!(CacheKey::parse("orders:a=1=2").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_escape() {
        assert!(CacheKey::parse("orders:a=%zz").is_err());
        assert!(CacheKey::parse("orders:a=%3a").is_err());
        assert!(CacheKey::parse("orders:a=%").is_err());
    }

    #[test]
    fn test_parse_rejects_path_after_params() {
        assert!(CacheKey::parse("orders:page=1:list").is_err());
    }

    #[test]
    fn test_group_prefix_escapes() {
        assert_eq!(CacheKey::group_prefix("orders"), "orders:");
        assert_eq!(CacheKey::group_prefix("a=b"), "a%3Db:");
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    /// Names and values drawn with a bias towards the reserved characters.
    fn text_strategy() -> impl Strategy<Value = String> {
        proptest::string::string_regex("[a-z0-9:=% ]{0,8}").expect("valid regex")
    }

    fn params_strategy() -> impl Strategy<Value = Vec<(String, String)>> {
        proptest::collection::btree_map(text_strategy(), text_strategy(), 0..6)
            .prop_map(|m| m.into_iter().collect())
    }

    /// JSON values whose string forms often look like other JSON values.
    fn json_strategy() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            (-5i64..5).prop_map(Value::from),
            proptest::string::string_regex(r#"[0-9\[\]{}",a-z ]{0,6}"#)
                .expect("valid regex")
                .prop_map(Value::String),
        ];
        leaf.prop_recursive(2, 8, 3, |inner| {
            proptest::collection::vec(inner, 0..3).prop_map(Value::Array)
        })
    }

    proptest! {
        #[test]
        fn prop_from_json_is_injective(a in json_strategy(), b in json_strategy()) {
            let key_a = Params::from_json(&serde_json::json!({"v": a.clone()})).expect("object");
            let key_b = Params::from_json(&serde_json::json!({"v": b.clone()})).expect("object");
            prop_assert_eq!(key_a == key_b, a == b);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        /// Property: keys do not depend on parameter insertion order.
        #[test]
        fn prop_order_invariant(
            pairs in params_strategy(),
            seed in any::<u64>(),
        ) {
            let mut shuffled = pairs.clone();
            // Deterministic rotation + reversal as a cheap permutation.
            if !shuffled.is_empty() {
                let len = shuffled.len();
                shuffled.rotate_left((seed as usize) % len);
                if seed % 2 == 0 {
                    shuffled.reverse();
                }
            }

            let a: Params = pairs.into_iter().collect();
            let b: Params = shuffled.into_iter().collect();
            prop_assert_eq!(build_key("orders", &a), build_key("orders", &b));
        }

        /// Property: distinct parameter sets never share a key.
        #[test]
        fn prop_distinct_params_distinct_keys(
            a in params_strategy(),
            b in params_strategy(),
        ) {
            let pa: Params = a.into_iter().collect();
            let pb: Params = b.into_iter().collect();

            if pa == pb {
                prop_assert_eq!(build_key("shipments", &pa), build_key("shipments", &pb));
            } else {
                prop_assert_ne!(build_key("shipments", &pa), build_key("shipments", &pb));
            }
        }

        /// Property: every built key parses, and decodes back to its params.
        #[test]
        fn prop_built_keys_parse(pairs in params_strategy()) {
            let params: Params = pairs.into_iter().collect();
            let key = build_key("couriers:active", &params);

            prop_assert_eq!(CacheKey::parse(key.as_str()), Ok(key.clone()));
            prop_assert_eq!(key.params(), params);
            prop_assert_eq!(key.resource(), "couriers:active");
        }

        /// Property: every key of a group starts with that group's prefix.
        #[test]
        fn prop_group_prefix_matches(pairs in params_strategy()) {
            let params: Params = pairs.into_iter().collect();
            let key = build_key("orders:list", &params);
            prop_assert!(key.starts_with(&CacheKey::group_prefix("orders")));
            prop_assert!(!key.starts_with(&CacheKey::group_prefix("shipments")));
        }
    }
}
