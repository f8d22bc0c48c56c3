use serde_yaml::{Mapping, Value};

/// Merge an overriding value map into a base map
///
/// The override semantics are part of the manifest contract:
/// - maps merge key by key
/// - arrays replace entirely
/// - scalars right-win
/// - an explicit null on the right does not override
pub fn merge_values(base: &mut Mapping, overrides: &Mapping) {
    for (k, v) in overrides {
        match (base.get_mut(k), v) {
            (_, Value::Null) => {}
            (Some(Value::Mapping(existing)), Value::Mapping(incoming)) => {
                merge_values(existing, incoming);
            }
            (Some(existing), incoming) => {
                *existing = incoming.clone();
            }
            (None, incoming) => {
                base.insert(k.clone(), incoming.clone());
            }
        }
    }
}

/// Merge helper for whole values
pub fn merge_value(base: &mut Value, overrides: &Value) {
    match (base, overrides) {
        (_, Value::Null) => {}
        (Value::Mapping(b), Value::Mapping(o)) => merge_values(b, o),
        (b, o) => *b = o.clone(),
    }
}

/// Recursively retype map keys to strings
///
/// YAML decoding yields arbitrarily typed keys (`on: x` decodes a bool key).
/// Template dictionary helpers (`get`, `hasKey`, `keys`) index by string, so
/// every map is retyped before values cross into a render context.
pub fn stringify_keys(v: Value) -> Value {
    match v {
        Value::Mapping(m) => {
            let mut out = Mapping::new();
            for (k, val) in m {
                let key = match k {
                    Value::String(s) => s,
                    Value::Bool(b) => b.to_string(),
                    Value::Number(n) => n.to_string(),
                    other => serde_yaml::to_string(&other)
                        .unwrap_or_default()
                        .trim_start_matches("---")
                        .trim()
                        .to_string(),
                };
                out.insert(Value::String(key), stringify_keys(val));
            }
            Value::Mapping(out)
        }
        Value::Sequence(seq) => Value::Sequence(seq.into_iter().map(stringify_keys).collect()),
        other => other,
    }
}

/// Resolve yaml merge keys (`<<: *anchor`) in a parsed value tree
///
/// The yaml parser expands aliases but leaves `<<` as a literal key.
/// Merge-key entries are folded into their parent map with the parent's
/// explicit keys winning, per the yaml merge-key spec.
pub fn resolve_merge_keys(v: Value) -> Value {
    match v {
        Value::Mapping(m) => {
            let merge_key = Value::String("<<".into());
            let mut out = Mapping::new();
            let mut merged = Mapping::new();
            for (k, val) in m {
                if k == merge_key {
                    match resolve_merge_keys(val) {
                        Value::Mapping(inner) => {
                            for (ik, iv) in inner {
                                merged.insert(ik, iv);
                            }
                        }
                        Value::Sequence(seq) => {
                            for item in seq {
                                if let Value::Mapping(inner) = resolve_merge_keys(item) {
                                    for (ik, iv) in inner {
                                        merged.insert(ik, iv);
                                    }
                                }
                            }
                        }
                        _ => {}
                    }
                } else {
                    out.insert(k, resolve_merge_keys(val));
                }
            }
            for (k, v) in merged {
                if !out.contains_key(&k) {
                    out.insert(k, v);
                }
            }
            Value::Mapping(out)
        }
        Value::Sequence(seq) => Value::Sequence(seq.into_iter().map(resolve_merge_keys).collect()),
        other => other,
    }
}

/// Look up a dotted path (`a.b.c`) in a value map
pub fn dig<'a>(map: &'a Mapping, path: &str) -> Option<&'a Value> {
    let mut current = map;
    let mut segments = path.split('.').peekable();
    while let Some(seg) = segments.next() {
        let val = current.get(&Value::String(seg.to_string()))?;
        if segments.peek().is_none() {
            return Some(val);
        }
        match val {
            Value::Mapping(m) => current = m,
            _ => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::{dig, merge_values, stringify_keys};
    use serde_yaml::{Mapping, Value};

    fn parse(s: &str) -> Mapping {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn maps_merge_by_key() {
        let mut base = parse("a: {b: 1, c: 2}");
        merge_values(&mut base, &parse("a: {b: 9}"));
        assert_eq!(base, parse("a: {b: 9, c: 2}"));
    }

    #[test]
    fn arrays_replace_entirely() {
        let mut base = parse("a: [1]");
        merge_values(&mut base, &parse("a: [2]"));
        assert_eq!(base, parse("a: [2]"));

        // element-wise merging of arrays must never happen
        let mut base = parse("a: [{x: 1}, {y: 2}]");
        merge_values(&mut base, &parse("a: [{z: 3}]"));
        assert_eq!(base, parse("a: [{z: 3}]"));
    }

    #[test]
    fn scalars_right_win() {
        let mut base = parse("a: old\nb: kept");
        merge_values(&mut base, &parse("a: new"));
        assert_eq!(base, parse("a: new\nb: kept"));
    }

    #[test]
    fn null_does_not_override() {
        let mut base = parse("a: kept");
        merge_values(&mut base, &parse("a: ~"));
        assert_eq!(base, parse("a: kept"));
    }

    #[test]
    fn map_replaces_scalar() {
        let mut base = parse("a: scalar");
        merge_values(&mut base, &parse("a: {b: 1}"));
        assert_eq!(base, parse("a: {b: 1}"));
    }

    #[test]
    fn keys_are_stringified() {
        let v: Value = serde_yaml::from_str("1: x\ntrue: y\nnested:\n  2: z").unwrap();
        let fixed = stringify_keys(v);
        let m = fixed.as_mapping().unwrap();
        assert!(m.contains_key(&Value::String("1".into())));
        assert!(m.contains_key(&Value::String("true".into())));
        let nested = m.get(&Value::String("nested".into())).unwrap().as_mapping().unwrap();
        assert!(nested.contains_key(&Value::String("2".into())));
    }

    #[test]
    fn merge_keys_fold_into_parent() {
        let v: Value = serde_yaml::from_str(
            r#"
templates:
  default: &default
    namespace: shared
    labels:
      tier: web
releases:
  - <<: *default
    name: api
    namespace: own
"#,
        )
        .unwrap();
        let resolved = super::resolve_merge_keys(v);
        let releases = resolved
            .as_mapping()
            .unwrap()
            .get(&Value::String("releases".into()))
            .unwrap()
            .as_sequence()
            .unwrap();
        let api = releases[0].as_mapping().unwrap();
        // explicit keys win over merged ones
        assert_eq!(api.get(&Value::String("namespace".into())), Some(&Value::String("own".into())));
        assert!(api.get(&Value::String("labels".into())).is_some());
        assert!(!api.contains_key(&Value::String("<<".into())));
    }

    #[test]
    fn dig_resolves_dotted_paths() {
        let m = parse("svc:\n  enabled: true\n  meta:\n    tier: web");
        assert_eq!(dig(&m, "svc.enabled"), Some(&Value::Bool(true)));
        assert_eq!(dig(&m, "svc.meta.tier"), Some(&Value::String("web".into())));
        assert_eq!(dig(&m, "svc.missing"), None);
        assert_eq!(dig(&m, "svc.enabled.deeper"), None);
    }
}
