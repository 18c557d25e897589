use airlock_contracts::ClaimsDeclaration;
use serde_json::{Map, Value};

pub const MAX_ENTRIES: usize = 32;
pub const MAX_NAME_LEN: usize = 64;
pub const MAX_DEPTH: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub path: String,
    pub message: String,
}

impl SchemaViolation {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub violations: Vec<SchemaViolation>,
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn summary(&self) -> String {
        self.violations
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// One declared claim and its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimSpec {
    pub name: String,
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimEntry {
    Leaf(ClaimSpec),
    Group { name: String, members: Vec<ClaimSpec> },
}

impl ClaimEntry {
    pub fn name(&self) -> &str {
        match self {
            ClaimEntry::Leaf(spec) => spec.name.as_str(),
            ClaimEntry::Group { name, .. } => name.as_str(),
        }
    }

    /// Claim types this entry resolves against the registry.
    pub fn claim_types(&self) -> Vec<&str> {
        match self {
            ClaimEntry::Leaf(spec) => vec![spec.name.as_str()],
            ClaimEntry::Group { members, .. } => {
                members.iter().map(|m| m.name.as_str()).collect()
            }
        }
    }
}

enum Shape {
    Params,
    Group,
    Mixed,
}

fn classify(members: &Map<String, Value>) -> Shape {
    if members.is_empty() {
        return Shape::Params;
    }
    let objects = members.values().filter(|v| v.is_object()).count();
    if objects == 0 {
        Shape::Params
    } else if objects == members.len() {
        Shape::Group
    } else {
        Shape::Mixed
    }
}

/// Checks a declaration against the fixed claims schema. Never evaluates
/// claim semantics.
pub fn validate(declaration: &ClaimsDeclaration) -> ValidationOutcome {
    let mut violations = Vec::new();

    let Some(root) = declaration.as_object() else {
        violations.push(SchemaViolation::new(
            "$",
            "claims declaration must be an object",
        ));
        return ValidationOutcome { violations };
    };

    if root.is_empty() {
        violations.push(SchemaViolation::new(
            "$",
            "claims declaration must declare at least one claim",
        ));
    }
    if root.len() > MAX_ENTRIES {
        violations.push(SchemaViolation::new(
            "$",
            format!("at most {} claims may be declared", MAX_ENTRIES),
        ));
    }

    for (name, value) in root {
        check_entry(&format!("$.{}", name), name, value, 1, &mut violations);
    }

    ValidationOutcome { violations }
}

/// Validates and converts a declaration into ordered, typed entries.
pub fn parse_entries(declaration: &ClaimsDeclaration) -> Result<Vec<ClaimEntry>, ValidationOutcome> {
    let outcome = validate(declaration);
    if !outcome.is_valid() {
        return Err(outcome);
    }

    let Some(root) = declaration.as_object() else {
        return Err(outcome);
    };

    let mut entries = Vec::with_capacity(root.len());
    for (name, value) in root {
        let members = value.as_object().cloned().unwrap_or_default();
        match classify(&members) {
            Shape::Group => entries.push(ClaimEntry::Group {
                name: name.clone(),
                members: members
                    .into_iter()
                    .map(|(nested, params)| ClaimSpec {
                        name: nested,
                        params: params.as_object().cloned().unwrap_or_default(),
                    })
                    .collect(),
            }),
            Shape::Params | Shape::Mixed => entries.push(ClaimEntry::Leaf(ClaimSpec {
                name: name.clone(),
                params: members,
            })),
        }
    }

    Ok(entries)
}

fn check_entry(
    path: &str,
    name: &str,
    value: &Value,
    depth: usize,
    out: &mut Vec<SchemaViolation>,
) {
    if !is_claim_type_name(name) {
        out.push(SchemaViolation::new(
            path,
            "claim-type names must match [a-z][a-z0-9_]{0,63}",
        ));
    }

    let Some(members) = value.as_object() else {
        out.push(SchemaViolation::new(path, "claim value must be an object"));
        return;
    };

    match classify(members) {
        Shape::Params => check_params(path, members, out),
        Shape::Group => {
            if depth >= MAX_DEPTH {
                out.push(SchemaViolation::new(
                    path,
                    format!("claims may nest at most {} levels deep", MAX_DEPTH),
                ));
                return;
            }
            if members.len() > MAX_ENTRIES {
                out.push(SchemaViolation::new(
                    path,
                    format!("a claim group holds at most {} claims", MAX_ENTRIES),
                ));
            }
            for (nested, nested_value) in members {
                check_entry(
                    &format!("{}.{}", path, nested),
                    nested,
                    nested_value,
                    depth + 1,
                    out,
                );
            }
        }
        Shape::Mixed => out.push(SchemaViolation::new(
            path,
            "claim value mixes nested claims with parameters",
        )),
    }
}

fn check_params(path: &str, params: &Map<String, Value>, out: &mut Vec<SchemaViolation>) {
    for (key, value) in params {
        let param_path = format!("{}.{}", path, key);
        if !is_param_name(key) {
            out.push(SchemaViolation::new(
                param_path.as_str(),
                "parameter names must match [A-Za-z_][A-Za-z0-9_]{0,63}",
            ));
        }

        let ok = match value {
            Value::Array(items) => items.iter().all(is_scalar),
            other => is_scalar(other),
        };
        if !ok {
            out.push(SchemaViolation::new(
                param_path,
                "parameter values must be scalars or arrays of scalars",
            ));
        }
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(
        value,
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
    )
}

pub fn is_claim_type_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_NAME_LEN {
        return false;
    }
    bytes[0].is_ascii_lowercase()
        && bytes[1..]
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'_')
}

fn is_param_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_NAME_LEN {
        return false;
    }
    (bytes[0].is_ascii_alphabetic() || bytes[0] == b'_')
        && bytes[1..]
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(value: Value) -> ClaimsDeclaration {
        ClaimsDeclaration::new(value)
    }

    #[test]
    fn accepts_leaf_and_group_entries() {
        let outcome = validate(&decl(serde_json::json!({
            "max_uses": {"limit": 1},
            "window": {
                "not_before": {"timestamp": "2020-01-01T00:00:00Z"},
                "not_after": {"timestamp": "2999-01-01T00:00:00Z"}
            },
            "flag": {}
        })));
        assert!(outcome.is_valid(), "{}", outcome.summary());
    }

    #[test]
    fn rejects_non_object_and_empty_roots() {
        let outcome = validate(&decl(serde_json::json!(["max_uses"])));
        assert_eq!(outcome.violations.len(), 1);
        assert_eq!(outcome.violations[0].path, "$");

        let outcome = validate(&decl(serde_json::json!({})));
        assert!(outcome.summary().contains("at least one claim"));
    }

    #[test]
    fn rejects_third_nesting_level() {
        let outcome = validate(&decl(serde_json::json!({
            "outer": {
                "inner": {
                    "max_uses": {"limit": 1}
                }
            }
        })));
        assert!(!outcome.is_valid());
        assert_eq!(outcome.violations[0].path, "$.outer.inner");
        assert!(outcome.violations[0].message.contains("at most 2 levels"));
    }

    #[test]
    fn rejects_bad_names_and_value_types() {
        let outcome = validate(&decl(serde_json::json!({
            "Max-Uses": {"limit": 1},
            "max_uses": 3,
            "not_after": {"timestamp": [{"nested": true}]},
            "mixed": {"limit": 1, "max_uses": {"limit": 2}}
        })));

        let paths = outcome
            .violations
            .iter()
            .map(|v| v.path.as_str())
            .collect::<Vec<_>>();
        assert_eq!(
            paths,
            vec![
                "$.Max-Uses",
                "$.max_uses",
                "$.not_after.timestamp",
                "$.mixed"
            ]
        );
    }

    #[test]
    fn rejects_oversized_declarations() {
        let mut root = Map::new();
        for idx in 0..=MAX_ENTRIES {
            root.insert(format!("claim_{}", idx), serde_json::json!({}));
        }
        let outcome = validate(&decl(Value::Object(root)));
        assert!(outcome.summary().contains("at most 32 claims"));
    }

    #[test]
    fn parse_entries_keeps_declaration_order_and_groups() {
        let parsed: ClaimsDeclaration = serde_json::from_str(
            r#"{"not_after":{"timestamp":"2999-01-01T00:00:00Z"},"window":{"a":{},"b":{"x":1}},"max_uses":{"limit":2}}"#,
        )
        .expect("fixture must parse");

        let entries = parse_entries(&parsed).expect("declaration should be valid");
        let names = entries.iter().map(|e| e.name()).collect::<Vec<_>>();
        assert_eq!(names, vec!["not_after", "window", "max_uses"]);

        match &entries[1] {
            ClaimEntry::Group { name, members } => {
                assert_eq!(name, "window");
                assert_eq!(members.len(), 2);
                assert_eq!(members[1].params.get("x"), Some(&serde_json::json!(1)));
            }
            other => panic!("expected group entry, got {:?}", other),
        }
        assert_eq!(entries[1].claim_types(), vec!["a", "b"]);
    }

    #[test]
    fn claim_type_names_follow_pattern() {
        assert!(is_claim_type_name("max_uses"));
        assert!(is_claim_type_name("a1"));
        assert!(!is_claim_type_name("1a"));
        assert!(!is_claim_type_name("_a"));
        assert!(!is_claim_type_name(""));
        assert!(!is_claim_type_name(&"a".repeat(MAX_NAME_LEN + 1)));
    }
}
