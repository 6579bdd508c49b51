use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use super::Error;

/// Whether a canonical label is matched positively or negatively.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Op {
    Include,
    Exclude,
}

impl Op {
    pub fn token(self) -> &'static str {
        match self {
            Op::Include => "",
            Op::Exclude => "!",
        }
    }
}

/// Normalise a LabelSelector into canonical `(op, label)` pairs:
/// `key:value` for matchLabels, `key:v1,v2` for In/NotIn (values sorted),
/// bare `key` for Exists/DoesNotExist. Pairs are sorted by `(op, label)` so
/// the derived set names do not depend on input order. A selector with no
/// terms yields the single pair `(Include, "")`, the match-everything
/// sentinel.
pub fn parse_selector(selector: &LabelSelector) -> Result<Vec<(Op, String)>, Error> {
    let mut pairs = Vec::new();

    for (key, value) in selector.match_labels.iter().flatten() {
        pairs.push((Op::Include, format!("{key}:{value}")));
    }

    for expr in selector.match_expressions.iter().flatten() {
        let joined_values = || -> Result<String, Error> {
            let mut values = expr.values.clone().unwrap_or_default();
            if values.is_empty() {
                return Err(Error::InvalidSelector(format!(
                    "operator {} requires values (key {})",
                    expr.operator, expr.key
                )));
            }
            values.sort();
            Ok(values.join(","))
        };

        match expr.operator.as_str() {
            "In" => pairs.push((Op::Include, format!("{}:{}", expr.key, joined_values()?))),
            "NotIn" => pairs.push((Op::Exclude, format!("{}:{}", expr.key, joined_values()?))),
            "Exists" => pairs.push((Op::Include, expr.key.clone())),
            "DoesNotExist" => pairs.push((Op::Exclude, expr.key.clone())),
            op => {
                return Err(Error::InvalidSelector(format!(
                    "unknown operator {op} (key {})",
                    expr.key
                )));
            }
        }
    }

    if pairs.is_empty() {
        pairs.push((Op::Include, String::new()));
    }

    pairs.sort();
    Ok(pairs)
}

pub fn is_match_all(pairs: &[(Op, String)]) -> bool {
    matches!(pairs, [(Op::Include, label)] if label.is_empty())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn selector(value: serde_json::Value) -> LabelSelector {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_match_labels() {
        let pairs = parse_selector(&selector(json!({
            "matchLabels": {"app": "web", "tier": "frontend"}
        })))
        .unwrap();

        assert_eq!(
            pairs,
            vec![
                (Op::Include, "app:web".into()),
                (Op::Include, "tier:frontend".into()),
            ]
        );
    }

    #[test]
    fn test_expressions_sorted_and_canonical() {
        let pairs = parse_selector(&selector(json!({
            "matchExpressions": [
                {"key": "env", "operator": "NotIn", "values": ["qa", "dev"]},
                {"key": "region", "operator": "Exists"},
                {"key": "legacy", "operator": "DoesNotExist"},
                {"key": "app", "operator": "In", "values": ["web"]},
            ]
        })))
        .unwrap();

        // includes first, then excludes, each sorted by label
        assert_eq!(
            pairs,
            vec![
                (Op::Include, "app:web".into()),
                (Op::Include, "region".into()),
                (Op::Exclude, "env:dev,qa".into()),
                (Op::Exclude, "legacy".into()),
            ]
        );
    }

    #[test]
    fn test_empty_selector_sentinel() {
        let pairs = parse_selector(&LabelSelector::default()).unwrap();
        assert_eq!(pairs, vec![(Op::Include, String::new())]);
        assert!(is_match_all(&pairs));

        let pairs = parse_selector(&selector(json!({"matchLabels": {"a": "b"}}))).unwrap();
        assert!(!is_match_all(&pairs));
    }

    #[test]
    fn test_order_independence() {
        let a = parse_selector(&selector(json!({
            "matchExpressions": [
                {"key": "env", "operator": "In", "values": ["prod", "staging"]},
                {"key": "app", "operator": "Exists"},
            ]
        })))
        .unwrap();
        let b = parse_selector(&selector(json!({
            "matchExpressions": [
                {"key": "app", "operator": "Exists"},
                {"key": "env", "operator": "In", "values": ["staging", "prod"]},
            ]
        })))
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_in_requires_values() {
        let err = parse_selector(&selector(json!({
            "matchExpressions": [{"key": "app", "operator": "In", "values": []}]
        })))
        .unwrap_err();
        assert!(matches!(err, Error::InvalidSelector(_)));

        let err = parse_selector(&selector(json!({
            "matchExpressions": [{"key": "app", "operator": "NotIn"}]
        })))
        .unwrap_err();
        assert!(matches!(err, Error::InvalidSelector(_)));
    }

    #[test]
    fn test_unknown_operator() {
        let err = parse_selector(&selector(json!({
            "matchExpressions": [{"key": "app", "operator": "Near", "values": ["x"]}]
        })))
        .unwrap_err();
        assert!(matches!(err, Error::InvalidSelector(_)));
    }
}
