use serde_json::Value;

/// Parse a JSON-RPC quantity: `"0x1a"`, `"26"` or `26`.
pub fn parse_quantity(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        },
        _ => None,
    }
}

pub fn to_quantity(n: u64) -> String {
    format!("{n:#x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quantities() {
        assert_eq!(parse_quantity(&json!("0x1a")), Some(26));
        assert_eq!(parse_quantity(&json!("26")), Some(26));
        assert_eq!(parse_quantity(&json!(26)), Some(26));
        assert_eq!(parse_quantity(&json!("0xzz")), None);
        assert_eq!(parse_quantity(&json!(null)), None);
        assert_eq!(to_quantity(4660), "0x1234");
    }
}
