use hex::ToHex;
use sha2::Digest;

pub fn sha256_upper_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    hasher.finalize().encode_hex_upper::<String>()
}

/// Renders a JSON scalar the way it should appear when spliced into text:
/// strings without quotes, numbers as their original token.
pub fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_upper_hex_digest() {
        assert_eq!(
            sha256_upper_hex(b"abc"),
            "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD"
        );
    }

    #[test]
    fn scalar_to_string_keeps_number_tokens() {
        let value: serde_json::Value =
            serde_json::from_str(r#"{"big": 12345678901234567890123, "dec": 0.10}"#)
                .expect("json should parse");
        assert_eq!(scalar_to_string(&value["big"]), "12345678901234567890123");
        assert_eq!(scalar_to_string(&value["dec"]), "0.10");
        assert_eq!(scalar_to_string(&serde_json::json!("x")), "x");
        assert_eq!(scalar_to_string(&serde_json::Value::Null), "");
    }
}
