// ABOUTME: SQL identifier validation and quoting
// ABOUTME: Every schema, table and column name from a job document passes through here before use

use anyhow::{bail, Result};

/// Validate a PostgreSQL identifier against a conservative allow-list.
pub fn validate(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("identifier must not be empty");
    }

    if name.len() > 63 {
        bail!(
            "identifier '{}' exceeds PostgreSQL maximum length of 63 bytes (got {})",
            name,
            name.len()
        );
    }

    let mut chars = name.chars();
    if let Some(first) = chars.next() {
        if !first.is_ascii_alphabetic() && first != '_' {
            bail!(
                "identifier '{}' must start with a letter or underscore, got '{}'",
                name,
                first
            );
        }
    }

    for ch in chars {
        if !ch.is_ascii_alphanumeric() && ch != '_' {
            bail!("identifier '{}' contains invalid character '{}'", name, ch);
        }
    }

    Ok(())
}

/// Double-quote a validated identifier.
pub fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `"schema"."table"`
pub fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote(schema), quote(table))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_plain_identifiers() {
        assert!(validate("orders").is_ok());
        assert!(validate("_tmp_1").is_ok());
        assert!(validate("MaterialNo").is_ok());
    }

    #[test]
    fn test_rejects_injection_attempts() {
        assert!(validate("orders; drop table x").is_err());
        assert!(validate("a\"b").is_err());
        assert!(validate("1abc").is_err());
        assert!(validate("").is_err());
        assert!(validate(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_quote_and_qualify() {
        assert_eq!(quote("Order"), "\"Order\"");
        assert_eq!(qualified("public", "t"), "\"public\".\"t\"");
    }
}
