//! Identifier safety.
//!
//! Every dynamic table or column name entering SQL passes through here.
//! Violations are programmer errors and are rejected, never sanitized.

use anyhow::{bail, Result};

/// True when `s` matches `^[A-Za-z_][A-Za-z0-9_]*$`.
pub fn is_safe_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validate `s` as an identifier.
pub fn ensure_safe_ident(s: &str) -> Result<()> {
    if !is_safe_ident(s) {
        bail!("unsafe SQL identifier: {s:?}");
    }
    Ok(())
}

/// Validate and double-quote an identifier for interpolation into SQL.
pub fn quote_ident(s: &str) -> Result<String> {
    ensure_safe_ident(s)?;
    Ok(format!("\"{s}\""))
}
