//! Name validation utilities.
//!
//! Node names end up inside interface names, namespace names and file
//! names, so they are restricted to a conservative identifier alphabet.

use regex::Regex;
use std::sync::OnceLock;

/// Longest interface name the kernel accepts (IFNAMSIZ minus the NUL byte)
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Longest node name; leaves room for `-eth` and a single-digit index
pub const MAX_NODE_NAME_LEN: usize = MAX_INTERFACE_NAME_LEN - "-eth0".len();

fn node_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("valid node name pattern"))
}

/// Validate a node name
///
/// # Examples
/// ```
/// use p4net::utils::validation::validate_node_name;
///
/// assert!(validate_node_name("s1").is_ok());
/// assert!(validate_node_name("h_10").is_ok());
/// assert!(validate_node_name("").is_err());
/// assert!(validate_node_name("s-1").is_err());
/// ```
pub fn validate_node_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name cannot be empty".to_string());
    }
    if !node_name_pattern().is_match(name) {
        return Err("must start with a letter and contain only letters, digits and '_'".to_string());
    }
    if name.len() > MAX_NODE_NAME_LEN {
        return Err(format!("must be at most {} characters", MAX_NODE_NAME_LEN));
    }
    Ok(())
}

/// Validate a generated interface name against the kernel length limit
pub fn validate_interface_name(name: &str) -> Result<(), String> {
    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(format!(
            "interface name is {} characters, the limit is {}",
            name.len(),
            MAX_INTERFACE_NAME_LEN
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_name_length_limit() {
        assert!(validate_node_name("abcdefghij").is_ok());
        assert!(validate_node_name("abcdefghijk").is_err());
    }

    #[test]
    fn test_interface_name_limit() {
        assert!(validate_interface_name("abcdefghij-eth9").is_ok());
        assert!(validate_interface_name("abcdefghij-eth10").is_err());
    }
}
