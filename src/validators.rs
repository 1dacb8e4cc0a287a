//! Input validation for configuration values
//!
//! Every value ends up as an iptables argument. Arguments are never passed
//! through a shell, but a malformed value still produces a rule iptables
//! rejects halfway through `apply`, so they are checked up front.

use ipnetwork::Ipv4Network;

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

fn parse_u32(part: &str) -> Option<u32> {
    if let Some(hex) = part.strip_prefix("0x").or_else(|| part.strip_prefix("0X")) {
        if hex.is_empty() {
            return None;
        }
        u32::from_str_radix(hex, 16).ok()
    } else {
        part.parse::<u32>().ok()
    }
}

/// Validates an fwmark in `value[/mask]` form (decimal or `0x` hex, 32 bits each).
///
/// # Errors
///
/// Returns `Err` if either part is missing, not a number, or exceeds 32 bits.
///
/// # Examples
///
/// ```
/// use tpfw::validators::validate_fwmark;
///
/// assert!(validate_fwmark("0x29a/0xffffffff").is_ok());
/// assert!(validate_fwmark("666").is_ok());
/// assert!(validate_fwmark("0x29a/").is_err());
/// ```
pub fn validate_fwmark(input: &str) -> Result<String, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("Mark cannot be empty".to_string());
    }

    let (value, mask) = match input.split_once('/') {
        Some((v, m)) => (v, Some(m)),
        None => (input, None),
    };

    if parse_u32(value).is_none() {
        return Err(format!("Invalid mark value '{value}' (expected decimal or 0x hex, 32-bit)"));
    }
    if let Some(mask) = mask
        && parse_u32(mask).is_none()
    {
        return Err(format!("Invalid mark mask '{mask}' (expected decimal or 0x hex, 32-bit)"));
    }

    Ok(input.to_string())
}

/// Validates a user or group given to the `owner` match: a numeric id or a
/// POSIX-style account name.
///
/// # Errors
///
/// Returns `Err` if the name is empty, longer than 32 characters, or contains
/// characters outside `[a-z0-9_-]` (first character a letter or underscore).
pub fn validate_owner(input: &str) -> Result<String, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("Owner cannot be empty".to_string());
    }

    if input.chars().all(|c| c.is_ascii_digit()) {
        return input
            .parse::<u32>()
            .map(|_| input.to_string())
            .map_err(|_| "Numeric id out of range".to_string());
    }

    if input.len() > 32 {
        return Err("Owner name too long (max 32 characters)".to_string());
    }

    let mut chars = input.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-'));

    if first_ok && rest_ok {
        Ok(input.to_string())
    } else {
        Err(format!("Invalid owner name '{input}'"))
    }
}

/// Validates a hijack DNS destination: an IPv4 address or CIDR.
///
/// # Errors
///
/// Returns `Err` if the target does not parse as an IPv4 network.
pub fn validate_hijack_target(input: &str) -> Result<Ipv4Network, String> {
    input
        .trim()
        .parse::<Ipv4Network>()
        .map_err(|e| format!("Invalid DNS target '{input}': {e}"))
}

/// Validates the proxy's fake-IP block.
///
/// # Errors
///
/// Returns `Err` for `/0` (it would DNAT every ICMP packet) and for a network
/// address with host bits set.
pub fn validate_fake_ip_range(range: Ipv4Network) -> Result<Ipv4Network, String> {
    if range.prefix() == 0 {
        return Err("Fake-IP range cannot be 0.0.0.0/0".to_string());
    }
    if range.network() != range.ip() {
        return Err(format!(
            "Fake-IP range {range} has host bits set (did you mean {}/{}?)",
            range.network(),
            range.prefix()
        ));
    }
    Ok(range)
}
