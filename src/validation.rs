//! Input validation and sanitization
//!
//! Everything that ends up on an `ip`, `wg` or `iptables` command line, or in
//! a WireGuard config file, passes through here first.

use base64::engine::general_purpose;
use base64::Engine as _;
use ipnet::Ipv4Net;

use crate::allocator;
use crate::error::{PanelError, PanelResult};
use crate::model::Snapshot;

/// Maximum length for interface names (Linux kernel limit is 15)
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Maximum length for names, comments and descriptions
const MAX_CONFIG_VALUE_LEN: usize = 255;

/// Maximum length for command output carried in errors
const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Only /24 server subnets are supported
const SERVER_PREFIX_LEN: u8 = 24;

/// Validate interface name to prevent command injection
///
/// Interface names must be alphanumeric with optional dashes and underscores,
/// and no longer than 15 characters (Linux kernel limit)
pub fn validate_interface_name(name: &str) -> PanelResult<()> {
    if name.is_empty() {
        return Err(PanelError::InvalidParameter(
            "Interface name cannot be empty".to_string()
        ));
    }

    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(PanelError::InvalidParameter(
            format!("Interface name too long (max {} characters)", MAX_INTERFACE_NAME_LEN)
        ));
    }

    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' {
            return Err(PanelError::InvalidParameter(
                format!("Invalid interface name '{}': contains invalid character '{}'", name, c)
            ));
        }
    }

    // Could be interpreted as an option
    if name.starts_with('-') {
        return Err(PanelError::InvalidParameter(
            "Interface name cannot start with dash".to_string()
        ));
    }

    Ok(())
}

/// Parse a server address, appending `/24` when no prefix is given.
///
/// The address must be a usable host inside a /24, e.g. `10.0.0.1/24`.
pub fn parse_server_address(input: &str) -> PanelResult<Ipv4Net> {
    let input = input.trim();
    let with_prefix = if input.contains('/') {
        input.to_string()
    } else {
        format!("{}/{}", input, SERVER_PREFIX_LEN)
    };

    let net: Ipv4Net = with_prefix.parse()
        .map_err(|_| PanelError::InvalidParameter(format!("Invalid server address: {}", input)))?;

    if net.prefix_len() != SERVER_PREFIX_LEN {
        return Err(PanelError::Validation(
            format!("Server subnet must be /{} (got /{})", SERVER_PREFIX_LEN, net.prefix_len())
        ));
    }

    let host = net.addr().octets()[3];
    if host == 0 || host == 255 {
        return Err(PanelError::InvalidParameter(
            format!("Server address {} is not a usable host address", net)
        ));
    }

    Ok(net)
}

/// Validate a UDP/TCP port number
pub fn validate_port(port: u32) -> PanelResult<u16> {
    if port == 0 || port > u16::MAX as u32 {
        return Err(PanelError::InvalidParameter(
            format!("Port {} out of range 1-65535", port)
        ));
    }
    Ok(port as u16)
}

/// Validate that a Base64 WireGuard key decodes to 32 bytes
pub fn validate_key(b64: &str) -> PanelResult<()> {
    let bytes = general_purpose::STANDARD.decode(b64.trim())
        .map_err(|e| PanelError::InvalidParameter(format!("Invalid base64 key: {}", e)))?;
    if bytes.len() != 32 {
        return Err(PanelError::InvalidParameter(
            format!("Invalid key length {} (expected 32 bytes)", bytes.len())
        ));
    }
    Ok(())
}

/// Validate a human-entered name
pub fn validate_name(name: &str) -> PanelResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(PanelError::InvalidParameter("Name cannot be empty".to_string()));
    }
    sanitize_config_value(name)
}

/// Sanitize configuration values to prevent injection
///
/// Removes or rejects values containing dangerous characters
pub fn sanitize_config_value(value: &str) -> PanelResult<String> {
    if value.chars().any(|c| c.is_control() && c != '\t') {
        return Err(PanelError::InvalidParameter(
            "Configuration value contains invalid control characters".to_string()
        ));
    }

    if value.len() > MAX_CONFIG_VALUE_LEN {
        return Err(PanelError::InvalidParameter(
            format!("Configuration value too long (max {} characters)", MAX_CONFIG_VALUE_LEN)
        ));
    }

    Ok(value.to_string())
}

/// Check a requested server subnet and listen port against the snapshot.
///
/// `exclude` names a server whose own claims are ignored (for updates).
pub fn validate_server_config(
    snapshot: &Snapshot,
    address: &Ipv4Net,
    port: u16,
    exclude: Option<&str>,
) -> PanelResult<()> {
    if address.prefix_len() != SERVER_PREFIX_LEN {
        return Err(PanelError::Validation(format!("Server subnet must be /{}", SERVER_PREFIX_LEN)));
    }

    if !allocator::is_subnet_available(snapshot, address, exclude) {
        return Err(PanelError::Validation(format!("Subnet {} is already in use", address)));
    }

    if !allocator::is_listen_port_available(snapshot, port, exclude) {
        return Err(PanelError::Validation(format!("Port {} is already in use", port)));
    }

    Ok(())
}

/// Turn a client name into a safe file name for exported profiles
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let keep = c.is_alphanumeric();
        if keep {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }

    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "client".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Sanitize error messages to prevent information disclosure
pub fn sanitize_error_message(stderr: &str) -> String {
    let mut sanitized = stderr.trim().to_string();

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let mut cut = MAX_ERROR_MESSAGE_LEN;
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str("... (truncated)");
    }

    sanitized
}
