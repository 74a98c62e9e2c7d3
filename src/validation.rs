use std::net::IpAddr;

/// Checks that a string is a valid module identifier: a letter or underscore
/// followed by letters, digits or underscores.
pub fn is_valid_identifier(name: &str) -> Result<(), &'static str> {
    let mut chars = name.chars();
    match chars.next() {
        None => return Err("Identifier cannot be empty"),
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        Some(_) => return Err("Identifier must start with a letter or underscore"),
    }
    if chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err("Identifier may only contain letters, digits and underscores")
    }
}

/// Checks that a port number is usable. The type already limits the value to
/// 0-65535; port 0 is reserved and rejected.
pub fn is_valid_port(port: u16) -> Result<(), &'static str> {
    if port > 0 {
        Ok(())
    } else {
        Err("Port number must be greater than 0")
    }
}

/// Checks that a string is a resolvable listen/connect address: an IP
/// address or a non-empty host name.
pub fn is_valid_address(address: &str) -> Result<(), &'static str> {
    if address.is_empty() {
        return Err("Address cannot be empty");
    }
    if address.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    if address
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        Ok(())
    } else {
        Err("Address is neither an IP address nor a plain host name")
    }
}

/// Checks that a string can be used as a file path.
pub fn is_valid_path(path: &str) -> Result<(), &'static str> {
    if path.is_empty() {
        return Err("File path cannot be empty");
    }
    if path.contains('\0') {
        return Err("File path cannot contain null bytes");
    }
    Ok(())
}

/// Checks that a string is not empty.
pub fn is_not_empty(value: &str) -> Result<(), &'static str> {
    if value.is_empty() {
        Err("Value cannot be empty")
    } else {
        Ok(())
    }
}
