//! Environment-variable configuration shared by the binaries.
//!
//! Missing or invalid required values are fatal at startup. A defaulted
//! value falls back when the variable is unset or empty.

pub fn required(name: &str) -> String {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => value,
        _ => panic!("{name} not set in environment"),
    }
}

pub fn or_default(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

pub fn positive_int_or_default(name: &str, default: i64) -> i64 {
    let value = or_default(name, &default.to_string());
    let parsed: i64 = value
        .parse()
        .unwrap_or_else(|_| panic!("{name} value is invalid"));
    if parsed < 1 {
        panic!("{name} value must be greater than 0");
    }
    parsed
}
