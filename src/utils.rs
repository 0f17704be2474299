use std::str::FromStr;
use tokio::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Parses a duration string in the format "500ms", "10s", "5m", "2h".
///
/// Supported units:
/// - `ms` for milliseconds
/// - `s` for seconds
/// - `m` for minutes
/// - `h` for hours
pub fn parse_duration_string(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration string cannot be empty".to_string());
    }

    let (value_str, factor_ms) = if let Some(v) = s.strip_suffix("ms") {
        (v, 1u64)
    } else if let Some(v) = s.strip_suffix('s') {
        (v, 1_000)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 60_000)
    } else if let Some(v) = s.strip_suffix('h') {
        (v, 3_600_000)
    } else {
        return Err(format!(
            "Unknown duration unit in '{}'. Use 'ms', 's', 'm', or 'h'.",
            s
        ));
    };

    let value = match u64::from_str(value_str.trim()) {
        Ok(v) => v,
        Err(_) => return Err(format!("Invalid numeric value in duration: '{}'", value_str)),
    };

    Ok(Duration::from_millis(value * factor_ms))
}

/// Splits a "Key: Value" header line at the first colon.
///
/// The value may itself contain colons (e.g. "Referer: http://a/b").
pub fn parse_header_line(line: &str) -> Result<(String, String), String> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| format!("Invalid header '{}'. Expected 'Key: Value'.", line))?;

    let name = name.trim();
    if name.is_empty() {
        return Err(format!("Header name cannot be empty in '{}'.", line));
    }

    Ok((name.to_string(), value.trim().to_string()))
}

/// Generates an identifier of the form `<prefix><10 alphanumeric chars>`.
pub fn random_id(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(
            parse_duration_string("500ms").unwrap(),
            Duration::from_millis(500)
        );
        assert_eq!(parse_duration_string("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration_string("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(
            parse_duration_string("2h").unwrap(),
            Duration::from_secs(7200)
        );
    }

    #[test]
    fn test_parse_duration_trims_whitespace() {
        assert_eq!(
            parse_duration_string("  30s  ").unwrap(),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration_string("").is_err());
        assert!(parse_duration_string("10").is_err());
        assert!(parse_duration_string("abcs").is_err());
        assert!(parse_duration_string("10d").is_err());
    }

    #[test]
    fn test_parse_header_line_simple() {
        let (name, value) = parse_header_line("Content-Type: application/json").unwrap();
        assert_eq!(name, "Content-Type");
        assert_eq!(value, "application/json");
    }

    #[test]
    fn test_parse_header_line_value_with_colons() {
        let (name, value) = parse_header_line("Referer: http://example.com/a").unwrap();
        assert_eq!(name, "Referer");
        assert_eq!(value, "http://example.com/a");
    }

    #[test]
    fn test_parse_header_line_rejects_missing_colon() {
        assert!(parse_header_line("NotAHeader").is_err());
        assert!(parse_header_line(": value-only").is_err());
    }

    #[test]
    fn test_random_id_shape() {
        let id = random_id("aid_");
        assert!(id.starts_with("aid_"));
        assert_eq!(id.len(), 14);
        assert!(id[4..].chars().all(|c| c.is_ascii_alphanumeric()));

        // Two draws should essentially never collide.
        assert_ne!(random_id("tid_"), random_id("tid_"));
    }
}
