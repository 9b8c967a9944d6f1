//! Nickname rules.

use crate::error::GateError;
use regex::Regex;

pub const NICKNAME_MIN_CHARS: usize = 2;
pub const NICKNAME_MAX_CHARS: usize = 20;

// CJK ideographs, ASCII letters and the common emoji blocks.
const NICKNAME_PATTERN: &str = r"^[\x{4e00}-\x{9fa5}a-zA-Z\x{1F600}-\x{1F64F}\x{1F300}-\x{1F5FF}\x{1F680}-\x{1F6FF}\x{1F1E0}-\x{1F1FF}\x{2600}-\x{26FF}\x{2700}-\x{27BF}]+$";

/// Trim and check a requested nickname, returning the value to store.
///
/// # Errors
/// Returns [`GateError::Validation`] describing the first rule it breaks.
pub fn validate_nickname(raw: &str) -> Result<String, GateError> {
    let nickname = raw.trim();
    let chars = nickname.chars().count();
    if chars < NICKNAME_MIN_CHARS || chars > NICKNAME_MAX_CHARS {
        return Err(GateError::Validation(format!(
            "nickname must be {NICKNAME_MIN_CHARS}-{NICKNAME_MAX_CHARS} characters"
        )));
    }
    let allowed = Regex::new(NICKNAME_PATTERN).is_ok_and(|regex| regex.is_match(nickname));
    if !allowed {
        return Err(GateError::Validation(
            "nickname may only contain Chinese characters, letters and emoji".to_string(),
        ));
    }
    Ok(nickname.to_string())
}

#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_chinese_letters_and_emoji() {
        assert_eq!(validate_nickname(" 百刀会 "), Ok("百刀会".to_string()));
        assert!(validate_nickname("Blade").is_ok());
        assert!(validate_nickname("刀🔥").is_ok());
        assert!(validate_nickname("☀☀").is_ok());
    }

    #[test]
    fn rejects_length_violations() {
        assert!(validate_nickname("刀").is_err());
        assert!(validate_nickname("").is_err());
        assert!(validate_nickname(&"a".repeat(21)).is_err());
        assert!(validate_nickname(&"刀".repeat(20)).is_ok());
    }

    #[test]
    fn rejects_digits_spaces_and_symbols() {
        assert!(validate_nickname("blade99").is_err());
        assert!(validate_nickname("two words").is_err());
        assert!(validate_nickname("<script>").is_err());
        assert!(validate_nickname("ｂｌａｄｅ").is_err());
    }

    #[test]
    fn normalize_email_trims_and_lowercases() {
        assert_eq!(normalize_email(" Fan@Example.COM "), "fan@example.com");
    }
}
