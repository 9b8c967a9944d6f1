use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};

pub const INVITE_TOKEN_LEN: usize = 32;

/// Random URL-safe invite token.
#[must_use]
pub fn generate_invite_token() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(INVITE_TOKEN_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_alphanumeric_and_distinct() {
        let first = generate_invite_token();
        let second = generate_invite_token();
        assert_eq!(first.len(), INVITE_TOKEN_LEN);
        assert!(first.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(first, second);
    }
}
