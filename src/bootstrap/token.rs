use rand::Rng;
use rand::thread_rng;

/// Generate a token naming a pending pipe
///
/// 128 random bits as 32 lowercase hex digits.
pub fn generate_random_token() -> String {
    let bits: u128 = thread_rng().r#gen();
    format!("{bits:032x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_token_format() {
        let token = generate_random_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_tokens_are_unique() {
        let tokens: HashSet<String> = (0..1000).map(|_| generate_random_token()).collect();
        assert_eq!(tokens.len(), 1000);
    }
}
