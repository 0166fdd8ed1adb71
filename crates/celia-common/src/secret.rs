/// Mask a credential for logging: keeps the first and last four characters.
/// Values of eight characters or fewer are masked entirely.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }

    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}***{tail}")
}

#[cfg(test)]
mod tests {
    use super::mask_secret;

    #[test]
    fn masks_middle_of_long_tokens() {
        assert_eq!(mask_secret("1234567890:ABCDEFGHIJ"), "1234***GHIJ");
    }

    #[test]
    fn short_values_are_fully_masked() {
        assert_eq!(mask_secret("secret"), "******");
        assert_eq!(mask_secret(""), "");
    }

    #[test]
    fn handles_multibyte_characters() {
        assert_eq!(mask_secret("ключ-секрет-токен"), "ключ***окен");
    }
}
