//! Agent slug generation.
//!
//! A slug is the kebab-case of the display name plus a 6-character random
//! suffix, and doubles as the agent's directory name.

use rand::Rng;

use crate::error::{Error, Result};

const SUFFIX_LEN: usize = 6;
const MAX_ATTEMPTS: usize = 10;
const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Kebab-case a display name: lowercase, alphanumerics kept, everything
/// else collapsed into single dashes.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_end_matches('-').to_string();
    if trimmed.is_empty() {
        "agent".to_string()
    } else {
        trimmed
    }
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..SUFFIX_LEN)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}

/// Generate a unique slug for `name`, retrying the random suffix on
/// collision up to 10 times.
pub fn generate_slug<F>(name: &str, exists: F) -> Result<String>
where
    F: Fn(&str) -> bool,
{
    let base = slugify(name);
    for _ in 0..MAX_ATTEMPTS {
        let candidate = format!("{}-{}", base, random_suffix());
        if !exists(&candidate) {
            return Ok(candidate);
        }
    }
    Err(Error::Internal(format!(
        "could not find a free slug for '{}' after {} attempts",
        name, MAX_ATTEMPTS
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_basic() {
        assert_eq!(slugify("Research Assistant"), "research-assistant");
        assert_eq!(slugify("My  Agent!!"), "my-agent");
        assert_eq!(slugify("Émail Bot"), "mail-bot");
    }

    #[test]
    fn test_slugify_empty_falls_back() {
        assert_eq!(slugify(""), "agent");
        assert_eq!(slugify("!!!"), "agent");
    }

    #[test]
    fn test_generate_slug_has_suffix() {
        let slug = generate_slug("Mail Bot", |_| false).unwrap();
        assert!(slug.starts_with("mail-bot-"));
        assert_eq!(slug.len(), "mail-bot-".len() + SUFFIX_LEN);
    }

    #[test]
    fn test_generate_slug_retries_on_collision() {
        use std::cell::RefCell;
        let taken = RefCell::new(std::collections::HashSet::new());
        let first = generate_slug("bot", |_| false).unwrap();
        taken.borrow_mut().insert(first.clone());

        // Reject the first couple of candidates, then accept.
        let rejections = RefCell::new(0);
        let slug = generate_slug("bot", |candidate| {
            let mut count = rejections.borrow_mut();
            if *count < 2 {
                *count += 1;
                return true;
            }
            taken.borrow().contains(candidate)
        })
        .unwrap();
        assert_ne!(slug, first);
    }

    #[test]
    fn test_generate_slug_gives_up_after_ten() {
        let err = generate_slug("bot", |_| true).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
