//! Password hashing and strength rules.

use serde::Serialize;

const MIN_LENGTH: usize = 8;
const STRONG_LENGTH: usize = 12;
pub const SPECIAL_CHARS: &str = "!@#$%^&*()_+-=[]{}|;:,.<>?";

#[derive(Debug, Clone)]
pub struct PasswordService {
    rounds: u32,
}

impl PasswordService {
    pub fn new(rounds: u32) -> Self {
        Self { rounds }
    }

    pub fn hash_password(&self, password: &str) -> Result<String, bcrypt::BcryptError> {
        bcrypt::hash(password, self.rounds).map_err(|e| {
            tracing::error!(error = %e, "Password hashing failed");
            e
        })
    }

    /// False for a mismatch and for a hash that cannot be parsed.
    pub fn verify_password(&self, password: &str, hash: &str) -> bool {
        match bcrypt::verify(password, hash) {
            Ok(matches) => matches,
            Err(e) => {
                tracing::error!(error = %e, "Password verification failed");
                false
            }
        }
    }

    /// True when the stored cost is below the configured one or unreadable.
    pub fn needs_rehash(&self, hash: &str) -> bool {
        // $2b$<cost>$<salt+hash>
        match hash.split('$').nth(2).map(str::parse::<u32>) {
            Some(Ok(cost)) => cost < self.rounds,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strength {
    Weak,
    Medium,
    Strong,
}

#[derive(Debug, Clone, Serialize)]
pub struct PasswordStrength {
    pub valid: bool,
    pub errors: Vec<String>,
    pub strength: Strength,
    pub score: u8,
}

pub fn validate_password_strength(password: &str) -> PasswordStrength {
    let length = password.chars().count();
    let has_upper = password.chars().any(char::is_uppercase);
    let has_lower = password.chars().any(char::is_lowercase);
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_special = password.chars().any(|c| SPECIAL_CHARS.contains(c));

    let mut errors = Vec::new();
    if length < MIN_LENGTH {
        errors.push(format!("Password must be at least {MIN_LENGTH} characters long"));
    }
    if !has_upper {
        errors.push("Password must contain at least one uppercase letter".to_string());
    }
    if !has_lower {
        errors.push("Password must contain at least one lowercase letter".to_string());
    }
    if !has_digit {
        errors.push("Password must contain at least one number".to_string());
    }
    if !has_special {
        errors.push("Password must contain at least one special character".to_string());
    }

    let score = [
        length >= MIN_LENGTH,
        length >= STRONG_LENGTH,
        has_upper,
        has_lower,
        has_digit,
        has_special,
    ]
    .iter()
    .filter(|passed| **passed)
    .count() as u8;

    let strength = match score {
        5.. => Strength::Strong,
        4 => Strength::Medium,
        _ => Strength::Weak,
    };

    PasswordStrength {
        valid: errors.is_empty(),
        errors,
        strength,
        score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify() {
        let service = PasswordService::new(4);
        let hash = service.hash_password("Correct#Horse9").unwrap();
        assert!(hash.starts_with("$2"));
        assert!(service.verify_password("Correct#Horse9", &hash));
        assert!(!service.verify_password("correct#horse9", &hash));
    }

    #[test]
    fn malformed_hash_never_verifies() {
        let service = PasswordService::new(4);
        assert!(!service.verify_password("anything", "not-a-bcrypt-hash"));
    }

    #[test]
    fn rehash_when_cost_increases() {
        let cheap = PasswordService::new(4);
        let hash = cheap.hash_password("Sup3r$ecret").unwrap();
        assert!(!cheap.needs_rehash(&hash));
        assert!(PasswordService::new(5).needs_rehash(&hash));
        assert!(cheap.needs_rehash("garbage"));
        assert!(cheap.needs_rehash("$2b$xx$abc"));
    }

    #[test]
    fn strong_password_passes() {
        let result = validate_password_strength("Correct#Horse9Battery");
        assert!(result.valid);
        assert!(result.errors.is_empty());
        assert_eq!(result.score, 6);
        assert_eq!(result.strength, Strength::Strong);
    }

    #[test]
    fn each_missing_class_is_reported() {
        let result = validate_password_strength("abc");
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 4);
        assert!(result.errors.iter().any(|e| e.contains("at least 8 characters")));
        assert!(result.errors.iter().any(|e| e.contains("uppercase")));
        assert!(result.errors.iter().any(|e| e.contains("number")));
        assert!(result.errors.iter().any(|e| e.contains("special")));
        assert_eq!(result.score, 1);
        assert_eq!(result.strength, Strength::Weak);
    }

    #[test]
    fn medium_strength_boundary() {
        // length >= 8, lower, digit, special: four points
        let result = validate_password_strength("abcdef1!");
        assert_eq!(result.score, 4);
        assert_eq!(result.strength, Strength::Medium);
        assert!(!result.valid);
    }
}
