// Password strength scoring and Argon2id hashing
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use chrono::{DateTime, Utc};
use once_cell::sync::{Lazy, OnceCell};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

use crate::config::PasswordSettings;
use crate::error::PasswordError;

const DECOY_PASSWORD: &str = "bloodlink-decoy-credential";

static COMMON_PASSWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "password", "password1", "password123", "passw0rd", "123456", "1234567", "12345678",
        "123456789", "1234567890", "qwerty", "qwerty123", "qwertyuiop", "abc123", "111111",
        "123123", "letmein", "welcome", "welcome1", "monkey", "dragon", "football", "baseball",
        "iloveyou", "admin", "admin123", "login", "master", "sunshine", "princess", "shadow",
        "superman", "trustno1", "changeme", "secret", "donor", "blood", "bloodlink",
        "p@ssw0rd", "p@ssword1", "zaq12wsx",
    ]
    .into_iter()
    .collect()
});

/// Identity details a password must not contain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PasswordStrength {
    VeryWeak,
    Weak,
    Fair,
    Good,
    Strong,
}

impl PasswordStrength {
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=29 => PasswordStrength::VeryWeak,
            30..=49 => PasswordStrength::Weak,
            50..=69 => PasswordStrength::Fair,
            70..=89 => PasswordStrength::Good,
            _ => PasswordStrength::Strong,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PasswordValidation {
    pub is_valid: bool,
    pub score: u8,
    pub errors: Vec<String>,
    pub suggestions: Vec<String>,
    pub strength: PasswordStrength,
}

#[derive(Debug, Clone)]
pub struct PasswordPolicy {
    settings: PasswordSettings,
    // Hash compared against when no account exists; built on first use.
    decoy: Arc<OnceCell<String>>,
}

impl PasswordPolicy {
    pub fn new(settings: &PasswordSettings) -> Self {
        Self {
            settings: settings.clone(),
            decoy: Arc::new(OnceCell::new()),
        }
    }

    pub fn settings(&self) -> &PasswordSettings {
        &self.settings
    }

    /// Score a candidate password. Any missing mandatory category, a
    /// common password, or an over-long repeated run makes it invalid.
    pub fn validate(&self, password: &str, user_info: Option<&UserInfo>) -> PasswordValidation {
        let mut score: u32 = 0;
        let mut errors = Vec::new();
        let mut suggestions = Vec::new();
        let length = password.chars().count();

        if length >= self.settings.min_length {
            score += 20;
        } else {
            errors.push(format!(
                "Password must be at least {} characters long",
                self.settings.min_length
            ));
        }
        if length < 12 {
            suggestions.push("Use 12 or more characters for a stronger password".to_string());
        }

        let categories = [
            (
                password.chars().any(|c| c.is_uppercase()),
                "Password must contain at least one uppercase letter",
            ),
            (
                password.chars().any(|c| c.is_lowercase()),
                "Password must contain at least one lowercase letter",
            ),
            (
                password.chars().any(|c| c.is_ascii_digit()),
                "Password must contain at least one number",
            ),
            (
                password
                    .chars()
                    .any(|c| !c.is_alphanumeric() && !c.is_whitespace()),
                "Password must contain at least one special character",
            ),
        ];
        let mut missing_category = false;
        for (present, message) in categories {
            if present {
                score += 15;
            } else {
                missing_category = true;
                errors.push(message.to_string());
            }
        }
        if missing_category {
            suggestions
                .push("Mix upper and lower case letters, numbers and symbols".to_string());
        }

        if longest_run(password) <= self.settings.max_repeated_chars {
            score += 10;
        } else {
            errors.push(format!(
                "Password must not repeat the same character more than {} times in a row",
                self.settings.max_repeated_chars
            ));
        }

        if COMMON_PASSWORDS.contains(password.to_lowercase().as_str()) {
            errors.push("Password is too common".to_string());
            suggestions.push("Avoid common passwords and dictionary words".to_string());
        } else {
            score += 10;
        }

        let distinct = password.chars().collect::<HashSet<_>>().len();
        if length >= self.settings.min_length && distinct * 10 >= length * 6 {
            score += 10;
        } else {
            suggestions.push("Use a wider variety of characters".to_string());
        }

        if let Some(info) = user_info {
            if contains_personal_info(password, info) {
                errors.push("Password must not contain your name, email or phone number".to_string());
                score = 0;
            }
        }

        let score = score.min(100) as u8;
        PasswordValidation {
            is_valid: errors.is_empty(),
            score,
            errors,
            suggestions,
            strength: PasswordStrength::from_score(score),
        }
    }

    fn hasher(&self) -> Result<Argon2<'static>, PasswordError> {
        let params = Params::new(
            self.settings.hash_memory_kib,
            self.settings.hash_iterations,
            self.settings.hash_parallelism,
            None,
        )
        .map_err(|e| PasswordError::Hashing(e.to_string()))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }

    pub fn hash(&self, password: &str) -> Result<String, PasswordError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .hasher()?
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| PasswordError::Hashing(e.to_string()))?;
        Ok(hash.to_string())
    }

    /// Cost parameters are read from the PHC string, so hashes made under
    /// older settings still verify.
    pub fn verify(&self, password: &str, hash: &str) -> bool {
        let parsed = match PasswordHash::new(hash) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Stored password hash is malformed");
                return false;
            }
        };
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }

    /// Whether `password` matches any of the given hashes.
    pub fn matches_any<'a>(&self, password: &str, hashes: impl IntoIterator<Item = &'a String>) -> bool {
        hashes.into_iter().any(|hash| self.verify(password, hash))
    }

    /// `hash` on the blocking pool, keeping Argon2 off the async workers.
    pub async fn hash_offloaded(&self, password: &str) -> Result<String, PasswordError> {
        let policy = self.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || policy.hash(&password))
            .await
            .map_err(|e| PasswordError::Hashing(e.to_string()))?
    }

    pub async fn verify_offloaded(&self, password: &str, hash: &str) -> bool {
        let policy = self.clone();
        let (password, hash) = (password.to_string(), hash.to_string());
        tokio::task::spawn_blocking(move || policy.verify(&password, &hash))
            .await
            .unwrap_or(false)
    }

    pub async fn matches_any_offloaded(&self, password: &str, hashes: Vec<String>) -> bool {
        let policy = self.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || policy.matches_any(&password, &hashes))
            .await
            .unwrap_or(false)
    }

    /// Runs one full verification against a throwaway hash so a missing
    /// account costs the same as a wrong password.
    pub async fn verify_decoy(&self, password: &str) {
        let policy = self.clone();
        let password = password.to_string();
        let spent = tokio::task::spawn_blocking(move || {
            match policy.decoy.get_or_try_init(|| policy.hash(DECOY_PASSWORD)) {
                Ok(decoy) => policy.verify(&password, decoy),
                Err(e) => {
                    warn!(error = %e, "Decoy password hash unavailable");
                    false
                }
            }
        })
        .await;
        if spent.is_err() {
            warn!("Decoy verification task failed");
        }
    }

    #[cfg(test)]
    pub(crate) fn decoy_ready(&self) -> bool {
        self.decoy.get().is_some()
    }

    pub fn is_expired(&self, changed_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - changed_at > self.settings.max_age()
    }
}

fn longest_run(password: &str) -> usize {
    let mut longest = 0;
    let mut current = 0;
    let mut previous = None;
    for c in password.chars() {
        if Some(c) == previous {
            current += 1;
        } else {
            current = 1;
            previous = Some(c);
        }
        longest = longest.max(current);
    }
    longest
}

fn contains_personal_info(password: &str, info: &UserInfo) -> bool {
    let lowered = password.to_lowercase();

    let name_parts = info
        .name
        .iter()
        .flat_map(|name| name.split_whitespace())
        .map(str::to_lowercase)
        .filter(|part| part.chars().count() >= 3);
    let email_local = info
        .email
        .as_deref()
        .and_then(|email| email.split('@').next())
        .map(str::to_lowercase)
        .filter(|local| local.chars().count() >= 3);

    if name_parts.chain(email_local).any(|part| lowered.contains(&part)) {
        return true;
    }

    if let Some(phone) = &info.phone {
        let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
        let password_digits: String = password.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() >= 6 {
            let tail = &digits[digits.len() - 6..];
            return password_digits.contains(tail);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn fast_settings() -> PasswordSettings {
        PasswordSettings {
            hash_memory_kib: 256,
            hash_iterations: 1,
            ..PasswordSettings::default()
        }
    }

    #[test]
    fn test_common_password_lists_every_missing_category() {
        let result = PasswordPolicy::new(&PasswordSettings::default()).validate("password", None);

        assert!(!result.is_valid);
        let joined = result.errors.join("\n");
        assert!(joined.contains("uppercase"));
        assert!(joined.contains("number"));
        assert!(joined.contains("special"));
        assert!(joined.contains("too common"));
        assert!(!joined.contains("lowercase"));
        assert!(result.score < 70);
    }

    #[test]
    fn test_strong_password_scores_high() {
        let info = UserInfo {
            name: Some("Rahima Akter".to_string()),
            email: Some("rahima@example.org".to_string()),
            phone: Some("+880 1711-223344".to_string()),
        };
        let result =
            PasswordPolicy::new(&PasswordSettings::default()).validate("Vq7#mLp2!xRz9&Kd", Some(&info));

        assert!(result.is_valid, "{:?}", result.errors);
        assert!(result.score >= 90);
        assert_eq!(result.strength, PasswordStrength::Strong);
    }

    #[test]
    fn test_personal_info_rejected_outright() {
        let policy = PasswordPolicy::new(&PasswordSettings::default());
        let info = UserInfo {
            name: Some("Rahima Akter".to_string()),
            email: Some("donor.one@example.org".to_string()),
            phone: Some("+880 1711-223344".to_string()),
        };

        for candidate in ["Rahima#2024xQ", "Donor.One!9Zq", "Zx!223344aQ#"] {
            let result = policy.validate(candidate, Some(&info));
            assert!(!result.is_valid, "{} should be rejected", candidate);
            assert_eq!(result.score, 0);
        }
    }

    #[test]
    fn test_repeated_run_is_rejected() {
        let result = PasswordPolicy::new(&PasswordSettings::default()).validate("Aaaa#1bcdEf", None);
        assert!(!result.is_valid);
        assert!(result.errors.iter().any(|e| e.contains("repeat")));
        assert_eq!(longest_run("Aaaa"), 3);
    }

    #[test]
    fn test_strength_buckets() {
        assert_eq!(PasswordStrength::from_score(29), PasswordStrength::VeryWeak);
        assert_eq!(PasswordStrength::from_score(30), PasswordStrength::Weak);
        assert_eq!(PasswordStrength::from_score(69), PasswordStrength::Fair);
        assert_eq!(PasswordStrength::from_score(89), PasswordStrength::Good);
        assert_eq!(PasswordStrength::from_score(90), PasswordStrength::Strong);
    }

    #[test]
    fn test_hash_and_verify() {
        let policy = PasswordPolicy::new(&fast_settings());
        let hash = policy.hash("Vq7#mLp2!xRz9&Kd").unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(!hash.contains("Vq7#mLp2"));
        assert!(policy.verify("Vq7#mLp2!xRz9&Kd", &hash));
        assert!(!policy.verify("Vq7#mLp2!xRz9&Ke", &hash));
        assert!(!policy.verify("anything", "not-a-phc-string"));
    }

    #[tokio::test]
    async fn test_offloaded_hashing_and_decoy() {
        let policy = PasswordPolicy::new(&fast_settings());
        let hash = policy.hash_offloaded("Vq7#mLp2!xRz9&Kd").await.unwrap();

        assert!(policy.verify_offloaded("Vq7#mLp2!xRz9&Kd", &hash).await);
        assert!(!policy.verify_offloaded("wrong", &hash).await);
        assert!(policy.matches_any_offloaded("Vq7#mLp2!xRz9&Kd", vec!["x".to_string(), hash]).await);

        assert!(policy.decoy.get().is_none());
        policy.verify_decoy("Vq7#mLp2!xRz9&Kd").await;
        let decoy = policy.decoy.get().cloned().unwrap();
        assert!(decoy.starts_with("$argon2id$"));

        // Clones share the decoy so it is built once per policy.
        policy.clone().verify_decoy("other").await;
        assert_eq!(policy.decoy.get(), Some(&decoy));
    }

    #[test]
    fn test_expiry() {
        let policy = PasswordPolicy::new(&PasswordSettings::default());
        let now = Utc::now();
        assert!(!policy.is_expired(now - Duration::days(89), now));
        assert!(policy.is_expired(now - Duration::days(91), now));
    }
}
