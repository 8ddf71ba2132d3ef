//! RFC 6238 time-based one-time passwords (HMAC-SHA1).

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use url::Url;

use crate::csrf::constant_time_eq;

type HmacSha1 = Hmac<Sha1>;

const SECRET_BYTES: usize = 20;

#[derive(Debug, Clone)]
pub struct Totp {
    secret: Vec<u8>,
    digits: u32,
    period_secs: u64,
}

impl Totp {
    pub fn new(secret: Vec<u8>, digits: u32, period_secs: u64) -> Self {
        Self {
            secret,
            digits: digits.clamp(6, 8),
            period_secs: period_secs.max(1),
        }
    }

    /// Decode a base32 secret as shown to users. Padding, spaces and case
    /// are ignored.
    pub fn from_base32(encoded: &str, digits: u32, period_secs: u64) -> Option<Self> {
        let normalized: String = encoded
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '=')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        let secret = BASE32_NOPAD.decode(normalized.as_bytes()).ok()?;
        if secret.is_empty() {
            return None;
        }
        Some(Self::new(secret, digits, period_secs))
    }

    pub fn generate_secret() -> Vec<u8> {
        let mut secret = vec![0u8; SECRET_BYTES];
        rand::thread_rng().fill_bytes(&mut secret);
        secret
    }

    pub fn encode_secret(secret: &[u8]) -> String {
        BASE32_NOPAD.encode(secret)
    }

    fn counter_at(&self, unix_secs: i64) -> Option<u64> {
        u64::try_from(unix_secs).ok().map(|t| t / self.period_secs)
    }

    fn hotp(&self, counter: u64) -> Option<String> {
        let mut mac = HmacSha1::new_from_slice(&self.secret).ok()?;
        mac.update(&counter.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        let binary = (u32::from(digest[offset] & 0x7f) << 24)
            | (u32::from(digest[offset + 1]) << 16)
            | (u32::from(digest[offset + 2]) << 8)
            | u32::from(digest[offset + 3]);
        let code = binary % 10u32.pow(self.digits);
        Some(format!("{:0width$}", code, width = self.digits as usize))
    }

    pub fn code_at(&self, unix_secs: i64) -> Option<String> {
        self.counter_at(unix_secs).and_then(|counter| self.hotp(counter))
    }

    /// Accepts codes from `skew_steps` periods either side of `unix_secs`.
    pub fn verify(&self, code: &str, unix_secs: i64, skew_steps: u32) -> bool {
        let code = code.trim();
        if code.len() != self.digits as usize || !code.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
        let Some(current) = self.counter_at(unix_secs) else {
            return false;
        };

        let skew = u64::from(skew_steps);
        let first = current.saturating_sub(skew);
        let last = current.saturating_add(skew);
        let mut matched = false;
        for counter in first..=last {
            if let Some(expected) = self.hotp(counter) {
                matched |= constant_time_eq(&expected, code);
            }
        }
        matched
    }

    /// `otpauth://` URI for authenticator apps, usually rendered as a QR code.
    pub fn provisioning_uri(&self, issuer: &str, account: &str) -> String {
        let label = format!("{}:{}", issuer, account);
        let encoded_label: String = url::form_urlencoded::byte_serialize(label.as_bytes())
            .collect::<String>()
            .replace('+', "%20");

        match Url::parse(&format!("otpauth://totp/{}", encoded_label)) {
            Ok(mut uri) => {
                uri.query_pairs_mut()
                    .append_pair("secret", &Self::encode_secret(&self.secret))
                    .append_pair("issuer", issuer)
                    .append_pair("algorithm", "SHA1")
                    .append_pair("digits", &self.digits.to_string())
                    .append_pair("period", &self.period_secs.to_string());
                uri.to_string()
            }
            Err(_) => format!(
                "otpauth://totp/{}?secret={}",
                encoded_label,
                Self::encode_secret(&self.secret)
            ),
        }
    }
}
