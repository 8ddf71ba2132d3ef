// Credential policy, lockout and second-factor authentication
pub mod account;
pub mod locks;
pub mod password;
pub mod profile;
pub mod totp;
pub mod two_factor;

pub use account::{AccountSecurity, LockStatus, LoginOutcome, PasswordChange};
pub use locks::ProfileLocks;
pub use password::{PasswordPolicy, PasswordStrength, PasswordValidation, UserInfo};
pub use profile::{LoginAttempt, UserSecurityProfile};
pub use totp::Totp;
pub use two_factor::{TwoFactorAuthenticator, TwoFactorSetup};
