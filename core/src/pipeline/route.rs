use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use validator::{Validate, ValidationErrors};

use super::identity::Role;
use crate::rate_limit::RateLimitClass;
use crate::sanitizer::SanitizeOptions;

/// Structural check applied to a payload before sanitization.
/// `Err` carries field-level details for the 400 body.
pub trait PayloadSchema: Send + Sync {
    fn validate(&self, payload: &Value) -> Result<(), Value>;
}

/// Schema backed by a `validator`-derived request type.
pub struct ValidatedSchema<T>(PhantomData<fn() -> T>);

impl<T> ValidatedSchema<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for ValidatedSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PayloadSchema for ValidatedSchema<T>
where
    T: DeserializeOwned + Validate,
{
    fn validate(&self, payload: &Value) -> Result<(), Value> {
        let parsed: T = serde_json::from_value(payload.clone())
            .map_err(|e| json!({ "body": [e.to_string()] }))?;
        parsed.validate().map_err(|errors| field_errors(&errors))
    }
}

pub fn field_errors(errors: &ValidationErrors) -> Value {
    let mut fields: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (field, list) in errors.field_errors() {
        let messages = list
            .iter()
            .map(|error| match &error.message {
                Some(message) => message.to_string(),
                None => error.code.to_string(),
            })
            .collect();
        fields.insert(field.to_string(), messages);
    }
    json!(fields)
}

/// Per-route guard configuration.
#[derive(Clone)]
pub struct RouteConfig {
    pub require_auth: bool,
    pub required_roles: Vec<Role>,
    pub rate_limit_class: RateLimitClass,
    /// Also count authenticated callers under `user:<id>`.
    pub rate_limit_per_user: bool,
    pub validate_schema: Option<Arc<dyn PayloadSchema>>,
    pub sanitize_input: bool,
    pub sanitize_options: SanitizeOptions,
    pub require_csrf: bool,
    pub require_2fa: bool,
    pub log_access: bool,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            require_auth: false,
            required_roles: Vec::new(),
            rate_limit_class: RateLimitClass::Api,
            rate_limit_per_user: false,
            validate_schema: None,
            sanitize_input: true,
            sanitize_options: SanitizeOptions::default(),
            require_csrf: true,
            require_2fa: false,
            log_access: true,
        }
    }
}

impl fmt::Debug for RouteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteConfig")
            .field("require_auth", &self.require_auth)
            .field("required_roles", &self.required_roles)
            .field("rate_limit_class", &self.rate_limit_class)
            .field("rate_limit_per_user", &self.rate_limit_per_user)
            .field("validate_schema", &self.validate_schema.is_some())
            .field("sanitize_input", &self.sanitize_input)
            .field("require_csrf", &self.require_csrf)
            .field("require_2fa", &self.require_2fa)
            .field("log_access", &self.log_access)
            .finish()
    }
}

impl RouteConfig {
    pub fn public(class: RateLimitClass) -> Self {
        Self {
            rate_limit_class: class,
            ..Self::default()
        }
    }

    pub fn authenticated(class: RateLimitClass) -> Self {
        Self {
            require_auth: true,
            rate_limit_class: class,
            ..Self::default()
        }
    }

    /// Restrict to the given roles; implies authentication.
    pub fn with_roles(mut self, roles: &[Role]) -> Self {
        self.require_auth = true;
        self.required_roles = roles.to_vec();
        self
    }

    /// Apply the class limit to the user as well as the client address.
    pub fn with_user_rate_limit(mut self) -> Self {
        self.require_auth = true;
        self.rate_limit_per_user = true;
        self
    }

    pub fn with_schema<T>(mut self) -> Self
    where
        T: DeserializeOwned + Validate + 'static,
    {
        self.validate_schema = Some(Arc::new(ValidatedSchema::<T>::new()));
        self
    }

    pub fn with_sanitize_options(mut self, options: SanitizeOptions) -> Self {
        self.sanitize_options = options;
        self
    }

    pub fn with_2fa(mut self) -> Self {
        self.require_auth = true;
        self.require_2fa = true;
        self
    }

    pub fn without_csrf(mut self) -> Self {
        self.require_csrf = false;
        self
    }

    pub fn without_sanitization(mut self) -> Self {
        self.sanitize_input = false;
        self
    }

    pub fn without_access_log(mut self) -> Self {
        self.log_access = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize, Validate)]
    struct Pledge {
        #[validate(length(min = 2, message = "Name is too short"))]
        name: String,
        #[validate(range(min = 1, max = 4))]
        units: u32,
    }

    #[test]
    fn test_schema_reports_field_errors() {
        let schema = ValidatedSchema::<Pledge>::new();
        assert!(schema.validate(&json!({ "name": "Rafi", "units": 2 })).is_ok());

        let details = schema.validate(&json!({ "name": "R", "units": 9 })).unwrap_err();
        assert_eq!(details["name"][0], "Name is too short");
        assert_eq!(details["units"][0], "range");

        let shape = schema.validate(&json!({ "name": "Rafi" })).unwrap_err();
        assert!(shape["body"][0].as_str().unwrap().contains("units"));
    }

    #[test]
    fn test_builders() {
        let config = RouteConfig::public(RateLimitClass::FormSubmission)
            .with_roles(&[Role::Admin])
            .with_2fa()
            .with_user_rate_limit()
            .without_csrf();
        assert!(config.require_auth);
        assert!(config.rate_limit_per_user);
        assert!(config.require_2fa);
        assert!(!config.require_csrf);
        assert_eq!(config.required_roles, vec![Role::Admin]);
    }
}
