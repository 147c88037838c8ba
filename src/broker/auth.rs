// Opaque auth collaborators.
//
// Token validation and device ownership live in external services; the
// brokers only need these two capabilities. Static map implementations cover
// tests and single-box deployments, `OpenAccess` covers local development.

use std::collections::HashMap;

/// Bearer-token validation: `validate(token)` yields the authoritative user
/// id, or `None` for an invalid token.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> Option<String>;
}

/// Device ownership lookup: which user a registered device belongs to.
pub trait DeviceDirectory: Send + Sync {
    fn owner_of(&self, device_id: &str) -> Option<String>;
}

/// Fixed token-to-user map.
#[derive(Default)]
pub struct StaticTokenValidator {
    tokens: HashMap<String, String>,
}

impl StaticTokenValidator {
    pub fn new(tokens: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

impl TokenValidator for StaticTokenValidator {
    fn validate(&self, token: &str) -> Option<String> {
        self.tokens.get(token).cloned()
    }
}

/// Fixed device-to-user map.
#[derive(Default)]
pub struct StaticDeviceDirectory {
    devices: HashMap<String, String>,
}

impl StaticDeviceDirectory {
    pub fn new(devices: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            devices: devices.into_iter().collect(),
        }
    }
}

impl DeviceDirectory for StaticDeviceDirectory {
    fn owner_of(&self, device_id: &str) -> Option<String> {
        self.devices.get(device_id).cloned()
    }
}

/// Development mode: any token is valid and every device belongs to the same
/// pseudo-user, so ownership checks always pass.
pub struct OpenAccess;

impl TokenValidator for OpenAccess {
    fn validate(&self, _token: &str) -> Option<String> {
        Some("anonymous".to_string())
    }
}

impl DeviceDirectory for OpenAccess {
    fn owner_of(&self, _device_id: &str) -> Option<String> {
        Some("anonymous".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_validator_resolves_known_tokens() {
        let v = StaticTokenValidator::new([("tok".to_string(), "alice".to_string())]);
        assert_eq!(v.validate("tok"), Some("alice".to_string()));
        assert_eq!(v.validate("nope"), None);
    }

    #[test]
    fn static_directory_resolves_known_devices() {
        let d = StaticDeviceDirectory::new([("dev-1".to_string(), "alice".to_string())]);
        assert_eq!(d.owner_of("dev-1"), Some("alice".to_string()));
        assert_eq!(d.owner_of("dev-2"), None);
    }

    #[test]
    fn open_access_accepts_anything() {
        assert_eq!(OpenAccess.validate("whatever"), OpenAccess.owner_of("any"));
    }
}
