use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::Reply;
use crate::config::OtaConfig;

/// HTTP Basic authentication for the upload page
#[derive(Clone)]
pub struct BasicAuth {
    expected: String,
    realm: String,
}

impl BasicAuth {
    pub fn new(user: &str, password: &str, realm: &str) -> Self {
        Self {
            expected: format!("{}:{}", user, password),
            realm: realm.to_string(),
        }
    }

    pub fn from_config(config: &OtaConfig) -> Self {
        Self::new(&config.auth_user, &config.auth_password, &config.auth_realm)
    }

    /// Checks an `Authorization` header value
    pub fn check(&self, authorization: Option<&str>) -> bool {
        let Some(encoded) = authorization.and_then(|v| v.strip_prefix("Basic ")) else {
            return false;
        };
        match STANDARD.decode(encoded.trim()) {
            Ok(decoded) => decoded == self.expected.as_bytes(),
            Err(_) => false,
        }
    }

    /// 401 with a `WWW-Authenticate` challenge for this realm
    pub fn challenge(&self) -> Reply {
        Reply::text(401, "Unauthorized")
            .with_header("WWW-Authenticate", format!("Basic realm=\"{}\"", self.realm))
    }

    /// Header value a client would send, used by tooling and tests
    pub fn header_value(user: &str, password: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{}:{}", user, password)))
    }
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth").field("realm", &self.realm).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_matching_credentials_only() {
        let auth = BasicAuth::new("admin", "admin", "Hello");
        assert!(auth.check(Some("Basic YWRtaW46YWRtaW4=")));
        assert!(auth.check(Some(&BasicAuth::header_value("admin", "admin"))));
        assert!(!auth.check(Some(&BasicAuth::header_value("admin", "wrong"))));
        assert!(!auth.check(Some("Bearer YWRtaW46YWRtaW4=")));
        assert!(!auth.check(Some("Basic !!notbase64")));
        assert!(!auth.check(None));
    }

    #[test]
    fn challenge_names_the_realm() {
        let reply = BasicAuth::new("admin", "admin", "Hello").challenge();
        assert_eq!(reply.status, 401);
        assert_eq!(reply.header("WWW-Authenticate"), Some("Basic realm=\"Hello\""));
    }
}
