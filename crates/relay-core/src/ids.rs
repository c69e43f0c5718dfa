use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(TenantId, "tenant");
branded_id!(SessionId, "sess");
branded_id!(MessageId, "msg");
branded_id!(FormId, "form");
branded_id!(InvocationId, "inv");

/// The addressing unit for sessions: one tenant, one session.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionKey {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
}

impl SessionKey {
    pub fn new(tenant_id: TenantId, session_id: SessionId) -> Self {
        Self {
            tenant_id,
            session_id,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_their_prefix() {
        assert!(TenantId::new().as_str().starts_with("tenant_"));
        assert!(SessionId::new().as_str().starts_with("sess_"));
        assert!(MessageId::new().as_str().starts_with("msg_"));
        assert!(FormId::new().as_str().starts_with("form_"));
        assert!(InvocationId::new().as_str().starts_with("inv_"));
    }

    #[test]
    fn ids_are_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let id = FormId::new();
        let parsed: FormId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn serde_roundtrip_is_transparent() {
        let id = SessionId::from_raw("sess_custom");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"sess_custom\"");
        let parsed: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn message_ids_are_monotonic() {
        let ids: Vec<MessageId> = (0..100).map(|_| MessageId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0].as_str() < w[1].as_str(), "{} >= {}", w[0], w[1]);
        }
    }

    #[test]
    fn session_key_display() {
        let key = SessionKey::new(
            TenantId::from_raw("tenant_a"),
            SessionId::from_raw("sess_1"),
        );
        assert_eq!(key.to_string(), "tenant_a/sess_1");
    }
}
