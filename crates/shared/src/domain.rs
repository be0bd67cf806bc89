use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);

/// Prefix that namespaces client-issued optimistic message ids away from
/// server-issued ones.
const LOCAL_MESSAGE_ID_PREFIX: &str = "local-";

impl MessageId {
    /// A fresh client-issued id for an optimistic message. Superseded by the
    /// server-issued record on the next history refetch.
    pub fn local() -> Self {
        Self(format!("{LOCAL_MESSAGE_ID_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_MESSAGE_ID_PREFIX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Online,
    Offline,
    Away,
}

/// Subject ids from the identity provider contain separator characters
/// (`github|204113180`, `auth0|abc.def`) that are not valid inside a channel
/// name. Everything outside `[A-Za-z0-9_-]` becomes `_`.
pub fn sanitized_channel_suffix(user_id: &UserId) -> String {
    user_id
        .0
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// The single private channel all of a user's conversations multiplex over.
/// Keyed to the local user, not the conversation partner.
pub fn private_channel_name(user_id: &UserId) -> String {
    format!("private-user-{}", sanitized_channel_suffix(user_id))
}
