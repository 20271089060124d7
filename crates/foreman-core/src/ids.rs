//! Branded string ids for the chat-audit records. Each type carries its own
//! prefix; the UUIDv7 payload keeps ids of one brand ordered by creation
//! time, which the audit queries rely on as a tie-breaker.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $brand:literal) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const BRAND: &'static str = $brand;

            /// Mint a fresh id under this type's brand.
            pub fn new() -> Self {
                Self(format!("{}_{}", Self::BRAND, Uuid::now_v7()))
            }

            /// Wrap an externally produced id verbatim. Vendor adapters hand
            /// in their own chat ids, so no brand check is applied here.
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the id carries this type's own brand prefix, as
            /// opposed to a foreign adapter's scheme.
            pub fn is_branded(&self) -> bool {
                self.0.starts_with(concat!($brand, "_"))
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
            type Err = String;

            /// Parsing is strict about the brand; use [`Self::from_raw`] for
            /// foreign ids.
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let id = Self(s.to_owned());
                if id.is_branded() {
                    Ok(id)
                } else {
                    Err(format!("expected a {}_ id, got: {s}", $brand))
                }
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(ChatId, "chat");
branded_id!(MessageId, "msg");
branded_id!(ToolCallId, "toolu");
branded_id!(ModelId, "model");
