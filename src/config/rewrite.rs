//! Path rewrite rules
//!
//! Rewrites accept two document shapes:
//!
//! ```json
//! { "^/v1/anthropic-proxy": "/v1" }
//! [["^/api/old", "/api/new"], ["^/api", "/v2"]]
//! ```
//!
//! Both are kept in document order internally; the array form exists so
//! configs can state the order explicitly instead of leaning on JSON object
//! key order.

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use std::fmt;

/// Ordered list of `(pattern, replacement)` pairs. First matching pattern wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathRewrite(pub Vec<(String, String)>);

impl PathRewrite {
    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.0.iter()
    }
}

impl<'de> Deserialize<'de> for PathRewrite {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct RewriteVisitor;

        impl<'de> Visitor<'de> for RewriteVisitor {
            type Value = PathRewrite;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a pattern→replacement map or a list of [pattern, replacement] pairs")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut pairs = Vec::new();
                while let Some((pattern, replacement)) = map.next_entry::<String, String>()? {
                    pairs.push((pattern, replacement));
                }
                Ok(PathRewrite(pairs))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut pairs = Vec::new();
                while let Some(pair) = seq.next_element::<Vec<String>>()? {
                    if pair.len() != 2 {
                        return Err(de::Error::invalid_length(pair.len(), &"a [pattern, replacement] pair"));
                    }
                    let mut it = pair.into_iter();
                    let pattern = it.next().unwrap_or_default();
                    let replacement = it.next().unwrap_or_default();
                    pairs.push((pattern, replacement));
                }
                Ok(PathRewrite(pairs))
            }
        }

        deserializer.deserialize_any(RewriteVisitor)
    }
}
