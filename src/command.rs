//! Parameter maps shared by the router core and the REST transport.
//!
//! The wire format distinguishes `=key=value` attribute words from
//! `?key=value` query/filter words (§4.I); [`Params`] keeps that
//! distinction all the way up from the socket sentence builder to the
//! REST `.query` array, rather than collapsing both into one string map
//! and losing which is which.

use std::collections::BTreeMap;

/// Attribute and query parameters for one router operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    pub attributes: BTreeMap<String, String>,
    /// Raw `key=value` filter predicates, passed through verbatim per
    /// §4.I ("filters passed through verbatim") — not re-escaped, only
    /// given the mechanical `?` marker at encode time.
    pub queries: Vec<String>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn query(mut self, predicate: impl Into<String>) -> Self {
        self.queries.push(predicate.into());
        self
    }

    /// Attach a `.proplist` so the router only emits the named fields.
    pub fn with_proplist(mut self, fields: &[&str]) -> Self {
        if !fields.is_empty() {
            self.attributes
                .insert(".proplist".to_owned(), fields.join(","));
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.queries.is_empty()
    }

    /// Remove and return `.id`, used by `/set` and `/remove` which address
    /// the row by id in the URL/command rather than as a regular attribute.
    pub fn take_id(&mut self) -> Option<String> {
        self.attributes.remove(".id")
    }

    /// Stable serialization used as the read-cache key component (§4.G):
    /// sorted attributes, then queries in call order.
    pub fn canonicalize(&self) -> String {
        let mut out = self
            .attributes
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>();
        out.extend(self.queries.iter().map(|q| format!("?{q}")));
        out.join("&")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_sorts_attributes_regardless_of_insertion_order() {
        let a = Params::new().attr("b", "2").attr("a", "1");
        let b = Params::new().attr("a", "1").attr("b", "2");
        assert_eq!(a.canonicalize(), b.canonicalize());
    }

    #[test]
    fn take_id_removes_the_dotted_id_attribute() {
        let mut p = Params::new().attr(".id", "*1").attr("name", "ether1");
        let id = p.take_id();
        assert_eq!(id.as_deref(), Some("*1"));
        assert!(!p.attributes.contains_key(".id"));
    }
}
