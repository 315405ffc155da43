use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// HTTP-style verb of an RPC request.
///
/// On the wire a method is its upper-case name. Any other string decodes to
/// [`RequestMethod::Other`] so the dispatcher can answer it with 404 instead
/// of rejecting the whole envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RequestMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    /// A method name no route can serve, kept verbatim.
    Other(String),
}

impl RequestMethod {
    /// All known methods, in declaration order.
    pub const ALL: [RequestMethod; 5] = [
        RequestMethod::Get,
        RequestMethod::Post,
        RequestMethod::Put,
        RequestMethod::Delete,
        RequestMethod::Patch,
    ];

    /// Wire representation (`"GET"`, `"POST"`, ...).
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            RequestMethod::Get => "GET",
            RequestMethod::Post => "POST",
            RequestMethod::Put => "PUT",
            RequestMethod::Delete => "DELETE",
            RequestMethod::Patch => "PATCH",
            RequestMethod::Other(name) => name,
        }
    }

    #[must_use]
    pub fn is_known(&self) -> bool {
        !matches!(self, RequestMethod::Other(_))
    }
}

impl fmt::Display for RequestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exact wire names only; `"post"` stays `Other("post")`.
impl From<String> for RequestMethod {
    fn from(name: String) -> Self {
        RequestMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == name)
            .unwrap_or(RequestMethod::Other(name))
    }
}

impl From<RequestMethod> for String {
    fn from(method: RequestMethod) -> Self {
        match method {
            RequestMethod::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

/// Error returned when parsing an unknown method name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown request method: {0}")]
pub struct UnknownMethod(pub String);

/// Case-insensitive; unknown names are an error.
impl FromStr for RequestMethod {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestMethod::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownMethod(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("post".parse::<RequestMethod>(), Ok(RequestMethod::Post));
        assert_eq!("DELETE".parse::<RequestMethod>(), Ok(RequestMethod::Delete));
        assert!("TRACE".parse::<RequestMethod>().is_err());
    }

    #[test]
    fn display_matches_wire_name() {
        for method in RequestMethod::ALL {
            assert_eq!(method.to_string(), method.as_str());
        }
    }

    #[test]
    fn unknown_wire_names_are_kept() {
        assert_eq!(RequestMethod::from("GET".to_string()), RequestMethod::Get);
        assert_eq!(
            RequestMethod::from("get".to_string()),
            RequestMethod::Other("get".to_string())
        );
        let trace = RequestMethod::from("TRACE".to_string());
        assert!(!trace.is_known());
        assert_eq!(String::from(trace), "TRACE");
    }
}
