use std::fmt;

use crate::error::{Result, SaylError};

/// Assertion kinds supported against a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssertionKind {
    Contains,
    Regex,
    JsonPath,
}

/// An assertion with its pattern compiled at config load time.
#[derive(Debug, Clone)]
pub struct CompiledAssertion {
    check: Check,
    message: Option<String>,
}

#[derive(Debug, Clone)]
enum Check {
    Contains(String),
    Regex {
        pattern: String,
        regex: regex::bytes::Regex,
    },
    JsonPath {
        path: String,
        value: Option<String>,
    },
}

/// A validation failure with enough context to render a useful message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionFailure {
    pub kind: AssertionKind,
    pub expected: String,
    pub actual: String,
    pub path: String,
    pub message: Option<String>,
}

impl fmt::Display for AssertionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(message) = &self.message {
            return f.write_str(message);
        }
        match self.kind {
            AssertionKind::Contains => write!(
                f,
                "assertion failed: response body does not contain '{}'",
                self.expected
            ),
            AssertionKind::Regex => write!(
                f,
                "assertion failed: response body does not match regex '{}'",
                self.expected
            ),
            AssertionKind::JsonPath => {
                if self.expected.is_empty() {
                    write!(
                        f,
                        "assertion failed: json path '{}' not found or empty",
                        self.path
                    )
                } else {
                    write!(
                        f,
                        "assertion failed: json path '{}' expected '{}', got '{}'",
                        self.path, self.expected, self.actual
                    )
                }
            }
        }
    }
}

impl CompiledAssertion {
    /// Build an assertion from its config fields, compiling regex patterns
    /// once. A pattern that does not compile fails the config load.
    pub fn compile(
        kind: &str,
        value: &str,
        path: &str,
        message: Option<String>,
    ) -> Result<Self> {
        let check = match kind {
            "regex" => Check::Regex {
                pattern: value.to_string(),
                regex: regex::bytes::Regex::new(value).map_err(|e| {
                    SaylError::Config(format!("invalid regex pattern '{value}': {e}"))
                })?,
            },
            "json_path" => Check::JsonPath {
                // An assertion with only a value is an existence check on
                // that path.
                path: if path.is_empty() { value } else { path }.to_string(),
                value: if !value.is_empty() && !path.is_empty() {
                    Some(value.to_string())
                } else {
                    None
                },
            },
            // Unspecified types behave as substring checks.
            _ => Check::Contains(value.to_string()),
        };
        Ok(Self { check, message })
    }

    fn evaluate(&self, body: &[u8]) -> std::result::Result<(), AssertionFailure> {
        match &self.check {
            Check::Contains(needle) => {
                if contains_bytes(body, needle.as_bytes()) {
                    Ok(())
                } else {
                    Err(AssertionFailure {
                        kind: AssertionKind::Contains,
                        expected: needle.clone(),
                        actual: truncate_body(body, 100),
                        path: String::new(),
                        message: self.message.clone(),
                    })
                }
            }
            Check::Regex { pattern, regex } => {
                if regex.is_match(body) {
                    Ok(())
                } else {
                    Err(AssertionFailure {
                        kind: AssertionKind::Regex,
                        expected: pattern.clone(),
                        actual: truncate_body(body, 100),
                        path: String::new(),
                        message: self.message.clone(),
                    })
                }
            }
            Check::JsonPath { path, value } => {
                let text = String::from_utf8_lossy(body);
                let found = gjson::get(&text, path);
                if !found.exists() {
                    return Err(AssertionFailure {
                        kind: AssertionKind::JsonPath,
                        expected: value.clone().unwrap_or_default(),
                        actual: String::new(),
                        path: path.clone(),
                        message: self.message.clone(),
                    });
                }
                if let Some(expected) = value {
                    let actual = found.str().trim().to_string();
                    if actual != expected.trim() {
                        return Err(AssertionFailure {
                            kind: AssertionKind::JsonPath,
                            expected: expected.trim().to_string(),
                            actual,
                            path: path.clone(),
                            message: self.message.clone(),
                        });
                    }
                }
                Ok(())
            }
        }
    }
}

/// Run assertions in declared order, stopping at the first failure.
pub fn validate_assertions(
    body: &[u8],
    assertions: &[CompiledAssertion],
) -> std::result::Result<(), AssertionFailure> {
    for assertion in assertions {
        assertion.evaluate(body)?;
    }
    Ok(())
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if haystack.len() < needle.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|window| window == needle)
}

fn truncate_body(body: &[u8], max_len: usize) -> String {
    if body.len() <= max_len {
        String::from_utf8_lossy(body).into_owned()
    } else {
        format!("{}...", String::from_utf8_lossy(&body[..max_len]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contains(value: &str) -> CompiledAssertion {
        CompiledAssertion::compile("contains", value, "", None).unwrap()
    }

    #[test]
    fn contains_pass_and_fail() {
        let body = br#"{"status":"ok"}"#;
        assert!(validate_assertions(body, &[contains("ok")]).is_ok());
        let err = validate_assertions(body, &[contains("missing")]).unwrap_err();
        assert_eq!(err.kind, AssertionKind::Contains);
        assert!(err.to_string().contains("does not contain 'missing'"));
    }

    #[test]
    fn regex_precompiles_and_matches() {
        let assertion = CompiledAssertion::compile("regex", r"\d{3}-\d{4}", "", None).unwrap();
        assert!(validate_assertions(b"call 555-0199 now", &[assertion.clone()]).is_ok());
        assert!(validate_assertions(b"no phone here", &[assertion]).is_err());
    }

    #[test]
    fn invalid_regex_fails_compile() {
        assert!(CompiledAssertion::compile("regex", "(unclosed", "", None).is_err());
    }

    #[test]
    fn json_path_existence() {
        let assertion = CompiledAssertion::compile("json_path", "", "user.id", None).unwrap();
        assert!(validate_assertions(br#"{"user":{"id":7}}"#, &[assertion.clone()]).is_ok());
        let err = validate_assertions(br#"{"user":{}}"#, &[assertion]).unwrap_err();
        assert!(err.to_string().contains("not found or empty"));
    }

    #[test]
    fn json_path_value_equality_trims_whitespace() {
        let assertion = CompiledAssertion::compile("json_path", "1", "v", None).unwrap();
        assert!(validate_assertions(br#"{"v":" 1 "}"#, &[assertion.clone()]).is_ok());
        let err = validate_assertions(br#"{"v":2}"#, &[assertion]).unwrap_err();
        assert_eq!(err.expected, "1");
        assert_eq!(err.actual, "2");
        assert!(err.to_string().contains("expected '1', got '2'"));
    }

    #[test]
    fn fail_fast_reports_first_failure() {
        let assertions = vec![contains("missing-a"), contains("missing-b")];
        let err = validate_assertions(b"body", &assertions).unwrap_err();
        assert_eq!(err.expected, "missing-a");
    }

    #[test]
    fn custom_message_overrides_rendering() {
        let assertion =
            CompiledAssertion::compile("contains", "nope", "", Some("token missing".to_string()))
                .unwrap();
        let err = validate_assertions(b"body", &[assertion]).unwrap_err();
        assert_eq!(err.to_string(), "token missing");
    }

    #[test]
    fn long_body_is_truncated_in_error() {
        let body = vec![b'x'; 500];
        let err = validate_assertions(&body, &[contains("y")]).unwrap_err();
        assert_eq!(err.actual.len(), 103);
        assert!(err.actual.ends_with("..."));
    }
}
