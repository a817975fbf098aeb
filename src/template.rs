use std::collections::HashMap;

use crate::variables::VariableProcessor;

/// One segment of a compiled template.
#[derive(Debug, Clone)]
enum Part {
    /// Static text outside any placeholder.
    Literal(String),
    /// A `{{name}}` reference resolved through the variable provider.
    Var(String),
    /// A `{{func(a, b)}}` reference with the call pre-split at compile time.
    /// The raw reference text is kept so unknown functions round-trip to the
    /// original placeholder.
    Call {
        raw: String,
        name: String,
        args: Vec<String>,
    },
}

/// A pre-parsed template ready for fast per-request execution.
///
/// Parsing happens once at config load time; execution only walks the part
/// list and never re-scans the input for `{{`.
#[derive(Debug, Clone)]
pub struct CompiledTemplate {
    parts: Vec<Part>,
    has_vars: bool,
    literal_len: usize,
}

impl CompiledTemplate {
    /// Parse a template string. Must be called once per template string
    /// (URL, body, header value, step variable value).
    pub fn compile(input: &str) -> Self {
        // Fast path for strings without placeholders.
        if !input.contains("{{") {
            return Self {
                literal_len: input.len(),
                parts: vec![Part::Literal(input.to_string())],
                has_vars: false,
            };
        }

        let mut parts = Vec::new();
        let mut literal_len = 0;
        let mut remaining = input;
        loop {
            let Some(start) = remaining.find("{{") else {
                if !remaining.is_empty() {
                    literal_len += remaining.len();
                    parts.push(Part::Literal(remaining.to_string()));
                }
                break;
            };
            if start > 0 {
                literal_len += start;
                parts.push(Part::Literal(remaining[..start].to_string()));
            }
            let after_open = &remaining[start + 2..];
            let Some(end) = after_open.find("}}") else {
                // Unterminated placeholder, fold the rest into a literal.
                literal_len += remaining.len() - start;
                parts.push(Part::Literal(remaining[start..].to_string()));
                break;
            };
            let reference = after_open[..end].trim();
            parts.push(parse_reference(reference));
            remaining = &after_open[end + 2..];
        }

        Self {
            parts,
            has_vars: true,
            literal_len,
        }
    }

    /// Render the template against the given session.
    pub fn execute(&self, vp: &VariableProcessor, session: &HashMap<String, String>) -> String {
        if !self.has_vars {
            // Single literal, no substitution work at all.
            if let Some(Part::Literal(lit)) = self.parts.first() {
                return lit.clone();
            }
            return String::new();
        }

        let mut out = String::with_capacity(self.literal_len + 64);
        for part in &self.parts {
            match part {
                Part::Literal(lit) => out.push_str(lit),
                Part::Var(name) => out.push_str(&vp.resolve(name, session)),
                Part::Call { raw, name, args } => match vp.call_function(name, args) {
                    Some(value) => out.push_str(&value),
                    None => {
                        // Unknown function, emit the original placeholder.
                        out.push_str("{{");
                        out.push_str(raw);
                        out.push_str("}}");
                    }
                },
            }
        }
        out
    }

    /// Whether the template contains any reference parts.
    pub fn has_vars(&self) -> bool {
        self.has_vars
    }
}

/// Classify a reference as a plain variable or a function call, splitting the
/// call into name and arguments once so execution never re-parses it.
fn parse_reference(reference: &str) -> Part {
    if let Some(open) = reference.find('(') {
        if reference.ends_with(')') {
            let name = reference[..open].trim().to_string();
            let arg_str = &reference[open + 1..reference.len() - 1];
            return Part::Call {
                raw: reference.to_string(),
                name,
                args: parse_args(arg_str),
            };
        }
    }
    Part::Var(reference.to_string())
}

/// Split an argument list on commas, respecting double quotes. Surrounding
/// quotes are stripped so string arguments may contain commas.
fn parse_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;

    for ch in input.chars() {
        match ch {
            '"' => in_quote = !in_quote,
            ',' if !in_quote => {
                args.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        args.push(current.trim().to_string());
    }

    for arg in &mut args {
        if arg.len() >= 2 && arg.starts_with('"') && arg.ends_with('"') {
            *arg = arg[1..arg.len() - 1].to_string();
        }
    }
    args
}
