//! Auto-return analysis of the code surface.
//!
//! A single-expression body returns its value implicitly; a multi-statement
//! body must end with an explicit `return`. The host rejects violations
//! before spawning a worker, so the error is cheap and well-attributed.

use tmg_wire::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeShape {
    Expression,
    Sequence,
}

const STATEMENT_KEYWORDS: [&str; 10] = [
    "let ", "const ", "var ", "return", "if ", "if(", "for ", "for(", "while ", "while(",
];

/// Classify a code body and enforce the auto-return rule.
pub fn analyze(code: &str) -> GatewayResult<CodeShape> {
    let statements = split_statements(code);
    match statements.len() {
        0 => Err(GatewayError::validation("code body is empty")),
        1 => {
            let only = statements[0];
            if is_statement(only) && !only.starts_with("return") {
                Err(GatewayError::validation(
                    "a single-statement body must be an expression or a return statement",
                ))
            } else if only.starts_with("return") {
                Ok(CodeShape::Sequence)
            } else {
                Ok(CodeShape::Expression)
            }
        }
        _ => {
            let last = statements[statements.len() - 1];
            if last.starts_with("return") {
                Ok(CodeShape::Sequence)
            } else {
                Err(GatewayError::validation(
                    "a multi-statement body must end with an explicit return",
                ))
            }
        }
    }
}

/// Split top-level statements on `;` and newlines, ignoring separators
/// inside strings, parentheses, brackets and braces.
fn split_statements(code: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut depth = 0i32;
    let mut in_string: Option<char> = None;
    let mut escaped = false;
    let mut start = 0usize;

    for (index, ch) in code.char_indices() {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == quote {
                in_string = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' | '`' => in_string = Some(ch),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ';' | '\n' if depth == 0 => {
                let statement = code[start..index].trim();
                if !statement.is_empty() {
                    statements.push(statement);
                }
                start = index + ch.len_utf8();
            }
            _ => {}
        }
    }
    let tail = code[start..].trim();
    if !tail.is_empty() {
        statements.push(tail);
    }
    statements
}

fn is_statement(line: &str) -> bool {
    STATEMENT_KEYWORDS
        .iter()
        .any(|keyword| line.starts_with(keyword))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_expression_is_implicit_return() {
        assert_eq!(analyze("1 + 1").unwrap(), CodeShape::Expression);
        assert_eq!(analyze("context.user.email").unwrap(), CodeShape::Expression);
    }

    #[test]
    fn multiline_single_expression_counts_as_one() {
        let code = "fetchData({\n  a: 1,\n  b: 2,\n})";
        assert_eq!(analyze(code).unwrap(), CodeShape::Expression);
    }

    #[test]
    fn sequence_with_final_return_is_accepted() {
        let code = "let x = read();\nlet y = x * 2;\nreturn y";
        assert_eq!(analyze(code).unwrap(), CodeShape::Sequence);
    }

    #[test]
    fn sequence_without_return_is_rejected() {
        let code = "let x = read();\nx * 2";
        let err = analyze(code).unwrap_err();
        assert_eq!(err.kind, tmg_wire::ErrorKind::Validation);
    }

    #[test]
    fn empty_body_is_rejected() {
        assert!(analyze("   \n ").is_err());
    }

    #[test]
    fn separators_inside_strings_do_not_split() {
        assert_eq!(analyze("greet(\"a;b\\nc\")").unwrap(), CodeShape::Expression);
    }

    #[test]
    fn lone_return_is_a_sequence() {
        assert_eq!(analyze("return 42").unwrap(), CodeShape::Sequence);
    }

    #[test]
    fn lone_declaration_is_rejected() {
        assert!(analyze("let x = 1").is_err());
    }
}
