use std::collections::HashMap;

pub type Vars = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unterminated placeholder at byte {position} in {template:?}")]
    Unterminated { template: String, position: usize },
    #[error("single '}}' at byte {position} in {template:?}")]
    StrayBrace { template: String, position: usize },
    #[error("invalid placeholder name {name:?} in {template:?}")]
    InvalidName { template: String, name: String },
    #[error("cannot split command line {line:?} into words")]
    Unsplittable { line: String },
}

/// Substitutes `{name}` placeholders with values from `vars`.
///
/// Names missing from `vars` resolve to the empty string. `{{` and `}}` produce
/// literal braces.
pub fn resolve(template: &str, vars: &Vars) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((position, c)) = chars.next() {
        match c {
            '{' => {
                if chars.next_if(|&(_, c)| c == '{').is_some() {
                    out.push('{');
                    continue;
                }

                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }

                if !closed {
                    return Err(TemplateError::Unterminated {
                        template: template.to_string(),
                        position,
                    });
                }
                if !is_valid_name(&name) {
                    return Err(TemplateError::InvalidName {
                        template: template.to_string(),
                        name,
                    });
                }

                if let Some(value) = vars.get(&name) {
                    out.push_str(value);
                }
            }
            '}' => {
                if chars.next_if(|&(_, c)| c == '}').is_none() {
                    return Err(TemplateError::StrayBrace {
                        template: template.to_string(),
                        position,
                    });
                }
                out.push('}');
            }
            c => out.push(c),
        }
    }

    Ok(out)
}

/// Checks placeholder syntax without binding anything.
pub fn validate(template: &str) -> Result<(), TemplateError> {
    resolve(template, &Vars::new()).map(|_| ())
}

/// Splits a resolved command line into program and arguments using shell quoting rules.
pub fn split(line: &str) -> Result<Vec<String>, TemplateError> {
    shlex::split(line).ok_or_else(|| TemplateError::Unsplittable {
        line: line.to_string(),
    })
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}
