//! Reference preprocessor.
//!
//! Rewrites `#id` and `#proto:id` occurrences outside single-quoted strings
//! into sentinel-tagged string literals (see [`crate::expr::ast::REF_SENTINEL`])
//! so the grammar itself never has to treat `#` specially.
//!
//! Schema-authoring conventions also call for rewriting top-level `<<`/`>>` into
//! `leftShift`/`rightShift` calls, to dodge an ambiguity with a tag syntax in
//! the *upstream* schema authoring format. That ambiguity belongs entirely to
//! whatever external front end produces expression strings (schema source
//! parsing is explicitly out of scope) — by the time a string
//! reaches this engine it is already a clean expression, so `<<`/`>>` are
//! supported directly as operators by the parser and no textual rewrite is
//! needed here (see DESIGN.md).

use super::ast::REF_SENTINEL;

/// Rewrites every `#id` / `#proto:id` reference outside of single-quoted
/// string literals into `'<REF_SENTINEL>id'` / `'<REF_SENTINEL>proto:id'`.
pub fn rewrite_references(src: &str) -> String {
    let mut out = String::with_capacity(src.len() + 8);
    let mut chars = src.char_indices().peekable();
    let mut in_string = false;

    while let Some((_, c)) = chars.next() {
        if in_string {
            out.push(c);
            if c == '\'' {
                in_string = false;
            }
            continue;
        }

        match c {
            '\'' => {
                in_string = true;
                out.push(c);
            }
            '#' => {
                let mut ident = String::new();
                while let Some(&(_, nc)) = chars.peek() {
                    if nc.is_alphanumeric() || nc == '_' || nc == ':' {
                        ident.push(nc);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push('\'');
                out.push_str(REF_SENTINEL);
                out.push_str(&ident);
                out.push('\'');
            }
            _ => out.push(c),
        }
    }

    out
}
