// src/expr/template.rs

//! `${{ expr }}` interpolation inside parameter, env and command strings.

use std::sync::LazyLock;

use regex::Regex;

use super::{EvalContext, Expr, ExprError};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*(.*?)\s*\}\}").expect("placeholder regex is valid")
});

/// Parse every `${{ ... }}` placeholder in `template`.
pub fn template_expressions(template: &str) -> Result<Vec<Expr>, ExprError> {
    PLACEHOLDER
        .captures_iter(template)
        .map(|caps| Expr::parse(&caps[1]))
        .collect()
}

/// Whether the template reads any `secrets.*` value.
pub fn references_secret(template: &str) -> bool {
    template_expressions(template)
        .map(|exprs| {
            exprs.iter().any(|e| {
                e.paths()
                    .iter()
                    .any(|p| p.first().map(String::as_str) == Some("secrets"))
            })
        })
        .unwrap_or(false)
}

/// Replace every placeholder with the string value of its expression.
pub fn interpolate(template: &str, ctx: &dyn EvalContext) -> Result<String, ExprError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(template) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&template[last..whole.start()]);
        let expr = Expr::parse(&caps[1])?;
        out.push_str(&expr.eval(ctx).into_string());
        last = whole.end();
    }
    out.push_str(&template[last..]);

    Ok(out)
}
