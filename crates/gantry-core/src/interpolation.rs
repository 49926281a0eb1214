use regex::Regex;
use std::collections::HashMap;

/// Context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct InterpolationContext {
    /// Pipeline and job variables
    pub variables: HashMap<String, String>,
    /// Matrix values for the current job instance
    pub matrix: HashMap<String, String>,
}

impl InterpolationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpolate variables in a string.
    ///
    /// Supports:
    /// - `${{ variable }}` - direct variable lookup
    /// - `${{ env.VAR }}` - environment variable
    /// - `${{ matrix.key }}` - matrix value
    ///
    /// Unknown placeholders resolve to the empty string.
    pub fn interpolate(&self, input: &str) -> String {
        let re = Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").unwrap();

        re.replace_all(input, |caps: &regex::Captures| {
            let expr = caps.get(1).map_or("", |m| m.as_str()).trim();
            self.resolve_expression(expr)
        })
        .to_string()
    }

    fn resolve_expression(&self, expr: &str) -> String {
        if let Some(var_name) = expr.strip_prefix("env.") {
            return self
                .variables
                .get(var_name)
                .cloned()
                .or_else(|| std::env::var(var_name).ok())
                .unwrap_or_default();
        }

        if let Some(key) = expr.strip_prefix("matrix.") {
            return self.matrix.get(key).cloned().unwrap_or_default();
        }

        self.variables.get(expr).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ctx() -> InterpolationContext {
        let mut ctx = InterpolationContext::new();
        ctx.variables.insert("target".to_string(), "release".to_string());
        ctx.matrix.insert("os".to_string(), "linux".to_string());
        ctx.matrix.insert("version".to_string(), "20".to_string());
        ctx
    }

    #[test]
    fn test_interpolate_variable() {
        assert_eq!(ctx().interpolate("build --${{ target }}"), "build --release");
    }

    #[test]
    fn test_interpolate_matrix() {
        assert_eq!(
            ctx().interpolate("test on ${{ matrix.os }}-${{ matrix.version }}"),
            "test on linux-20"
        );
    }

    #[test]
    fn test_unknown_placeholder_resolves_empty() {
        assert_eq!(ctx().interpolate("x=${{ nope }};"), "x=;");
        assert_eq!(ctx().interpolate("x=${{ matrix.nope }};"), "x=;");
    }

    #[test]
    fn test_no_placeholder_passthrough() {
        assert_eq!(ctx().interpolate("plain text"), "plain text");
    }
}
