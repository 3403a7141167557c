use indexmap::IndexMap;

pub type VariableMap = IndexMap<String, String>;

/// Hierarchical lookup for `${NAME}` / `${NAME:default}` references.
///
/// Precedence: box-local, then each ancestor from nearest to root, then the
/// application-global map, then the process environment, then the literal
/// default in the reference. A reference with no match and no default is left
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct VariableScope<'a> {
    chain: Vec<&'a VariableMap>,
    app: Option<&'a VariableMap>,
}

impl<'a> VariableScope<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes the next, lower-precedence box layer.
    pub fn with_layer(mut self, variables: &'a VariableMap) -> Self {
        self.chain.push(variables);
        self
    }

    pub fn with_app(mut self, variables: &'a VariableMap) -> Self {
        self.app = Some(variables);
        self
    }

    pub fn lookup(&self, name: &str) -> Option<String> {
        self.chain
            .iter()
            .find_map(|layer| layer.get(name).cloned())
            .or_else(|| self.app.and_then(|app| app.get(name).cloned()))
            .or_else(|| std::env::var(name).ok())
    }

    pub fn substitute(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                out.push_str(&rest[start..]);
                return out;
            };
            let token = &after[..end];
            let (name, default) = match token.split_once(':') {
                Some((name, default)) => (name, Some(default)),
                None => (token, None),
            };
            let resolved = if is_variable_name(name) {
                self.lookup(name).or_else(|| default.map(str::to_owned))
            } else {
                None
            };
            match resolved {
                Some(value) => out.push_str(&value),
                None => out.push_str(&rest[start..start + 2 + end + 1]),
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        out
    }

    pub fn substitute_all(&self, lines: &[String]) -> Vec<String> {
        lines.iter().map(|line| self.substitute(line)).collect()
    }
}

fn is_variable_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

#[cfg(test)]
#[path = "tests/variables_tests.rs"]
mod tests;
