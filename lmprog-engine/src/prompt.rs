//! Prompt assembly for program units and the function synthesizer

/// Placeholder replaced with the helper-import declaration.
pub const HELPER_IMPORTS_PLACEHOLDER: &str = "{helper_imports}";

/// Immutable few-shot template plus the query decoration it is used with.
#[derive(Debug, Clone, Default)]
pub struct PromptTemplate {
    pub text: String,
    pub query_prefix: String,
    pub query_suffix: String,
    pub maintain_session: bool,
}

impl PromptTemplate {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_query_decoration(mut self, prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        self.query_prefix = prefix.into();
        self.query_suffix = suffix.into();
        self
    }

    pub fn with_session(mut self, maintain_session: bool) -> Self {
        self.maintain_session = maintain_session;
        self
    }

    /// Wrap a raw query with the configured prefix and suffix.
    pub fn decorate(&self, query: &str) -> String {
        format!("{}{}{}", self.query_prefix, query, self.query_suffix)
    }

    /// Returns `(prompt_text, decorated_query)`.
    ///
    /// History is only included when the template maintains a session;
    /// empty context adds nothing.
    pub fn build(
        &self,
        session_history: &str,
        context: &str,
        query: &str,
        import_names: &[String],
    ) -> (String, String) {
        let mut prompt = self
            .text
            .replace(HELPER_IMPORTS_PLACEHOLDER, &import_declaration(import_names));

        if self.maintain_session {
            prompt.push('\n');
            prompt.push_str(session_history);
        }

        if !context.is_empty() {
            prompt.push('\n');
            prompt.push_str(context);
        }

        let decorated = self.decorate(query);
        prompt.push('\n');
        prompt.push_str(&decorated);

        (prompt, decorated)
    }
}

/// `// import helpers: a, b, c`, or an empty string when nothing is bound.
pub fn import_declaration(names: &[String]) -> String {
    if names.is_empty() {
        String::new()
    } else {
        format!("// import helpers: {}", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> PromptTemplate {
        PromptTemplate::new("{helper_imports}\n// examples")
            .with_query_decoration("// ", ".")
    }

    #[test]
    fn test_build_with_context() {
        let (prompt, query) = template().build(
            "",
            "let objects = [\"red block\"];",
            "stack the blocks",
            &["parse_obj_name".into(), "get_total".into()],
        );

        assert_eq!(query, "// stack the blocks.");
        assert_eq!(
            prompt,
            "// import helpers: parse_obj_name, get_total\n// examples\nlet objects = [\"red block\"];\n// stack the blocks."
        );
    }

    #[test]
    fn test_empty_imports_and_context() {
        let (prompt, _) = template().build("let a = 1;", "", "go", &[]);
        assert_eq!(prompt, "\n// examples\n// go.");
    }

    #[test]
    fn test_history_only_with_session() {
        let history = "\nsay(\"hi\");";
        let (without, _) = template().build(history, "", "go", &[]);
        let (with, _) = template().with_session(true).build(history, "", "go", &[]);

        assert!(!without.contains("say(\"hi\")"));
        assert_eq!(with, "\n// examples\n\nsay(\"hi\");\n// go.");
    }
}
