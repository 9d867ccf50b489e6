//! Prompt template grammar: `{{ identifier }}` variable references where the
//! identifier matches `[A-Za-z_][A-Za-z0-9_]*`. Whitespace inside the braces
//! is permitted. Rendering substitutes from a variable map; absent variables
//! render as the empty string.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;

/// Reserved name resolving to the original user request.
pub const USER_REQUEST: &str = "user_request";
/// Reserved name resolving to the output of the authored-order predecessor.
pub const PREV_OUTPUT: &str = "prev_output";

static VARIABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("variable pattern is valid")
});

/// Extract the set of variable identifiers referenced by a template.
/// Order and duplicates are insignificant.
pub fn extract_variable_names(template: &str) -> HashSet<String> {
    VARIABLE
        .captures_iter(template)
        .map(|caps| caps[1].to_owned())
        .collect()
}

/// Replace every `{{ name }}` occurrence with `variables[name]`, or with the
/// empty string if the variable is absent.
pub fn render(template: &str, variables: &HashMap<String, String>) -> String {
    VARIABLE
        .replace_all(template, |caps: &regex::Captures<'_>| {
            variables.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_extract_simple() {
        let names = extract_variable_names("Summarize: {{user_request}}");
        assert_eq!(names, HashSet::from(["user_request".to_owned()]));
    }

    #[test]
    fn test_extract_allows_inner_whitespace() {
        let names = extract_variable_names("{{  research_notes  }} and {{draft}}");
        assert!(names.contains("research_notes"));
        assert!(names.contains("draft"));
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn test_extract_deduplicates() {
        let names = extract_variable_names("{{a}} {{a}} {{a}}");
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn test_extract_ignores_invalid_identifiers() {
        let names = extract_variable_names("{{1abc}} {{a-b}} {{}} {{ok_1}}");
        assert_eq!(names, HashSet::from(["ok_1".to_owned()]));
    }

    #[test]
    fn test_extract_empty_template() {
        assert!(extract_variable_names("").is_empty());
        assert!(extract_variable_names("no variables here").is_empty());
    }

    #[test]
    fn test_render_substitutes() {
        let rendered = render(
            "Elaborate on: {{ draft }}",
            &vars(&[("draft", "the outline")]),
        );
        assert_eq!(rendered, "Elaborate on: the outline");
    }

    #[test]
    fn test_render_absent_variable_is_empty() {
        let rendered = render("before {{missing}} after", &vars(&[]));
        assert_eq!(rendered, "before  after");
    }

    #[test]
    fn test_render_multiple_occurrences() {
        let rendered = render("{{x}}-{{x}}", &vars(&[("x", "v")]));
        assert_eq!(rendered, "v-v");
    }

    #[test]
    fn test_render_leaves_non_variables_alone() {
        let template = "json: { \"a\": 1 } and {{a}}";
        let rendered = render(template, &vars(&[("a", "X")]));
        assert_eq!(rendered, "json: { \"a\": 1 } and X");
    }
}
