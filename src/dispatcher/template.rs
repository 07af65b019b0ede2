// ============================================================================
// Template Rendering
// ============================================================================

use std::collections::HashMap;

/// Replace `{{placeholder}}` markers with their values. Placeholder names
/// are trimmed, so `{{ name }}` and `{{name}}` are equivalent. Unknown
/// placeholders render as an empty string rather than leaking the marker
/// into an outgoing message.
pub fn render_template(template: &str, variables: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find("}}") {
            Some(rel_end) => {
                let key = rest[start + 2..start + 2 + rel_end].trim();
                if let Some(value) = variables.get(key) {
                    out.push_str(value);
                }
                rest = &rest[start + 2 + rel_end + 2..];
            }
            None => {
                // Unclosed marker: emit verbatim.
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
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
    fn test_renders_placeholders() {
        let rendered = render_template(
            "Hi {{name}}, enjoy {{product}}!",
            &vars(&[("name", "Ana"), ("product", "Pro Plan")]),
        );
        assert_eq!(rendered, "Hi Ana, enjoy Pro Plan!");
    }

    #[test]
    fn test_trims_placeholder_names() {
        let rendered = render_template("Hi {{ name }}!", &vars(&[("name", "Ana")]));
        assert_eq!(rendered, "Hi Ana!");
    }

    #[test]
    fn test_unknown_placeholder_renders_empty() {
        let rendered = render_template("Hi {{name}}{{missing}}!", &vars(&[("name", "Ana")]));
        assert_eq!(rendered, "Hi Ana!");
    }

    #[test]
    fn test_unclosed_marker_is_verbatim() {
        let rendered = render_template("Hi {{name", &vars(&[("name", "Ana")]));
        assert_eq!(rendered, "Hi {{name");
    }

    #[test]
    fn test_no_placeholders() {
        let rendered = render_template("plain text", &HashMap::new());
        assert_eq!(rendered, "plain text");
    }
}
