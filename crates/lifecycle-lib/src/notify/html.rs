//! HTML rendering of notification bodies
//!
//! Templates are registered once in a [`handlebars::Handlebars`] registry;
//! the default escape function HTML-escapes every interpolated value.

use handlebars::Handlebars;
use serde::Serialize;

use super::NotifyError;

const PAGE_TEMPLATE: &str = "page";
const ACTION_TABLE_PARTIAL: &str = "action_table";
const WARNING_TABLE_PARTIAL: &str = "warning_table";

const PAGE: &str = r#"<html>
<head>
    <style>
        table, p {
            font-family: 'Trebuchet MS', Arial, Helvetica, sans-serif;
            border-collapse: collapse;
            width: 100%;
        }
        table td, table th {
            border: 1px solid #ddd;
            padding: 8px;
        }
        table tr:nth-child(even) { background-color: #eeeeee; }
        table tr:hover { background-color: #ddd; }
        table th {
            padding: 8px;
            text-align: left;
            background-color: #c6c6c6;
            color: black;
        }
    </style>
</head>
<body>
<p>{{paragraph}}</p><br>
{{#if actions}}{{> action_table}}{{/if}}{{#if warnings}}{{> warning_table}}{{/if}}
</body>
</html>
"#;

const ACTION_TABLE: &str = r#"<table>
<tr><th>Instance</th><th>Details</th><th>Action status</th></tr>
{{#each actions}}<tr><td>{{instance}}</td><td>{{details}}</td><td>{{status}}</td></tr>
{{/each}}</table>
<br>
"#;

const WARNING_TABLE: &str = r#"<table>
<tr><th>Instance</th><th>Details</th></tr>
{{#each warnings}}<tr><td>{{instance}}</td><td>{{details}}</td></tr>
{{/each}}</table>
<br>
"#;

/// One row of the action table
#[derive(Debug, Clone, Serialize)]
pub struct ActionRow {
    pub instance: String,
    pub details: String,
    pub status: String,
}

/// One row of the warning table
#[derive(Debug, Clone, Serialize)]
pub struct WarningRow {
    pub instance: String,
    pub details: String,
}

#[derive(Serialize)]
struct PageData<'a> {
    paragraph: &'a str,
    actions: &'a [ActionRow],
    warnings: &'a [WarningRow],
}

/// Renders notification pages
pub struct HtmlRenderer {
    registry: Handlebars<'static>,
}

impl HtmlRenderer {
    pub fn new() -> Result<Self, NotifyError> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_partial(ACTION_TABLE_PARTIAL, ACTION_TABLE)?;
        registry.register_partial(WARNING_TABLE_PARTIAL, WARNING_TABLE)?;
        registry.register_template_string(PAGE_TEMPLATE, PAGE)?;

        Ok(Self { registry })
    }

    /// A paragraph followed by an Instance / Details / Action status table
    pub fn render_actions(&self, paragraph: &str, rows: &[ActionRow]) -> Result<String, NotifyError> {
        self.render(PageData {
            paragraph,
            actions: rows,
            warnings: &[],
        })
    }

    /// A paragraph followed by an Instance / Details table
    pub fn render_warnings(
        &self,
        paragraph: &str,
        rows: &[WarningRow],
    ) -> Result<String, NotifyError> {
        self.render(PageData {
            paragraph,
            actions: &[],
            warnings: rows,
        })
    }

    fn render(&self, data: PageData<'_>) -> Result<String, NotifyError> {
        Ok(self.registry.render(PAGE_TEMPLATE, &data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_action_table() {
        let renderer = HtmlRenderer::new().unwrap();
        let html = renderer
            .render_actions(
                "The following instances in the research tenant have been shelved:",
                &[ActionRow {
                    instance: "web-1".to_string(),
                    details: "Instance has been running for more than 30.0 days".to_string(),
                    status: "Success".to_string(),
                }],
            )
            .unwrap();

        assert!(html.contains("<th>Action status</th>"));
        assert!(html.contains("<td>web-1</td>"));
        assert!(html.contains("<td>Success</td>"));
        assert!(!html.contains("<th>Instance</th><th>Details</th></tr>"));
    }

    #[test]
    fn test_render_warning_table() {
        let renderer = HtmlRenderer::new().unwrap();
        let html = renderer
            .render_warnings(
                "Soon:",
                &[
                    WarningRow {
                        instance: "a".to_string(),
                        details: "one".to_string(),
                    },
                    WarningRow {
                        instance: "b".to_string(),
                        details: "two".to_string(),
                    },
                ],
            )
            .unwrap();

        assert!(html.contains("<tr><td>a</td><td>one</td></tr>"));
        assert!(html.contains("<tr><td>b</td><td>two</td></tr>"));
        assert!(!html.contains("Action status"));
    }

    #[test]
    fn test_values_are_escaped() {
        let renderer = HtmlRenderer::new().unwrap();
        let html = renderer
            .render_warnings(
                "Tenant <R&D>",
                &[WarningRow {
                    instance: "<script>alert(1)</script>".to_string(),
                    details: "x".to_string(),
                }],
            )
            .unwrap();

        assert!(html.contains("Tenant &lt;R&amp;D&gt;"));
        assert!(!html.contains("<script>"));
    }
}
