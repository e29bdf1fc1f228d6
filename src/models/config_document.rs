//! Probe configuration document
//!
//! The payload stored under `config.json` in the generated ConfigMap and read
//! by `netcheck run`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::network_assertion::{ContextDef, Rule, context_mount_path};

/// Resolved configuration consumed by the rule runner
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedConfig {
    #[serde(default)]
    pub contexts: Vec<ContextEntry>,
    #[serde(default)]
    pub assertions: Vec<AssertionConfig>,
}

/// A context as the probe sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContextEntry {
    /// JSON file parsed at resolution time
    File { name: String, path: String },
    /// Literal data, itself template-substituted
    Inline { name: String, data: Value },
    /// Directory of files, one key per file, loaded lazily
    Directory { name: String, path: String },
}

impl ContextEntry {
    pub fn name(&self) -> &str {
        match self {
            ContextEntry::File { name, .. }
            | ContextEntry::Inline { name, .. }
            | ContextEntry::Directory { name, .. } => name,
        }
    }

    /// Translate a cluster-side definition into the probe's form.
    ///
    /// ConfigMap and secret sources become directories mounted under
    /// `/mnt/<name>`. Returns `None` when the definition names no source.
    pub fn from_definition(def: &ContextDef) -> Option<Self> {
        if def.config_map.is_some() || def.secret.is_some() {
            Some(ContextEntry::Directory {
                name: def.name.clone(),
                path: context_mount_path(&def.name),
            })
        } else {
            def.inline.as_ref().map(|data| ContextEntry::Inline {
                name: def.name.clone(),
                data: data.clone(),
            })
        }
    }
}

/// A named group of rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionConfig {
    pub name: String,
    pub rules: Vec<Rule>,
}

impl ResolvedConfig {
    /// Build the document for a NetworkAssertion.
    ///
    /// One assertion entry per rule, each carrying exactly that rule. Unnamed
    /// rules are named `<assertion>-rule-<n>` (1-based).
    pub fn from_assertion(assertion_name: &str, rules: &[Rule], contexts: &[ContextDef]) -> Self {
        let contexts = contexts
            .iter()
            .filter_map(ContextEntry::from_definition)
            .collect();

        let assertions = rules
            .iter()
            .enumerate()
            .map(|(idx, rule)| AssertionConfig {
                name: rule
                    .name()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{}-rule-{}", assertion_name, idx + 1)),
                rules: vec![rule.for_config_file()],
            })
            .collect();

        Self {
            contexts,
            assertions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_entry_from_definition() {
        let cm: ContextDef =
            serde_json::from_value(json!({"name": "settings", "configMap": {"name": "cm"}}))
                .unwrap();
        let secret: ContextDef =
            serde_json::from_value(json!({"name": "creds", "secret": {"name": "s"}})).unwrap();
        let inline: ContextDef =
            serde_json::from_value(json!({"name": "vals", "inline": {"a": 1}})).unwrap();
        let empty: ContextDef = serde_json::from_value(json!({"name": "nothing"})).unwrap();

        assert_eq!(
            ContextEntry::from_definition(&cm),
            Some(ContextEntry::Directory {
                name: "settings".into(),
                path: "/mnt/settings".into()
            })
        );
        assert_eq!(
            ContextEntry::from_definition(&secret),
            Some(ContextEntry::Directory {
                name: "creds".into(),
                path: "/mnt/creds".into()
            })
        );
        assert_eq!(
            ContextEntry::from_definition(&inline),
            Some(ContextEntry::Inline {
                name: "vals".into(),
                data: json!({"a": 1})
            })
        );
        assert_eq!(ContextEntry::from_definition(&empty), None);
    }

    #[test]
    fn test_one_assertion_per_rule() {
        let rules: Vec<Rule> = serde_json::from_value(json!([
            {"name": "first", "type": "dns", "host": "github.com"},
            {"type": "http", "url": "https://example.test"}
        ]))
        .unwrap();

        let doc = ResolvedConfig::from_assertion("web", &rules, &[]);
        assert_eq!(doc.assertions.len(), 2);
        assert_eq!(doc.assertions[0].name, "first");
        assert_eq!(doc.assertions[1].name, "web-rule-2");
        assert!(doc.assertions.iter().all(|a| a.rules.len() == 1));
    }

    #[test]
    fn test_serialized_shape() {
        let doc = ResolvedConfig {
            contexts: vec![ContextEntry::File {
                name: "f".into(),
                path: "/tmp/f.json".into(),
            }],
            assertions: vec![],
        };
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(
            value,
            json!({
                "contexts": [{"type": "file", "name": "f", "path": "/tmp/f.json"}],
                "assertions": []
            })
        );
    }
}
