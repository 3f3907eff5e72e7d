//! Notification templates.
//!
//! Templates are handlebars sources. Two defaults are always registered,
//! [`DEFAULT_TITLE`] and [`DEFAULT_MESSAGE`]; configured template files are
//! registered under their file name.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use handlebars::Handlebars;
use serde::Serialize;
use tracing::{debug, info};
use url::Url;

use crate::error::{AlertError, Result};

/// Name of the default title template.
pub const DEFAULT_TITLE: &str = "default.title";
/// Name of the default message template.
pub const DEFAULT_MESSAGE: &str = "default.message";

const DEFAULT_TITLE_SOURCE: &str = "[{{status}}{{#if firingCount}}:{{firingCount}}{{/if}}] \
{{#each groupLabels}}{{@key}}={{this}} {{/each}}";

const DEFAULT_MESSAGE_SOURCE: &str = r"{{#each alerts}}[{{status}}] {{#each labels}}{{@key}}={{this}} {{/each}}
{{#each annotations}}  {{@key}}: {{this}}
{{/each}}{{#if generatorURL}}  source: {{generatorURL}}
{{/if}}{{/each}}";

fn template_error(reason: impl ToString) -> AlertError {
    AlertError::Template {
        reason: reason.to_string(),
    }
}

/// A parsed set of notification templates.
#[derive(Debug)]
pub struct Templates {
    registry: Handlebars<'static>,
    external_url: Url,
}

impl Templates {
    /// Parses the defaults plus every file in `paths`.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::Template`] if a file cannot be read or parsed,
    /// or if `external_url` is not a valid URL.
    pub fn new(paths: &[PathBuf], external_url: &str) -> Result<Self> {
        let external_url = Url::parse(external_url)
            .map_err(|e| template_error(format!("invalid external url {external_url:?}: {e}")))?;

        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        registry
            .register_template_string(DEFAULT_TITLE, DEFAULT_TITLE_SOURCE)
            .map_err(template_error)?;
        registry
            .register_template_string(DEFAULT_MESSAGE, DEFAULT_MESSAGE_SOURCE)
            .map_err(template_error)?;

        for path in paths {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| template_error(format!("invalid template path {}", path.display())))?;
            let source = fs::read_to_string(path)
                .map_err(|e| template_error(format!("failed to read {}: {e}", path.display())))?;
            registry
                .register_template_string(name, source)
                .map_err(|e| template_error(format!("failed to parse {name}: {e}")))?;
        }

        Ok(Self {
            registry,
            external_url,
        })
    }

    /// Renders the registered template `name`.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::Template`] if the template is unknown or fails.
    pub fn render<T: Serialize>(&self, name: &str, data: &T) -> Result<String> {
        self.registry
            .render(name, data)
            .map(|s| s.trim().to_string())
            .map_err(template_error)
    }

    /// Renders an inline template source.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::Template`] if the source fails to parse or render.
    pub fn render_str<T: Serialize>(&self, source: &str, data: &T) -> Result<String> {
        self.registry
            .render_template(source, data)
            .map(|s| s.trim().to_string())
            .map_err(template_error)
    }

    /// Renders `source` if given, else the registered template `fallback`.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::Template`] if rendering fails.
    pub fn render_or<T: Serialize>(&self, source: Option<&str>, fallback: &str, data: &T) -> Result<String> {
        match source {
            Some(source) if !source.is_empty() => self.render_str(source, data),
            _ => self.render(fallback, data),
        }
    }

    /// Returns true if a template named `name` is registered.
    #[must_use]
    pub fn has_template(&self, name: &str) -> bool {
        self.registry.has_template(name)
    }

    /// The external URL linked from notifications.
    #[must_use]
    pub const fn external_url(&self) -> &Url {
        &self.external_url
    }
}

/// Writes `files` into `dir` and removes files no longer configured.
///
/// Names are reduced to their final component so they cannot escape `dir`.
/// Returns the paths of all configured templates and whether anything on
/// disk changed.
///
/// # Errors
///
/// Returns [`AlertError::Persistence`] if the directory cannot be updated.
pub fn persist_templates(files: &BTreeMap<String, String>, dir: &Path) -> Result<(Vec<PathBuf>, bool)> {
    fs::create_dir_all(dir).map_err(|e| AlertError::persistence(dir, e))?;

    let mut changed = false;
    let mut paths = Vec::with_capacity(files.len());
    let mut keep = HashSet::with_capacity(files.len());

    for (name, content) in files {
        let Some(base) = Path::new(name).file_name() else {
            return Err(template_error(format!("invalid template name {name:?}")));
        };
        let path = dir.join(base);
        keep.insert(base.to_os_string());

        match fs::read(&path) {
            Ok(existing) if existing == content.as_bytes() => {}
            Ok(_) => {
                fs::write(&path, content).map_err(|e| AlertError::persistence(&path, e))?;
                changed = true;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                fs::write(&path, content).map_err(|e| AlertError::persistence(&path, e))?;
                changed = true;
            }
            Err(e) => return Err(AlertError::persistence(&path, e)),
        }
        paths.push(path);
    }

    let entries = fs::read_dir(dir).map_err(|e| AlertError::persistence(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| AlertError::persistence(dir, e))?;
        if entry.path().is_file() && !keep.contains(&entry.file_name()) {
            fs::remove_file(entry.path()).map_err(|e| AlertError::persistence(entry.path(), e))?;
            debug!(path = %entry.path().display(), "removed stale template");
            changed = true;
        }
    }

    if changed {
        info!(dir = %dir.display(), templates = paths.len(), "templates persisted");
    }
    Ok((paths, changed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn data() -> serde_json::Value {
        json!({
            "status": "firing",
            "firingCount": 2,
            "groupLabels": {"alertname": "HighCPU"},
            "alerts": [
                {"status": "firing", "labels": {"alertname": "HighCPU", "node": "n1"},
                 "annotations": {"summary": "cpu > 90%"}, "generatorURL": "http://gen/1"},
                {"status": "firing", "labels": {"alertname": "HighCPU", "node": "n2"},
                 "annotations": {}, "generatorURL": ""}
            ]
        })
    }

    fn templates(paths: &[PathBuf]) -> Templates {
        Templates::new(paths, "http://localhost:3000/").unwrap()
    }

    #[test]
    fn default_title() {
        let t = templates(&[]);
        assert_eq!(t.render(DEFAULT_TITLE, &data()).unwrap(), "[firing:2] alertname=HighCPU");
    }

    #[test]
    fn default_message_lists_alerts() {
        let t = templates(&[]);
        let message = t.render(DEFAULT_MESSAGE, &data()).unwrap();
        assert!(message.contains("node=n1"));
        assert!(message.contains("summary: cpu > 90%"));
        assert!(message.contains("source: http://gen/1"));
        assert!(message.contains("node=n2"));
    }

    #[test]
    fn no_html_escaping() {
        let t = templates(&[]);
        let out = t.render_str("{{value}}", &json!({"value": "a < b & c"})).unwrap();
        assert_eq!(out, "a < b & c");
    }

    #[test]
    fn render_or_prefers_inline_source() {
        let t = templates(&[]);
        assert_eq!(t.render_or(Some("custom {{status}}"), DEFAULT_TITLE, &data()).unwrap(), "custom firing");
        assert_eq!(t.render_or(Some(""), DEFAULT_TITLE, &data()).unwrap(), "[firing:2] alertname=HighCPU");
    }

    #[test]
    fn file_templates_registered_by_name() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("team.tmpl");
        fs::write(&path, "team alert: {{status}}").unwrap();

        let t = templates(&[path]);
        assert!(t.has_template("team.tmpl"));
        assert_eq!(t.render("team.tmpl", &data()).unwrap(), "team alert: firing");
    }

    #[test]
    fn broken_template_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.tmpl");
        fs::write(&path, "{{#if status}}never closed").unwrap();

        assert!(matches!(
            Templates::new(&[path], "http://localhost:3000/"),
            Err(AlertError::Template { .. })
        ));
    }

    #[test]
    fn invalid_external_url_rejected() {
        assert!(Templates::new(&[], "not a url").is_err());
    }

    mod persist_tests {
        use super::*;

        fn files(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect()
        }

        #[test]
        fn first_write_is_a_change() {
            let dir = TempDir::new().unwrap();
            let (paths, changed) = persist_templates(&files(&[("a.tmpl", "A")]), dir.path()).unwrap();
            assert!(changed);
            assert_eq!(paths, vec![dir.path().join("a.tmpl")]);
            assert_eq!(fs::read_to_string(&paths[0]).unwrap(), "A");
        }

        #[test]
        fn identical_bytes_are_not_a_change() {
            let dir = TempDir::new().unwrap();
            persist_templates(&files(&[("a.tmpl", "A")]), dir.path()).unwrap();
            let (_, changed) = persist_templates(&files(&[("a.tmpl", "A")]), dir.path()).unwrap();
            assert!(!changed);
        }

        #[test]
        fn modified_bytes_are_a_change() {
            let dir = TempDir::new().unwrap();
            persist_templates(&files(&[("a.tmpl", "A")]), dir.path()).unwrap();
            let (_, changed) = persist_templates(&files(&[("a.tmpl", "B")]), dir.path()).unwrap();
            assert!(changed);
        }

        #[test]
        fn stale_files_are_removed() {
            let dir = TempDir::new().unwrap();
            persist_templates(&files(&[("a.tmpl", "A"), ("b.tmpl", "B")]), dir.path()).unwrap();
            let (_, changed) = persist_templates(&files(&[("a.tmpl", "A")]), dir.path()).unwrap();
            assert!(changed);
            assert!(!dir.path().join("b.tmpl").exists());
        }

        #[test]
        fn names_cannot_escape_directory() {
            let root = TempDir::new().unwrap();
            let dir = root.path().join("templates");
            let (paths, _) = persist_templates(&files(&[("../../evil.tmpl", "x")]), &dir).unwrap();
            assert_eq!(paths, vec![dir.join("evil.tmpl")]);
            assert!(!root.path().join("evil.tmpl").exists());
        }
    }
}
