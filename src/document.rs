//! Editable netlist bound to a template.
//!
//! A [`CircuitDocument`] holds the parsed template plus a table of
//! specialized sub-circuit copies keyed by instance path. Editing
//! `X1:R1` never touches the shared definition used by `X1`: the first
//! edit under a path clones the definition under a fresh name, points the
//! instance at the clone, and later edits under the same path reuse it.
//! Clones are written just before the final `.END`.

use std::borrow::Cow;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_derive::Deserialize;

use crate::circuit::{CircuitNode, ComponentInfo, ComponentValue, ResolveContext};
use crate::error::{Result, SpiceBatchError};

const BLANK_NETLIST: &str = "* netlist generated by spicebatch\n.end\n";

/// Editor settings, usually loaded as the `[editor]` table of a
/// [`BatchConfig`](crate::config::BatchConfig).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    /// Directive keywords allowed at most once per document.
    pub unique_directives: Vec<String>,
    /// Directories searched for `.LIB`/`.INC` files after the template's own.
    pub library_paths: Vec<PathBuf>,
    /// Separator in instance paths such as `X1:X2:R1`.
    pub divider: char,
    /// Extension given to written artifacts.
    pub artifact_extension: String,
    /// Start from an empty netlist when the template file is missing.
    pub create_blank: bool,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            unique_directives: [".AC", ".DC", ".TRAN", ".NOISE", ".TF"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            library_paths: Vec::new(),
            divider: ':',
            artifact_extension: "net".to_string(),
            create_blank: false,
        }
    }
}

#[derive(Debug, Clone)]
enum Template {
    File(PathBuf),
    Text { name: String, text: String },
}

#[derive(Debug, Clone)]
pub struct CircuitDocument {
    template: Template,
    config: EditorConfig,
    title: Option<String>,
    root: CircuitNode,
    /// Lines after the top-level `.END`, kept verbatim.
    trailer: String,
    /// Specialized copies in creation order, keyed by instance path.
    specialized: Vec<(String, CircuitNode)>,
}

struct Parsed {
    title: Option<String>,
    root: CircuitNode,
    trailer: String,
}

fn parse_netlist(text: &str, origin: &str) -> Result<Parsed> {
    let mut lines = text.split_inclusive('\n');
    let title = lines.next().map(str::to_string);
    let (root, closed) = CircuitNode::parse_block(&mut lines)?;
    if !closed {
        return Err(SpiceBatchError::MalformedDocument(format!(
            "{}: missing .END or .ENDS",
            origin
        )));
    }
    let trailer = lines.collect();
    Ok(Parsed { title, root, trailer })
}

impl CircuitDocument {
    /// Load a template with the default editor settings.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, EditorConfig::default())
    }

    pub fn open_with(path: impl AsRef<Path>, config: EditorConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.extension().and_then(|e| e.to_str()) != Some(config.artifact_extension.as_str()) {
            tracing::warn!(path = %path.display(), "template has an unexpected extension");
        }
        Self::load(Template::File(path), config)
    }

    /// Build a document from netlist text held in memory.
    ///
    /// `name` stands in for the template file stem when naming artifacts.
    pub fn from_text(name: &str, text: &str, config: EditorConfig) -> Result<Self> {
        let template = Template::Text {
            name: name.to_string(),
            text: text.to_string(),
        };
        Self::load(template, config)
    }

    fn load(template: Template, config: EditorConfig) -> Result<Self> {
        let mut doc = Self {
            template,
            config,
            title: None,
            root: CircuitNode::new(),
            trailer: String::new(),
            specialized: Vec::new(),
        };
        doc.reset()?;
        Ok(doc)
    }

    /// Discard every edit and re-parse the template.
    pub fn reset(&mut self) -> Result<()> {
        let parsed = match &self.template {
            Template::File(path) => {
                let origin = path.display().to_string();
                if path.exists() {
                    let bytes = std::fs::read(path)?;
                    parse_netlist(&String::from_utf8_lossy(&bytes), &origin)?
                } else if self.config.create_blank {
                    tracing::info!(path = %origin, "template missing, starting from a blank netlist");
                    parse_netlist(BLANK_NETLIST, &origin)?
                } else {
                    return Err(SpiceBatchError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("netlist file not found: {}", origin),
                    )));
                }
            }
            Template::Text { name, text } => parse_netlist(text, name)?,
        };
        self.title = parsed.title;
        self.root = parsed.root;
        self.trailer = parsed.trailer;
        self.specialized.clear();
        Ok(())
    }

    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    /// Template file, if the document was loaded from one.
    pub fn template_path(&self) -> Option<&Path> {
        match &self.template {
            Template::File(path) => Some(path),
            Template::Text { .. } => None,
        }
    }

    /// Base name used for generated artifacts.
    pub fn stem(&self) -> String {
        match &self.template {
            Template::File(path) => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "netlist".to_string()),
            Template::Text { name, .. } => name.clone(),
        }
    }

    pub fn root(&self) -> &CircuitNode {
        &self.root
    }

    /// Instance paths that currently have a specialized copy.
    pub fn specialized_paths(&self) -> impl Iterator<Item = &str> {
        self.specialized.iter().map(|(path, _)| path.as_str())
    }

    // -----------------------------------------------------------------------
    // Path resolution
    // -----------------------------------------------------------------------

    fn resolve_context(&self) -> ResolveContext<'_> {
        ResolveContext {
            base_dir: self.template_path().and_then(Path::parent),
            search_paths: &self.config.library_paths,
            divider: self.config.divider,
        }
    }

    fn specialized_index(&self, path: &str) -> Option<usize> {
        self.specialized.iter().position(|(p, _)| p == path)
    }

    /// Definition used by the instance at `path`, starting from the deepest
    /// already-specialized ancestor.
    fn resolve_definition(&self, path: &str) -> Result<CircuitNode> {
        let divider = self.config.divider;
        let ctx = self.resolve_context();
        let separator = divider.to_string();
        let segments: Vec<&str> = path.split(divider).collect();
        for depth in (1..segments.len()).rev() {
            let prefix = segments[..depth].join(separator.as_str());
            if let Some(i) = self.specialized_index(&prefix) {
                let rest = segments[depth..].join(separator.as_str());
                return self.specialized[i]
                    .1
                    .resolve_nested_instance(&rest, &[&self.root], &ctx)
                    .map(Cow::into_owned);
            }
        }
        self.root
            .resolve_nested_instance(path, &[], &ctx)
            .map(Cow::into_owned)
    }

    /// Index of the specialized copy for `scope`, creating it on first use.
    fn specialize(&mut self, scope: &str) -> Result<usize> {
        if let Some(i) = self.specialized_index(scope) {
            return Ok(i);
        }
        let definition = self.resolve_definition(scope)?;
        let original = definition.name().unwrap_or("subckt").to_string();
        let new_name = format!("{}_{}", original, scope.replace(self.config.divider, "_"));
        let copy = definition.duplicate(Some(&new_name))?;

        match scope.rsplit_once(self.config.divider) {
            Some((parent, instance)) => {
                let p = self.specialize(parent)?;
                self.specialized[p].1.set_component_value(instance, new_name.as_str())?;
            }
            None => self.root.set_component_value(scope, new_name.as_str())?,
        }
        tracing::debug!(%scope, %original, %new_name, "sub-circuit specialized");
        self.specialized.push((scope.to_string(), copy));
        Ok(self.specialized.len() - 1)
    }

    /// Apply `edit` to the element at `path`, specializing its scope first.
    ///
    /// When the scope has no copy yet and the edit fails, the new copy and
    /// the rewritten instance lines are dropped again.
    fn edit_at<T, F>(&mut self, path: &str, edit: F) -> Result<T>
    where
        F: FnOnce(&mut CircuitNode, &str) -> Result<T>,
    {
        let Some((scope, leaf)) = path.rsplit_once(self.config.divider) else {
            return edit(&mut self.root, path);
        };
        if let Some(i) = self.specialized_index(scope) {
            return edit(&mut self.specialized[i].1, leaf);
        }
        let saved = (self.root.clone(), self.specialized.clone());

        let result = match self.specialize(scope) {
            Ok(i) => edit(&mut self.specialized[i].1, leaf),
            Err(e) => Err(e),
        };
        if result.is_err() {
            (self.root, self.specialized) = saved;
            tracing::debug!(%path, "nested edit failed, specialization undone");
        }
        result
    }

    /// Node that owns the element at `path`, without specializing.
    fn target<'p>(&self, path: &'p str) -> Result<(Cow<'_, CircuitNode>, &'p str)> {
        match path.rsplit_once(self.config.divider) {
            Some((scope, leaf)) => match self.specialized_index(scope) {
                Some(i) => Ok((Cow::Borrowed(&self.specialized[i].1), leaf)),
                None => Ok((Cow::Owned(self.resolve_definition(scope)?), leaf)),
            },
            None => Ok((Cow::Borrowed(&self.root), path)),
        }
    }

    // -----------------------------------------------------------------------
    // Element edits
    // -----------------------------------------------------------------------

    /// Set the value of `path` (`R1`, or `X1:R1` inside an instance).
    pub fn set_component_value(&mut self, path: &str, value: impl Into<ComponentValue>) -> Result<()> {
        let value: ComponentValue = value.into();
        self.edit_at(path, |node, designator| node.set_component_value(designator, value))
    }

    pub fn set_component_values<I, K, V>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<ComponentValue>,
    {
        for (path, value) in values {
            self.set_component_value(path.as_ref(), value)?;
        }
        Ok(())
    }

    pub fn get_component_value(&self, path: &str) -> Result<String> {
        let (node, designator) = self.target(path)?;
        node.get_component_value(designator)
    }

    pub fn get_component_float_value(&self, path: &str) -> Result<f64> {
        let (node, designator) = self.target(path)?;
        node.get_component_float_value(designator)
    }

    pub fn set_element_model(&mut self, path: &str, model: &str) -> Result<()> {
        self.edit_at(path, |node, designator| node.set_element_model(designator, model))
    }

    pub fn get_element_model(&self, path: &str) -> Result<String> {
        let (node, designator) = self.target(path)?;
        node.get_element_model(designator)
    }

    pub fn get_component_nodes(&self, path: &str) -> Result<Vec<String>> {
        let (node, designator) = self.target(path)?;
        node.get_component_nodes(designator)
    }

    pub fn get_component_info(&self, path: &str) -> Result<ComponentInfo> {
        let (node, designator) = self.target(path)?;
        node.get_component_info(designator)
    }

    pub fn remove_component(&mut self, path: &str) -> Result<()> {
        self.edit_at(path, |node, designator| node.remove_component(designator))
    }

    /// Top-level designators whose prefix letter is in `prefixes` (`"*"` for all).
    pub fn get_components(&self, prefixes: &str) -> Vec<String> {
        self.root.get_components(prefixes)
    }

    pub fn get_all_nodes(&self) -> Result<Vec<String>> {
        self.root.get_all_nodes()
    }

    // -----------------------------------------------------------------------
    // Parameters and directives
    // -----------------------------------------------------------------------

    pub fn set_parameter(&mut self, name: &str, value: impl Into<ComponentValue>) -> Result<()> {
        self.root.set_parameter(name, value)
    }

    pub fn set_parameters<I, K, V>(&mut self, params: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<ComponentValue>,
    {
        for (name, value) in params {
            self.root.set_parameter(name.as_ref(), value)?;
        }
        Ok(())
    }

    pub fn get_parameter(&self, name: &str) -> Result<String> {
        self.root.get_parameter(name)
    }

    pub fn add_directive(&mut self, text: &str) -> Result<()> {
        self.root.add_directive(text, &self.config.unique_directives)
    }

    pub fn add_directives<I, S>(&mut self, directives: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for directive in directives {
            self.add_directive(directive.as_ref())?;
        }
        Ok(())
    }

    pub fn remove_directive(&mut self, text: &str) -> Result<()> {
        self.root.remove_directive(text)
    }

    // -----------------------------------------------------------------------
    // Output
    // -----------------------------------------------------------------------

    /// Every physical line of the document: title, top-level body with
    /// each specialized copy inserted before the final `.END`, then
    /// anything after `.END`.
    fn output_lines(&self) -> Vec<&str> {
        let copies: Vec<&CircuitNode> = self.specialized.iter().map(|(_, node)| node).collect();
        let mut lines: Vec<&str> = self.title.iter().map(String::as_str).collect();
        lines.extend(self.root.output_lines(&copies));
        lines.push(&self.trailer);
        lines
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        for line in self.output_lines() {
            writer.write_all(line.as_bytes())?;
        }
        Ok(())
    }

    pub fn to_text(&self) -> String {
        self.output_lines().concat()
    }

    /// Write the document to `path` with its extension normalized.
    ///
    /// Returns the path actually written.
    pub fn write_artifact(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref().with_extension(&self.config.artifact_extension);
        let mut writer = BufWriter::new(File::create(&path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        tracing::debug!(path = %path.display(), clones = self.specialized.len(), "artifact written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "\
* amplifier test bench
V1 in 0 AC 1
R1 in mid 2k
X1 mid out stage
X2 out load stage
.SUBCKT stage a b
R1 a b 1k
C1 b 0 10p
.ENDS stage
.tran 1u 1m
.end
";

    fn doc() -> CircuitDocument {
        CircuitDocument::from_text("bench", TEMPLATE, EditorConfig::default()).expect("parse failed")
    }

    #[test]
    fn test_round_trip_is_byte_identical() {
        assert_eq!(doc().to_text(), TEMPLATE);
    }

    #[test]
    fn test_title_line_is_not_an_element() {
        let text = "R1 is just the title\nR1 a b 5k\n.end\n";
        let d = CircuitDocument::from_text("t", text, EditorConfig::default()).unwrap();
        assert_eq!(d.get_component_value("R1").unwrap(), "5k");
    }

    #[test]
    fn test_missing_end_is_malformed() {
        let err = CircuitDocument::from_text("t", "title\nR1 a b 1k\n", EditorConfig::default())
            .unwrap_err();
        assert!(matches!(err, SpiceBatchError::MalformedDocument(_)));
    }

    #[test]
    fn test_set_top_level_value() {
        let mut d = doc();
        d.set_component_value("R1", "4k").unwrap();
        assert_eq!(d.get_component_value("R1").unwrap(), "4k");
        assert!(matches!(
            d.set_component_value("R7", "1k"),
            Err(SpiceBatchError::ComponentNotFound(_))
        ));
    }

    #[test]
    fn test_path_edit_specializes_instance() {
        let mut d = doc();
        d.set_component_value("X1:R1", 500.0).unwrap();

        assert_eq!(d.get_component_value("X1:R1").unwrap(), "500");
        assert_eq!(d.get_component_value("X2:R1").unwrap(), "1k");
        assert_eq!(d.get_component_value("X1").unwrap(), "stage_X1");
        assert_eq!(d.get_component_value("X2").unwrap(), "stage");

        let text = d.to_text();
        assert!(text.contains(".SUBCKT stage a b\nR1 a b 1k\n"));
        assert!(text.contains(".SUBCKT stage_X1 a b\n"));
        assert!(text.contains("R1 a b 500\n"));
        let clone_at = text.find(".SUBCKT stage_X1").unwrap();
        let end_at = text.rfind(".end").unwrap();
        assert!(clone_at < end_at);
    }

    #[test]
    fn test_repeated_path_edits_reuse_clone() {
        let mut d = doc();
        d.set_component_value("X1:R1", "2k").unwrap();
        d.set_component_value("X1:C1", "22p").unwrap();
        assert_eq!(d.specialized_paths().count(), 1);
        let text = d.to_text();
        assert_eq!(text.matches(".SUBCKT stage_X1").count(), 1);
        assert!(text.contains("C1 b 0 22p\n"));
    }

    #[test]
    fn test_reset_discards_clones() {
        let mut d = doc();
        d.set_component_value("X1:R1", "2k").unwrap();
        d.set_parameter("gain", 3).unwrap();
        d.reset().unwrap();
        assert_eq!(d.specialized_paths().count(), 0);
        assert_eq!(d.to_text(), TEMPLATE);
    }

    #[test]
    fn test_unique_directive_second_wins() {
        let mut d = doc();
        d.add_directive(".tran 1n 10u").unwrap();
        d.add_directive(".TRAN 2n 20u").unwrap();
        let text = d.to_text();
        let count = text
            .lines()
            .filter(|l| l.to_uppercase().starts_with(".TRAN"))
            .count();
        assert_eq!(count, 1);
        assert!(text.contains(".TRAN 2n 20u\n"));
    }

    #[test]
    fn test_unknown_instance_path() {
        let mut d = doc();
        assert!(matches!(
            d.set_component_value("X9:R1", "1k"),
            Err(SpiceBatchError::ComponentNotFound(_))
        ));
        assert_eq!(d.specialized_paths().count(), 0);
    }

    #[test]
    fn test_failed_nested_edit_leaves_document_untouched() {
        let mut d = doc();
        assert!(matches!(
            d.set_component_value("X1:R9", "1k"),
            Err(SpiceBatchError::ComponentNotFound(_))
        ));
        assert!(d.set_element_model("X1:C1", "cmod").is_err());
        assert_eq!(d.specialized_paths().count(), 0);
        assert_eq!(d.get_component_value("X1").unwrap(), "stage");
        assert_eq!(d.to_text(), TEMPLATE);

        d.set_component_value("X1:R1", "3k").unwrap();
        assert!(d.set_component_value("X1:R9", "1k").is_err());
        assert_eq!(d.specialized_paths().collect::<Vec<_>>(), vec!["X1"]);
        assert_eq!(d.get_component_value("X1:R1").unwrap(), "3k");
    }

    #[test]
    fn test_added_lines_follow_crlf_template() {
        let text = "* crlf bench\r\nR1 a 0 1k\r\n.end\r\n";
        let mut d = CircuitDocument::from_text("crlf", text, EditorConfig::default()).unwrap();
        d.set_parameter("gain", 2).unwrap();
        d.add_directive(".op\n").unwrap();
        assert_eq!(
            d.to_text(),
            "* crlf bench\r\nR1 a 0 1k\r\n.PARAM gain=2\r\n.op\r\n.end\r\n"
        );
    }
}
