//! Hierarchical netlist model.
//!
//! A [`CircuitNode`] is an ordered list of entries. Each entry is either a
//! raw logical line (continuations folded in, terminators kept) or a nested
//! sub-circuit block. A block's first entry is always its `.SUBCKT` line
//! and its last entry its `.ENDS` line. Everything that is not edited is
//! written back byte-for-byte.

use std::borrow::Cow;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Result, SpiceBatchError};
use crate::syntax::{self, ElementKind, Field, LineKind, Span};
use crate::units::{format_eng, parse_eng};

const SPECIALIZED_HEADER: &str = "***** spicebatch specialized copy ****\n";
const SPECIALIZED_FOOTER: &str = "***** end of spicebatch specialized copy ****\n";

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A value written into an element or parameter field.
///
/// Numbers are rendered in engineering notation; text is inserted verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentValue {
    Text(String),
    Number(f64),
}

impl fmt::Display for ComponentValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentValue::Text(text) => f.write_str(text),
            ComponentValue::Number(value) => f.write_str(&format_eng(*value)),
        }
    }
}

impl From<&str> for ComponentValue {
    fn from(text: &str) -> Self {
        ComponentValue::Text(text.to_string())
    }
}

impl From<String> for ComponentValue {
    fn from(text: String) -> Self {
        ComponentValue::Text(text)
    }
}

impl From<f64> for ComponentValue {
    fn from(value: f64) -> Self {
        ComponentValue::Number(value)
    }
}

impl From<i32> for ComponentValue {
    fn from(value: i32) -> Self {
        ComponentValue::Number(value as f64)
    }
}

/// Everything known about one element line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentInfo {
    pub designator: String,
    pub kind: ElementKind,
    pub nodes: Vec<String>,
    pub model: Option<String>,
    pub value: Option<String>,
    pub params: Option<String>,
    /// Entry index inside the owning node.
    pub line: usize,
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Line(String),
    Block(CircuitNode),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitNode {
    entries: Vec<Entry>,
}

/// Where nested sub-circuit definitions may be looked up.
#[derive(Debug, Clone, Copy)]
pub struct ResolveContext<'a> {
    /// Directory of the template; relative `.LIB`/`.INC` paths resolve here first.
    pub base_dir: Option<&'a Path>,
    /// Extra directories searched after the base directory.
    pub search_paths: &'a [PathBuf],
    /// Separator between instance names in a path (`X1:X2:R1`).
    pub divider: char,
}

fn first_token_is(line: &str, token: &str) -> bool {
    line.split_whitespace()
        .next()
        .is_some_and(|t| t.eq_ignore_ascii_case(token))
}

fn is_closing(line: &str) -> bool {
    first_token_is(line, ".END") || first_token_is(line, ".ENDS")
}

/// Line terminator of a stored line, or `"\n"` when it has none.
fn terminator(line: &str) -> &str {
    if line.ends_with("\r\n") {
        "\r\n"
    } else {
        "\n"
    }
}

/// `text` ending in `ending`, whatever terminator it came with.
fn with_terminator(text: &str, ending: &str) -> String {
    format!("{}{}", without_terminator(text), ending)
}

fn without_terminator(text: &str) -> &str {
    text.trim_end_matches(['\r', '\n'])
}

/// Command key of a line: element prefix (`"R"`), directive (`".PARAM"`),
/// `"+"` or `"*"`.
fn line_command(line: &str) -> Option<String> {
    match syntax::classify(line).ok()? {
        LineKind::Element(kind) => Some(kind.prefix().to_string()),
        LineKind::Directive(d) => Some(d),
        LineKind::Continuation => Some("+".to_string()),
        LineKind::Comment => Some("*".to_string()),
    }
}

impl CircuitNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    // -----------------------------------------------------------------------
    // Parsing
    // -----------------------------------------------------------------------

    /// Consume lines until the closing `.END`/`.ENDS` of this block.
    ///
    /// `.SUBCKT` lines open nested blocks. Lines starting with `+` are
    /// appended to the previous line. Returns the node and whether the
    /// closing line was seen before the source ran out.
    pub fn parse_block<'a, I>(lines: &mut I) -> Result<(CircuitNode, bool)>
    where
        I: Iterator<Item = &'a str>,
    {
        let mut node = CircuitNode::new();
        let closed = node.parse_into(lines)?;
        Ok((node, closed))
    }

    /// Parse a sub-circuit whose `.SUBCKT` line has already been read.
    pub fn parse_subcircuit<'a, I>(opening: &str, lines: &mut I) -> Result<(CircuitNode, bool)>
    where
        I: Iterator<Item = &'a str>,
    {
        let mut node = CircuitNode {
            entries: vec![Entry::Line(opening.to_string())],
        };
        let closed = node.parse_into(lines)?;
        Ok((node, closed))
    }

    fn parse_into<'a, I>(&mut self, lines: &mut I) -> Result<bool>
    where
        I: Iterator<Item = &'a str>,
    {
        while let Some(line) = lines.next() {
            let trimmed = line.trim_start_matches([' ', '\t']);
            if trimmed.starts_with('+') {
                match self.entries.last_mut() {
                    Some(Entry::Line(previous)) => previous.push_str(line),
                    _ => {
                        return Err(SpiceBatchError::MalformedDocument(format!(
                            "continuation line without a preceding line: {}",
                            without_terminator(line)
                        )))
                    }
                }
                continue;
            }
            if first_token_is(trimmed, ".CONTROL") {
                self.entries.push(Entry::Line(Self::control_block(line, lines)?));
                continue;
            }
            if first_token_is(trimmed, ".SUBCKT") {
                let (block, closed) = CircuitNode::parse_subcircuit(line, lines)?;
                if !closed {
                    return Ok(false);
                }
                self.entries.push(Entry::Block(block));
                continue;
            }
            self.entries.push(Entry::Line(line.to_string()));
            if is_closing(trimmed) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// A `.CONTROL` section up to and including its `.ENDC`, as one entry.
    ///
    /// Its body is simulator script, never netlist elements.
    fn control_block<'a, I>(opening: &str, lines: &mut I) -> Result<String>
    where
        I: Iterator<Item = &'a str>,
    {
        let mut block = opening.to_string();
        for line in lines.by_ref() {
            block.push_str(line);
            if first_token_is(line, ".ENDC") {
                return Ok(block);
            }
        }
        Err(SpiceBatchError::MalformedDocument(
            ".CONTROL section without .ENDC".into(),
        ))
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Index of the first top-level line whose leading token equals
    /// `token` (case-insensitive). Nested blocks are skipped.
    pub fn find_first_line(&self, token: &str) -> Result<usize> {
        self.entries
            .iter()
            .position(|e| matches!(e, Entry::Line(l) if first_token_is(l, token)))
            .ok_or_else(|| SpiceBatchError::ComponentNotFound(token.to_string()))
    }

    /// First top-level line of command `command` (an element prefix such
    /// as `"R"` or a directive such as `".PARAM"`) for which `matcher`
    /// returns `Some`.
    pub fn find_matching<T, F>(&self, command: &str, mut matcher: F) -> Option<(usize, T)>
    where
        F: FnMut(&str) -> Option<T>,
    {
        self.entries.iter().enumerate().find_map(|(i, e)| match e {
            Entry::Line(line)
                if line_command(line).is_some_and(|c| c.eq_ignore_ascii_case(command)) =>
            {
                matcher(line).map(|m| (i, m))
            }
            _ => None,
        })
    }

    fn line(&self, index: usize) -> &str {
        match &self.entries[index] {
            Entry::Line(l) => l,
            Entry::Block(_) => "",
        }
    }

    fn line_mut(&mut self, index: usize) -> Option<&mut String> {
        match self.entries.get_mut(index) {
            Some(Entry::Line(l)) => Some(l),
            _ => None,
        }
    }

    /// Nested block defining sub-circuit `name`.
    pub fn find_block(&self, name: &str) -> Option<&CircuitNode> {
        self.entries.iter().find_map(|e| match e {
            Entry::Block(b) if b.name().is_some_and(|n| n.eq_ignore_ascii_case(name)) => Some(b),
            _ => None,
        })
    }

    fn closing_index(&self) -> Option<usize> {
        self.entries
            .iter()
            .rposition(|e| matches!(e, Entry::Line(l) if is_closing(l)))
    }

    // -----------------------------------------------------------------------
    // Naming
    // -----------------------------------------------------------------------

    fn subckt_name_span(line: &str) -> Option<Span> {
        let mut offset = 0;
        let mut tokens = line.split_whitespace().map(|t| {
            let start = offset + line[offset..].find(t).unwrap_or(0);
            offset = start + t.len();
            start..offset
        });
        let keyword = tokens.next()?;
        if !line[keyword].eq_ignore_ascii_case(".SUBCKT") {
            return None;
        }
        tokens.next()
    }

    /// Sub-circuit name from the `.SUBCKT` line; `None` for the top level.
    pub fn name(&self) -> Option<&str> {
        self.entries.iter().find_map(|e| match e {
            Entry::Line(l) => Self::subckt_name_span(l).map(|s| &l[s]),
            Entry::Block(_) => None,
        })
    }

    /// Rename the sub-circuit in its `.SUBCKT` and `.ENDS` lines.
    pub fn set_name(&mut self, new_name: &str) -> Result<()> {
        let opening = self
            .entries
            .iter()
            .position(|e| matches!(e, Entry::Line(l) if Self::subckt_name_span(l).is_some()))
            .ok_or_else(|| SpiceBatchError::MalformedDocument("missing .SUBCKT line".into()))?;
        if let Some(line) = self.line_mut(opening) {
            if let Some(span) = Self::subckt_name_span(line) {
                line.replace_range(span, new_name);
            }
        }
        let closing = self
            .entries
            .iter()
            .rposition(|e| matches!(e, Entry::Line(l) if first_token_is(l, ".ENDS")))
            .ok_or_else(|| SpiceBatchError::MalformedDocument("missing .ENDS line".into()))?;
        if let Some(line) = self.line_mut(closing) {
            *line = format!(".ENDS {}{}", new_name, terminator(line));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Element fields
    // -----------------------------------------------------------------------

    fn element(&self, designator: &str) -> Result<(usize, syntax::ElementFields)> {
        let index = self.find_first_line(designator)?;
        let fields = syntax::parse_element(self.line(index))?;
        Ok((index, fields))
    }

    fn replace_span(&mut self, index: usize, span: Span, text: &str) {
        if let Some(line) = self.line_mut(index) {
            tracing::debug!(old = &line[span.clone()], new = text, "field edit");
            line.replace_range(span, text);
        }
    }

    fn unrecognized(&self, index: usize, kind: ElementKind) -> SpiceBatchError {
        SpiceBatchError::UnrecognizedFormat {
            kind: kind.prefix(),
            line: without_terminator(self.line(index)).to_string(),
        }
    }

    /// Replace the value field of `designator`.
    pub fn set_component_value(
        &mut self,
        designator: &str,
        value: impl Into<ComponentValue>,
    ) -> Result<()> {
        let (index, fields) = self.element(designator)?;
        let span = fields
            .span(Field::Value)
            .ok_or_else(|| self.unrecognized(index, fields.kind))?;
        self.replace_span(index, span, &value.into().to_string());
        Ok(())
    }

    pub fn get_component_value(&self, designator: &str) -> Result<String> {
        let (index, fields) = self.element(designator)?;
        let span = fields
            .span(Field::Value)
            .ok_or_else(|| self.unrecognized(index, fields.kind))?;
        Ok(self.line(index)[span].to_string())
    }

    /// Value of `designator` parsed as an engineering number.
    pub fn get_component_float_value(&self, designator: &str) -> Result<f64> {
        parse_eng(&self.get_component_value(designator)?)
    }

    fn model_span(&self, designator: &str) -> Result<(usize, Span)> {
        let (index, fields) = self.element(designator)?;
        let span = match (&fields.model, &fields.value) {
            (Some(model), _) => Some(model.clone()),
            (None, Some(value)) if fields.kind.layout().value == syntax::ValueGrammar::Rest => {
                Some(value.clone())
            }
            _ => None,
        };
        span.map(|s| (index, s))
            .ok_or_else(|| self.unrecognized(index, fields.kind))
    }

    /// Replace the model of `designator`.
    ///
    /// Semiconductors carry the model as their value token; R/C/L only
    /// have one when a model token precedes the value; sources take the
    /// whole remainder of the line after the nodes.
    pub fn set_element_model(&mut self, designator: &str, model: &str) -> Result<()> {
        let (index, span) = self.model_span(designator)?;
        self.replace_span(index, span, model);
        Ok(())
    }

    pub fn get_element_model(&self, designator: &str) -> Result<String> {
        let (index, span) = self.model_span(designator)?;
        Ok(self.line(index)[span].to_string())
    }

    pub fn get_component_nodes(&self, designator: &str) -> Result<Vec<String>> {
        let (index, fields) = self.element(designator)?;
        Ok(fields
            .node_names(self.line(index))
            .into_iter()
            .map(str::to_string)
            .collect())
    }

    pub fn get_component_info(&self, designator: &str) -> Result<ComponentInfo> {
        let (index, fields) = self.element(designator)?;
        let line = self.line(index);
        let text = |span: &Option<Span>| span.clone().map(|s| line[s].to_string());
        Ok(ComponentInfo {
            designator: line[fields.designator.clone()].to_string(),
            kind: fields.kind,
            nodes: fields.node_names(line).into_iter().map(str::to_string).collect(),
            model: text(&fields.model),
            value: text(&fields.value),
            params: text(&fields.params),
            line: index,
        })
    }

    /// Designators of top-level elements whose prefix is in `prefixes`.
    ///
    /// `"*"` selects every element type. Nested blocks are not searched.
    pub fn get_components(&self, prefixes: &str) -> Vec<String> {
        let wanted: Vec<char> = if prefixes == "*" {
            ElementKind::all_prefixes().collect()
        } else {
            prefixes.chars().map(|c| c.to_ascii_uppercase()).collect()
        };
        self.entries
            .iter()
            .filter_map(|e| match e {
                Entry::Line(l) => match syntax::classify(l) {
                    Ok(LineKind::Element(kind)) if wanted.contains(&kind.prefix()) => {
                        l.split_whitespace().next().map(str::to_string)
                    }
                    _ => None,
                },
                Entry::Block(_) => None,
            })
            .collect()
    }

    /// Every node named by a top-level element, in first-seen order.
    ///
    /// Lines whose element type has no known grammar are skipped; lines
    /// that do not fit their grammar are an error.
    pub fn get_all_nodes(&self) -> Result<Vec<String>> {
        let mut nodes: Vec<String> = Vec::new();
        for entry in &self.entries {
            let Entry::Line(line) = entry else { continue };
            if !matches!(syntax::classify(line), Ok(LineKind::Element(_))) {
                continue;
            }
            let fields = match syntax::parse_element(line) {
                Ok(fields) => fields,
                Err(SpiceBatchError::UnsupportedElementType(_)) => continue,
                Err(e) => return Err(e),
            };
            for name in fields.node_names(line) {
                if !nodes.iter().any(|n| n == name) {
                    nodes.push(name.to_string());
                }
            }
        }
        Ok(nodes)
    }

    pub fn remove_component(&mut self, designator: &str) -> Result<()> {
        let index = self.find_first_line(designator)?;
        self.entries.remove(index);
        tracing::debug!(designator, "component removed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Parameters
    // -----------------------------------------------------------------------

    fn find_parameter(&self, name: &str) -> Option<(usize, Span)> {
        self.find_matching(".PARAM", |line| {
            syntax::assignments(line)
                .into_iter()
                .find(|(n, _)| line[n.clone()].eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        })
    }

    pub fn get_parameter(&self, name: &str) -> Result<String> {
        self.find_parameter(name)
            .map(|(index, span)| self.line(index)[span].to_string())
            .ok_or_else(|| SpiceBatchError::ParameterNotFound(name.to_string()))
    }

    /// Update `name` in place, or add a `.PARAM` line for it.
    pub fn set_parameter(&mut self, name: &str, value: impl Into<ComponentValue>) -> Result<()> {
        let value = value.into().to_string();
        match self.find_parameter(name) {
            Some((index, span)) => self.replace_span(index, span, &value),
            None => {
                let line = format!(".PARAM {}={}{}", name, value, self.line_ending());
                tracing::debug!(%name, %value, "parameter added");
                self.insert_near_end(line);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Directives
    // -----------------------------------------------------------------------

    /// Position before `.BACKANNO`, else before the closing line, else the end.
    fn insertion_point(&self) -> usize {
        self.entries
            .iter()
            .position(|e| matches!(e, Entry::Line(l) if first_token_is(l, ".BACKANNO")))
            .or_else(|| self.closing_index())
            .unwrap_or(self.entries.len())
    }

    /// Terminator used by the closing line, so added lines match the template.
    fn line_ending(&self) -> &'static str {
        match self.closing_index().map(|i| terminator(self.line(i))) {
            Some("\r\n") => "\r\n",
            _ => "\n",
        }
    }

    fn insert_near_end(&mut self, line: String) {
        let at = self.insertion_point();
        self.entries.insert(at, Entry::Line(line));
    }

    /// Add a directive line.
    ///
    /// A directive whose keyword is in `unique` replaces the first existing
    /// directive of the same keyword, and any further ones are dropped.
    /// Other directives are added once; an identical line already present
    /// is left alone.
    pub fn add_directive(&mut self, text: &str, unique: &[String]) -> Result<()> {
        let directive = with_terminator(text, self.line_ending());
        let keyword = syntax::first_token_upper(&directive);
        if unique.iter().any(|u| u.eq_ignore_ascii_case(&keyword)) {
            let same_kind: Vec<usize> = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| matches!(e, Entry::Line(l) if first_token_is(l, &keyword)))
                .map(|(i, _)| i)
                .collect();
            if let Some((&first, rest)) = same_kind.split_first() {
                for &i in rest.iter().rev() {
                    self.entries.remove(i);
                }
                tracing::debug!(%keyword, replaced = same_kind.len(), "unique directive replaced");
                self.entries[first] = Entry::Line(directive);
                return Ok(());
            }
        } else if keyword == ".PARAM" {
            tracing::warn!("add .PARAM lines with set_parameter so they can be updated later");
        }

        let exists = self.entries.iter().any(
            |e| matches!(e, Entry::Line(l) if without_terminator(l) == without_terminator(&directive)),
        );
        if !exists {
            self.insert_near_end(directive);
        }
        Ok(())
    }

    /// Remove the first line exactly equal to `text`, line terminators aside.
    pub fn remove_directive(&mut self, text: &str) -> Result<()> {
        let wanted = without_terminator(text);
        let index = self
            .entries
            .iter()
            .position(|e| matches!(e, Entry::Line(l) if without_terminator(l) == wanted))
            .ok_or_else(|| SpiceBatchError::DirectiveNotFound(wanted.to_string()))?;
        self.entries.remove(index);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Specialization
    // -----------------------------------------------------------------------

    /// Deep copy marked as a specialized sub-circuit, optionally renamed.
    ///
    /// The marker comments go inside the `.SUBCKT`/`.ENDS` pair so the copy
    /// still opens and closes with its declarations.
    pub fn duplicate(&self, new_name: Option<&str>) -> Result<CircuitNode> {
        let mut copy = self.clone();
        let opening = copy
            .entries
            .iter()
            .position(|e| matches!(e, Entry::Line(l) if Self::subckt_name_span(l).is_some()))
            .map_or(0, |i| i + 1);
        copy.entries
            .insert(opening, Entry::Line(SPECIALIZED_HEADER.to_string()));
        let closing = copy
            .entries
            .iter()
            .rposition(|e| matches!(e, Entry::Line(l) if first_token_is(l, ".ENDS")))
            .unwrap_or(copy.entries.len());
        copy.entries
            .insert(closing, Entry::Line(SPECIALIZED_FOOTER.to_string()));
        if let Some(name) = new_name {
            copy.set_name(name)?;
        }
        Ok(copy)
    }

    /// Definition used by the instance at `path` (`X1` or `X1:X2`).
    ///
    /// The definition is searched for in this node's blocks, then in the
    /// enclosing `scopes` (innermost last), then in `.LIB`/`.INC` files
    /// declared by this node or its scopes.
    pub fn resolve_nested_instance<'a>(
        &'a self,
        path: &str,
        scopes: &[&'a CircuitNode],
        ctx: &ResolveContext<'_>,
    ) -> Result<Cow<'a, CircuitNode>> {
        let (head, tail) = match path.split_once(ctx.divider) {
            Some((head, tail)) => (head, Some(tail)),
            None => (path, None),
        };
        let (index, fields) = self.element(head)?;
        if fields.kind != ElementKind::Subcircuit {
            return Err(SpiceBatchError::ComponentNotFound(format!(
                "{} is not a sub-circuit instance",
                head
            )));
        }
        let line = self.line(index);
        let subckt = fields
            .value
            .map(|s| line[s].to_string())
            .ok_or_else(|| self.unrecognized(index, fields.kind))?;

        let definition = match self.find_block(&subckt) {
            Some(block) => Cow::Borrowed(block),
            None => match scopes.iter().rev().find_map(|&s| s.find_block(&subckt)) {
                Some(block) => Cow::Borrowed(block),
                None => {
                    let mut chain: Vec<&CircuitNode> = scopes.to_vec();
                    chain.push(self);
                    Cow::Owned(find_in_libraries(&chain, &subckt, ctx)?)
                }
            },
        };

        let Some(tail) = tail else {
            return Ok(definition);
        };
        let mut inner: Vec<&CircuitNode> = scopes.to_vec();
        inner.push(self);
        match definition {
            Cow::Borrowed(block) => block.resolve_nested_instance(tail, &inner, ctx),
            Cow::Owned(block) => block
                .resolve_nested_instance(tail, &inner, ctx)
                .map(|found| Cow::Owned(found.into_owned())),
        }
    }

    /// Library files named by top-level `.LIB`/`.INC` lines.
    fn library_references(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                Entry::Line(l)
                    if [".LIB", ".INC", ".INCLUDE"].iter().any(|k| first_token_is(l, k)) =>
                {
                    l.split_whitespace()
                        .nth(1)
                        .map(|f| f.trim_matches(['"', '\'']).to_string())
                }
                _ => None,
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Output
    // -----------------------------------------------------------------------

    fn collect_lines<'a>(&'a self, out: &mut Vec<&'a str>) {
        for entry in &self.entries {
            match entry {
                Entry::Line(line) => out.push(line),
                Entry::Block(block) => block.collect_lines(out),
            }
        }
    }

    /// Every physical line in output order, with `extra` blocks placed
    /// just before the closing line (or at the end when there is none).
    pub(crate) fn output_lines<'a>(&'a self, extra: &[&'a CircuitNode]) -> Vec<&'a str> {
        let closing = self.closing_index();
        let mut out = Vec::new();
        for (i, entry) in self.entries.iter().enumerate() {
            if Some(i) == closing {
                extra.iter().for_each(|block| block.collect_lines(&mut out));
            }
            match entry {
                Entry::Line(line) => out.push(line),
                Entry::Block(block) => block.collect_lines(&mut out),
            }
        }
        if closing.is_none() {
            extra.iter().for_each(|block| block.collect_lines(&mut out));
        }
        out
    }

    /// Write every entry, nested blocks included, in order.
    pub fn write_lines<W: Write>(&self, writer: &mut W) -> Result<()> {
        for line in self.output_lines(&[]) {
            writer.write_all(line.as_bytes())?;
        }
        Ok(())
    }
}

impl fmt::Display for CircuitNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.output_lines(&[]).into_iter().try_for_each(|line| f.write_str(line))
    }
}

// ---------------------------------------------------------------------------
// Libraries
// ---------------------------------------------------------------------------

fn library_candidates(reference: &str, ctx: &ResolveContext<'_>) -> Option<PathBuf> {
    let given = PathBuf::from(reference);
    let mut candidates = Vec::new();
    if given.is_relative() {
        if let Some(base) = ctx.base_dir {
            candidates.push(base.join(&given));
        }
    }
    candidates.push(given.clone());
    candidates.extend(ctx.search_paths.iter().map(|p| p.join(&given)));
    candidates.into_iter().find(|c| c.is_file())
}

fn find_in_libraries(
    chain: &[&CircuitNode],
    subckt: &str,
    ctx: &ResolveContext<'_>,
) -> Result<CircuitNode> {
    for node in chain.iter().rev() {
        for reference in node.library_references() {
            let Some(path) = library_candidates(&reference, ctx) else {
                tracing::debug!(%reference, "library not found on any search path");
                continue;
            };
            if let Some(found) = load_subcircuit(&path, subckt)? {
                tracing::debug!(%subckt, library = %path.display(), "sub-circuit loaded from library");
                return Ok(found);
            }
        }
    }
    Err(SpiceBatchError::ComponentNotFound(format!(
        "sub-circuit \"{}\"",
        subckt
    )))
}

/// Parse the definition of `subckt` out of a library file.
pub fn load_subcircuit(library: &Path, subckt: &str) -> Result<Option<CircuitNode>> {
    let bytes = std::fs::read(library)?;
    let text = String::from_utf8_lossy(&bytes);
    let mut lines = text.split_inclusive('\n');
    while let Some(line) = lines.next() {
        if CircuitNode::subckt_name_span(line).is_some_and(|s| line[s].eq_ignore_ascii_case(subckt)) {
            let (node, closed) = CircuitNode::parse_subcircuit(line, &mut lines)?;
            if !closed {
                return Err(SpiceBatchError::MalformedDocument(format!(
                    "unterminated .SUBCKT {} in {}",
                    subckt,
                    library.display()
                )));
            }
            return Ok(Some(node));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NETLIST: &str = "\
R1 in out 2k
C1 out 0 100n
.SUBCKT filt a b
R1 a b 1k
.ENDS filt
X1 in out filt
.tran 1m
.backanno
.end
";

    fn parse(text: &str) -> CircuitNode {
        let mut lines = text.split_inclusive('\n');
        let (node, closed) = CircuitNode::parse_block(&mut lines).expect("parse failed");
        assert!(closed);
        node
    }

    fn to_text(node: &CircuitNode) -> String {
        node.to_string()
    }

    #[test]
    fn test_parse_round_trip() {
        let node = parse(NETLIST);
        assert_eq!(to_text(&node), NETLIST);
        assert!(matches!(node.entries()[2], Entry::Block(_)));
    }

    #[test]
    fn test_unterminated_block() {
        let mut lines = "R1 a b 1k\n.SUBCKT x a\nR2 a 0 1\n".split_inclusive('\n');
        let (_, closed) = CircuitNode::parse_block(&mut lines).unwrap();
        assert!(!closed);
    }

    #[test]
    fn test_continuation_appends() {
        let node = parse("R1 a b\n+ 5k\n.end\n");
        assert_eq!(node.entries().len(), 2);
        assert_eq!(node.get_component_value("R1").unwrap(), "5k");
    }

    #[test]
    fn test_leading_continuation_is_malformed() {
        let mut lines = "+ 5k\n.end\n".split_inclusive('\n');
        assert!(matches!(
            CircuitNode::parse_block(&mut lines),
            Err(SpiceBatchError::MalformedDocument(_))
        ));
    }

    #[test]
    fn test_find_first_line_skips_blocks() {
        let node = parse(NETLIST);
        assert_eq!(node.find_first_line("r1").unwrap(), 0);
        assert!(matches!(
            node.find_first_line("R9"),
            Err(SpiceBatchError::ComponentNotFound(_))
        ));
    }

    #[test]
    fn test_find_matching_returns_none_when_absent() {
        let node = parse(NETLIST);
        let hit = node.find_matching("C", |l| l.contains("100n").then_some(()));
        assert_eq!(hit.map(|(i, _)| i), Some(1));
        assert!(node.find_matching("C", |l| l.contains("1u").then_some(())).is_none());
    }

    #[test]
    fn test_set_value_number_and_text() {
        let mut node = parse(NETLIST);
        node.set_component_value("R1", 4700.0).unwrap();
        assert_eq!(node.get_component_value("R1").unwrap(), "4.7k");
        node.set_component_value("C1", "{cval}").unwrap();
        assert_eq!(node.get_component_value("C1").unwrap(), "{cval}");
        assert!(to_text(&node).contains("C1 out 0 {cval}\n"));
    }

    #[test]
    fn test_parameters() {
        let mut node = parse(NETLIST);
        assert!(matches!(
            node.get_parameter("gain"),
            Err(SpiceBatchError::ParameterNotFound(_))
        ));
        node.set_parameter("gain", 10).unwrap();
        assert_eq!(node.get_parameter("GAIN").unwrap(), "10");
        node.set_parameter("gain", "{2*x}").unwrap();
        assert_eq!(node.get_parameter("gain").unwrap(), "{2*x}");
        let text = to_text(&node);
        assert!(text.contains(".PARAM gain={2*x}\n.backanno\n"));
    }

    #[test]
    fn test_unique_directive_replaced() {
        let mut node = parse(NETLIST);
        let unique = vec![".TRAN".to_string()];
        node.add_directive(".TRAN 5m", &unique).unwrap();
        node.add_directive(".meas tran x max v(out)", &unique).unwrap();
        node.add_directive(".meas tran x max v(out)", &unique).unwrap();
        let text = to_text(&node);
        assert_eq!(text.matches(".TRAN").count() + text.matches(".tran").count(), 1);
        assert_eq!(text.matches(".meas").count(), 1);
        assert!(text.contains(".TRAN 5m\n"));
    }

    #[test]
    fn test_remove_directive_exact_match() {
        let mut node = parse(NETLIST);
        assert!(matches!(
            node.remove_directive(".TRAN 1m"),
            Err(SpiceBatchError::DirectiveNotFound(_))
        ));
        node.remove_directive(".tran 1m").unwrap();
        assert!(!to_text(&node).contains(".tran"));
    }

    #[test]
    fn test_duplicate_renames_and_marks() {
        let node = parse(NETLIST);
        let Entry::Block(block) = &node.entries()[2] else {
            panic!("expected block");
        };
        let copy = block.duplicate(Some("filt_X1")).unwrap();
        assert_eq!(copy.name(), Some("filt_X1"));
        let text = to_text(&copy);
        assert!(text.starts_with(".SUBCKT filt_X1 a b\n"));
        assert!(text.ends_with(&format!("{}.ENDS filt_X1\n", SPECIALIZED_FOOTER)));
        assert_eq!(block.name(), Some("filt"));
    }

    #[test]
    fn test_components_and_nodes() {
        let node = parse(NETLIST);
        assert_eq!(node.get_components("*"), vec!["R1", "C1", "X1"]);
        assert_eq!(node.get_components("rc"), vec!["R1", "C1"]);
        assert_eq!(node.get_all_nodes().unwrap(), vec!["in", "out", "0"]);
    }

    #[test]
    fn test_all_nodes_fails_fast() {
        let node = parse("R1 a b\n.end\n");
        assert!(matches!(
            node.get_all_nodes(),
            Err(SpiceBatchError::UnrecognizedFormat { kind: 'R', .. })
        ));
    }

    #[test]
    fn test_control_section_is_opaque() {
        let text = "R1 in out 1k\n.control\nrun\nwrite out.raw v(out)\n.endc\n.end\n";
        let mut node = parse(text);
        assert_eq!(node.entries().len(), 3);
        assert_eq!(node.get_components("R"), vec!["R1"]);
        assert_eq!(node.get_all_nodes().unwrap(), vec!["in", "out"]);
        assert!(matches!(
            node.get_component_value("run"),
            Err(SpiceBatchError::ComponentNotFound(_))
        ));
        node.add_directive(".op", &[]).unwrap();
        assert!(to_text(&node).ends_with(".endc\n.op\n.end\n"));

        let mut lines = ".control\nrun\n.end\n".split_inclusive('\n');
        assert!(matches!(
            CircuitNode::parse_block(&mut lines),
            Err(SpiceBatchError::MalformedDocument(_))
        ));
    }

    #[test]
    fn test_resolve_nested_instance_in_block() {
        let node = parse(NETLIST);
        let ctx = ResolveContext {
            base_dir: None,
            search_paths: &[],
            divider: ':',
        };
        let found = node.resolve_nested_instance("X1", &[], &ctx).unwrap();
        assert_eq!(found.name(), Some("filt"));
        assert!(matches!(
            node.resolve_nested_instance("R1", &[], &ctx),
            Err(SpiceBatchError::ComponentNotFound(_))
        ));
    }
}
