//! Line classification and element field location.
//!
//! Every netlist line starts (after leading blanks) with one of:
//!
//! ```text
//! * ; #        comment (blank lines count as comments)
//! +            continuation of the previous line
//! .NAME ...    directive
//! Xname ...    element; the first letter selects the element grammar
//! ```
//!
//! Element grammars are a closed table keyed by prefix letter. Each entry
//! says how many node tokens the element takes, whether an optional model
//! token may sit between the nodes and the value, and what the value
//! looks like. [`parse_element`] resolves the spans of every field of one
//! logical line (continuations included) so callers can splice in new text
//! without touching anything else on the line.

use std::ops::Range;

use nom::Parser;

use crate::error::{Result, SpiceBatchError};
use crate::units::eng_value;

/// Byte range into a line.
pub type Span = Range<usize>;

// ---------------------------------------------------------------------------
// Element table
// ---------------------------------------------------------------------------

/// Element types, one per prefix letter.
///
/// Variant order matches `ELEMENT_TABLE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    CodeModel,
    Behavioral,
    Capacitor,
    Diode,
    Vcvs,
    Cccs,
    Vccs,
    Ccvs,
    CurrentSource,
    Jfet,
    Coupling,
    Inductor,
    Mosfet,
    LossyLine,
    Bjt,
    Resistor,
    VoltageSwitch,
    LosslessLine,
    RcLine,
    VoltageSource,
    CurrentSwitch,
    Subcircuit,
    Mesfet,
    FraWiggler,
}

/// Shape of the editable value field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueGrammar {
    /// Everything after the nodes, up to the end of the line.
    Rest,
    /// A single word token, normally a model name.
    Word,
    /// Engineering number or `{expression}`, optionally preceded by a model token.
    Numeric { assign_prefix: Option<&'static str> },
    /// Signed coupling coefficient.
    Coupling,
    /// Sub-circuit name followed by optional `params:` assignments.
    Subcircuit,
    /// No value; everything after the nodes is parameters.
    OptionalRest,
    /// Prefix is recognized but its fields cannot be edited.
    Unsupported,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ElementLayout {
    pub kind: ElementKind,
    pub prefix: char,
    pub min_nodes: usize,
    pub max_nodes: usize,
    pub value: ValueGrammar,
}

const fn layout(
    kind: ElementKind,
    prefix: char,
    min_nodes: usize,
    max_nodes: usize,
    value: ValueGrammar,
) -> ElementLayout {
    ElementLayout { kind, prefix, min_nodes, max_nodes, value }
}

use ElementKind as K;
use ValueGrammar as G;

static ELEMENT_TABLE: [ElementLayout; 24] = [
    layout(K::CodeModel, 'A', 0, 0, G::Unsupported),
    layout(K::Behavioral, 'B', 2, 2, G::Rest),
    layout(K::Capacitor, 'C', 2, 2, G::Numeric { assign_prefix: None }),
    layout(K::Diode, 'D', 2, 2, G::Word),
    layout(K::Vcvs, 'E', 2, 4, G::Rest),
    layout(K::Cccs, 'F', 2, 2, G::Rest),
    layout(K::Vccs, 'G', 2, 4, G::Rest),
    layout(K::Ccvs, 'H', 2, 2, G::Rest),
    layout(K::CurrentSource, 'I', 2, 2, G::Rest),
    layout(K::Jfet, 'J', 3, 3, G::Word),
    layout(K::Coupling, 'K', 2, 4, G::Coupling),
    layout(K::Inductor, 'L', 2, 2, G::Numeric { assign_prefix: None }),
    layout(K::Mosfet, 'M', 3, 4, G::Word),
    layout(K::LossyLine, 'O', 4, 4, G::Word),
    layout(K::Bjt, 'Q', 3, 4, G::Word),
    layout(K::Resistor, 'R', 2, 2, G::Numeric { assign_prefix: Some("R=") }),
    layout(K::VoltageSwitch, 'S', 4, 4, G::Rest),
    layout(K::LosslessLine, 'T', 4, 4, G::Rest),
    layout(K::RcLine, 'U', 3, 3, G::Rest),
    layout(K::VoltageSource, 'V', 2, 2, G::Rest),
    layout(K::CurrentSwitch, 'W', 2, 2, G::Rest),
    layout(K::Subcircuit, 'X', 1, usize::MAX, G::Subcircuit),
    layout(K::Mesfet, 'Z', 3, 3, G::Word),
    layout(K::FraWiggler, '@', 2, 2, G::OptionalRest),
];

impl ElementKind {
    /// Look up the element kind for a prefix letter (case-insensitive).
    pub fn from_prefix(prefix: char) -> Option<Self> {
        let upper = prefix.to_ascii_uppercase();
        ELEMENT_TABLE.iter().find(|l| l.prefix == upper).map(|l| l.kind)
    }

    /// All prefix letters with a known grammar.
    pub fn all_prefixes() -> impl Iterator<Item = char> {
        ELEMENT_TABLE.iter().map(|l| l.prefix)
    }

    pub fn prefix(self) -> char {
        self.layout().prefix
    }

    pub(crate) fn layout(self) -> &'static ElementLayout {
        &ELEMENT_TABLE[self as usize]
    }

    /// True when the value token is the element's model name.
    pub fn value_is_model(self) -> bool {
        self.layout().value == ValueGrammar::Word
    }
}

// ---------------------------------------------------------------------------
// Line classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    Element(ElementKind),
    Continuation,
    Comment,
    /// Directive keyword, upper-cased, dot included (`.PARAM`).
    Directive(String),
}

/// Classify one line by its first non-blank character.
///
/// Fails with [`SpiceBatchError::UnsupportedElementType`] when that
/// character starts no known construct.
pub fn classify(line: &str) -> Result<LineKind> {
    let trimmed = line.trim_start_matches([' ', '\t']);
    let Some(first) = trimmed.chars().next() else {
        return Ok(LineKind::Comment);
    };
    match first {
        '*' | '#' | ';' | '\n' | '\r' => Ok(LineKind::Comment),
        '+' => Ok(LineKind::Continuation),
        '.' => Ok(LineKind::Directive(first_token_upper(trimmed))),
        c => ElementKind::from_prefix(c)
            .map(LineKind::Element)
            .ok_or(SpiceBatchError::UnsupportedElementType(c)),
    }
}

/// First whitespace-delimited token of a line, upper-cased.
pub fn first_token_upper(line: &str) -> String {
    line.split_whitespace()
        .next()
        .map(str::to_uppercase)
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

/// Split a logical line into token spans.
///
/// Bracketed groups (`{}` and `()`) stay in one token even when they
/// contain blanks. A `+` opening a physical line is a continuation marker,
/// not a token. Inline comments (`;` or `$` at token start) run to the end
/// of their physical line.
fn tokenize(line: &str) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut chars = line.char_indices().peekable();
    let mut at_line_start = false;

    while let Some(&(i, c)) = chars.peek() {
        if c == '\n' {
            at_line_start = true;
            chars.next();
            continue;
        }
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '+' && at_line_start {
            at_line_start = false;
            chars.next();
            continue;
        }
        at_line_start = false;
        if c == ';' || c == '$' {
            while let Some(&(_, c)) = chars.peek() {
                if c == '\n' {
                    break;
                }
                chars.next();
            }
            continue;
        }

        let start = i;
        let mut end = i;
        let mut depth = 0usize;
        while let Some(&(j, c)) = chars.peek() {
            if c.is_whitespace() && depth == 0 {
                break;
            }
            match c {
                '{' | '(' => depth += 1,
                '}' | ')' => depth = depth.saturating_sub(1),
                _ => {}
            }
            end = j + c.len_utf8();
            chars.next();
        }
        spans.push(start..end);
    }
    spans
}

/// `name=value` pairs on a directive line such as `.PARAM a=1 b = {x*2}`.
///
/// Returns `(name, value)` spans in line order, skipping the directive
/// keyword itself.
pub(crate) fn assignments(line: &str) -> Vec<(Span, Span)> {
    let tokens = tokenize(line);
    let mut pairs = Vec::new();
    let mut i = 1;
    while i < tokens.len() {
        let span = tokens[i].clone();
        let token = &line[span.clone()];
        let Some(eq) = token.find('=') else {
            i += 1;
            continue;
        };
        let name = if eq == 0 {
            match i.checked_sub(1).filter(|&p| p >= 1) {
                Some(p) => tokens[p].clone(),
                None => {
                    i += 1;
                    continue;
                }
            }
        } else {
            span.start..span.start + eq
        };
        let value = if eq + 1 < token.len() {
            span.start + eq + 1..span.end
        } else {
            match tokens.get(i + 1) {
                Some(next) => {
                    i += 1;
                    next.clone()
                }
                None => span.end..span.end,
            }
        };
        pairs.push((name, value));
        i += 1;
    }
    pairs
}

fn is_word(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| c.is_alphanumeric() || c == '_')
}

fn is_expression(token: &str) -> bool {
    token.starts_with('{') && token.ends_with('}')
}

/// Engineering number with optional unit letters (`10k`, `4k7`, `100nF`).
fn is_numeric(token: &str) -> bool {
    let Some(first) = token.chars().next() else {
        return false;
    };
    if !(first.is_ascii_digit() || matches!(first, '.' | '+' | '-')) {
        return false;
    }
    match eng_value.parse(token) {
        Ok((rest, _)) => rest.chars().all(char::is_alphanumeric),
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Element fields
// ---------------------------------------------------------------------------

/// Field of an element line that can be located and edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Designator,
    Nodes,
    Model,
    Value,
    Params,
}

/// Spans of every field found on one element line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementFields {
    pub kind: ElementKind,
    pub designator: Span,
    pub nodes: Vec<Span>,
    pub model: Option<Span>,
    pub value: Option<Span>,
    pub params: Option<Span>,
}

impl ElementFields {
    /// Span of one field, if the line carries it.
    pub fn span(&self, field: Field) -> Option<Span> {
        match field {
            Field::Designator => Some(self.designator.clone()),
            Field::Nodes => match (self.nodes.first(), self.nodes.last()) {
                (Some(first), Some(last)) => Some(first.start..last.end),
                _ => None,
            },
            Field::Model => self.model.clone(),
            Field::Value => self.value.clone(),
            Field::Params => self.params.clone(),
        }
    }

    pub fn node_names<'a>(&self, line: &'a str) -> Vec<&'a str> {
        self.nodes.iter().map(|s| &line[s.clone()]).collect()
    }
}

fn unrecognized(kind: ElementKind, line: &str) -> SpiceBatchError {
    SpiceBatchError::UnrecognizedFormat {
        kind: kind.prefix(),
        line: line.trim_end().to_string(),
    }
}

/// Determine the element kind of a line.
pub fn element_kind(line: &str) -> Result<ElementKind> {
    match classify(line)? {
        LineKind::Element(kind) => Ok(kind),
        _ => {
            let first = line.trim_start().chars().next().unwrap_or(' ');
            Err(SpiceBatchError::UnsupportedElementType(first))
        }
    }
}

/// Locate every field on an element line.
pub fn parse_element(line: &str) -> Result<ElementFields> {
    let kind = element_kind(line)?;
    let layout = kind.layout();
    if layout.value == ValueGrammar::Unsupported {
        return Err(SpiceBatchError::UnsupportedElementType(layout.prefix));
    }

    let tokens = tokenize(line);
    let Some(designator) = tokens.first().cloned() else {
        return Err(unrecognized(kind, line));
    };
    if layout.value == ValueGrammar::OptionalRest {
        let number = line[designator.clone()].trim_start_matches('@');
        if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
            return Err(unrecognized(kind, line));
        }
    }

    let text = |i: usize| &line[tokens[i].clone()];
    let rest_span = |from: usize| -> Option<Span> {
        match (tokens.get(from), tokens.last()) {
            (Some(first), Some(last)) => Some(first.start..last.end),
            _ => None,
        }
    };
    let fields = |nodes: usize, model, value, params| ElementFields {
        kind,
        designator: designator.clone(),
        nodes: tokens[1..=nodes].to_vec(),
        model,
        value,
        params,
    };
    // Largest node count that still leaves `after` tokens behind the nodes.
    let max_nodes_with = |after: usize| -> Option<usize> {
        let available = tokens.len().checked_sub(1 + after)?;
        let n = available.min(layout.max_nodes);
        (n >= layout.min_nodes).then_some(n)
    };

    match layout.value {
        ValueGrammar::Rest => {
            let n = max_nodes_with(1).ok_or_else(|| unrecognized(kind, line))?;
            Ok(fields(n, None, rest_span(n + 1), None))
        }
        ValueGrammar::Word => {
            let top = max_nodes_with(1).ok_or_else(|| unrecognized(kind, line))?;
            (layout.min_nodes..=top)
                .rev()
                .find(|&n| is_word(text(n + 1)))
                .map(|n| {
                    let value = Some(tokens[n + 1].clone());
                    fields(n, value.clone(), value, rest_span(n + 2))
                })
                .ok_or_else(|| unrecognized(kind, line))
        }
        ValueGrammar::Coupling => {
            let top = max_nodes_with(1).ok_or_else(|| unrecognized(kind, line))?;
            (layout.min_nodes..=top)
                .rev()
                .find(|&n| {
                    let t = text(n + 1);
                    is_expression(t) || is_numeric(t)
                })
                .map(|n| fields(n, None, Some(tokens[n + 1].clone()), rest_span(n + 2)))
                .ok_or_else(|| unrecognized(kind, line))
        }
        ValueGrammar::Numeric { assign_prefix } => {
            let n = layout.min_nodes;
            let value_at = |i: usize| -> Option<Span> {
                let span = tokens.get(i)?.clone();
                let mut t = &line[span.clone()];
                let mut start = span.start;
                if let Some(prefix) = assign_prefix {
                    if t.len() > prefix.len()
                        && t.is_char_boundary(prefix.len())
                        && t[..prefix.len()].eq_ignore_ascii_case(prefix)
                    {
                        t = &t[prefix.len()..];
                        start += prefix.len();
                    }
                }
                (is_expression(t) || is_numeric(t)).then_some(start..span.end)
            };
            if tokens.len() < n + 2 {
                return Err(unrecognized(kind, line));
            }
            if let Some(value) = value_at(n + 1) {
                return Ok(fields(n, None, Some(value), rest_span(n + 2)));
            }
            if is_word(text(n + 1)) {
                if let Some(value) = value_at(n + 2) {
                    let model = Some(tokens[n + 1].clone());
                    return Ok(fields(n, model, Some(value), rest_span(n + 3)));
                }
            }
            Err(unrecognized(kind, line))
        }
        ValueGrammar::Subcircuit => {
            let stop = tokens
                .iter()
                .skip(1)
                .position(|s| {
                    let t = &line[s.clone()];
                    t.eq_ignore_ascii_case("params:") || t.contains('=')
                })
                .map(|p| p + 1);
            let name_index = match stop {
                Some(i) if text(i).starts_with('=') => i.checked_sub(2),
                Some(i) if text(i).eq_ignore_ascii_case("params:") => i.checked_sub(1),
                // `k=v` as one token
                Some(i) => i.checked_sub(1),
                None => tokens.len().checked_sub(1),
            };
            match name_index {
                Some(i) if i >= 2 && is_word(text(i)) => {
                    let value = Some(tokens[i].clone());
                    Ok(fields(i - 1, None, value, rest_span(i + 1)))
                }
                _ => Err(unrecognized(kind, line)),
            }
        }
        ValueGrammar::OptionalRest => {
            if tokens.len() < 3 {
                return Err(unrecognized(kind, line));
            }
            Ok(fields(2, None, None, rest_span(3)))
        }
        ValueGrammar::Unsupported => Err(SpiceBatchError::UnsupportedElementType(layout.prefix)),
    }
}

/// Locate one field on an element line.
///
/// Fails with `UnrecognizedFormat` when the line does not fit its element
/// grammar or does not carry the requested field.
pub fn locate(line: &str, field: Field) -> Result<Span> {
    let fields = parse_element(line)?;
    fields
        .span(field)
        .ok_or_else(|| unrecognized(fields.kind, line))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_of(line: &str) -> &str {
        let span = locate(line, Field::Value).expect("locate failed");
        &line[span]
    }

    #[test]
    fn test_classify_lines() {
        assert_eq!(classify("* comment\n").unwrap(), LineKind::Comment);
        assert_eq!(classify("\n").unwrap(), LineKind::Comment);
        assert_eq!(classify("  + 1k\n").unwrap(), LineKind::Continuation);
        assert_eq!(
            classify(".tran 1m\n").unwrap(),
            LineKind::Directive(".TRAN".to_string())
        );
        assert_eq!(
            classify("r1 a b 1k").unwrap(),
            LineKind::Element(ElementKind::Resistor)
        );
        assert!(matches!(
            classify("!bogus"),
            Err(SpiceBatchError::UnsupportedElementType('!'))
        ));
    }

    #[test]
    fn test_resistor_value() {
        assert_eq!(value_of("R1 in out 2k\n"), "2k");
        assert_eq!(value_of("R1 in out 4k7 tc=0.001\n"), "4k7");
        assert_eq!(value_of("R2 a b {rval*2}\n"), "{rval*2}");
        assert_eq!(value_of("R3 a b R=10Meg\n"), "10Meg");
    }

    #[test]
    fn test_resistor_with_model() {
        let line = "R1 a b rmod 1k\n";
        let fields = parse_element(line).unwrap();
        assert_eq!(&line[fields.model.clone().unwrap()], "rmod");
        assert_eq!(&line[fields.value.clone().unwrap()], "1k");
    }

    #[test]
    fn test_expression_takes_precedence() {
        assert_eq!(value_of("C1 a b cmod {c0 * (1 + x)}\n"), "{c0 * (1 + x)}");
        assert_eq!(value_of("L1 a b 10uH\n"), "10uH");
    }

    #[test]
    fn test_resistor_without_value_is_unrecognized() {
        let err = locate("R1 a b\n", Field::Value).unwrap_err();
        assert!(matches!(err, SpiceBatchError::UnrecognizedFormat { kind: 'R', .. }));
        let err = locate("R1 a b rmod\n", Field::Value).unwrap_err();
        assert!(matches!(err, SpiceBatchError::UnrecognizedFormat { .. }));
    }

    #[test]
    fn test_source_value_is_rest_of_line() {
        assert_eq!(value_of("V1 in 0 SIN(0 1 1k)\r\n"), "SIN(0 1 1k)");
        assert_eq!(value_of("I1 0 n1 DC 1m AC 1\n"), "DC 1m AC 1");
    }

    #[test]
    fn test_semiconductor_model_node_counts() {
        let line = "M1 d g s b nmos W=1u L=180n\n";
        let fields = parse_element(line).unwrap();
        assert_eq!(fields.node_names(line), vec!["d", "g", "s", "b"]);
        assert_eq!(&line[fields.value.clone().unwrap()], "nmos");

        let line = "Q1 c b e 2N2222\n";
        let fields = parse_element(line).unwrap();
        assert_eq!(fields.node_names(line), vec!["c", "b", "e"]);
        assert_eq!(&line[fields.model.clone().unwrap()], "2N2222");
    }

    #[test]
    fn test_controlled_source_node_range() {
        let line = "E1 out 0 in 0 10\n";
        let fields = parse_element(line).unwrap();
        assert_eq!(fields.nodes.len(), 4);
        assert_eq!(value_of(line), "10");
    }

    #[test]
    fn test_coupling_coefficient() {
        assert_eq!(value_of("K1 L1 L2 0.99\n"), "0.99");
        assert_eq!(value_of("K2 L1 L2 -1\n"), "-1");
    }

    #[test]
    fn test_subcircuit_instance() {
        let line = "X1 in out 0 opamp\n";
        let fields = parse_element(line).unwrap();
        assert_eq!(fields.node_names(line), vec!["in", "out", "0"]);
        assert_eq!(&line[fields.value.clone().unwrap()], "opamp");
        assert!(fields.params.is_none());

        let line = "X2 a b filt params: fc=1k q = {qq}\n";
        let fields = parse_element(line).unwrap();
        assert_eq!(fields.node_names(line), vec!["a", "b"]);
        assert_eq!(&line[fields.value.clone().unwrap()], "filt");
        assert_eq!(&line[fields.params.clone().unwrap()], "params: fc=1k q = {qq}");

        let line = "X3 a b filt fc=2k\n";
        assert_eq!(value_of(line), "filt");
    }

    #[test]
    fn test_continuation_lines_are_joined() {
        let line = "R1 a b\n+ 3.3k\n";
        assert_eq!(value_of(line), "3.3k");
        let line = "V1 a 0 PULSE(0 5\n+ 1n 1n 1n 1u 2u)\n";
        assert_eq!(value_of(line), "PULSE(0 5\n+ 1n 1n 1n 1u 2u)");
    }

    #[test]
    fn test_inline_comment_ignored() {
        assert_eq!(value_of("R1 a b 1k ; load\n"), "1k");
    }

    #[test]
    fn test_param_assignments() {
        let line = ".param a=1 b = {x*2} c= 3k\n";
        let pairs: Vec<(&str, &str)> = assignments(line)
            .into_iter()
            .map(|(n, v)| (&line[n], &line[v]))
            .collect();
        assert_eq!(pairs, vec![("a", "1"), ("b", "{x*2}"), ("c", "3k")]);
    }

    #[test]
    fn test_unsupported_code_model() {
        assert!(matches!(
            locate("A1 in out amod\n", Field::Value),
            Err(SpiceBatchError::UnsupportedElementType('A'))
        ));
    }

    #[test]
    fn test_wiggler_params() {
        let line = "@1 in out delay=1m fstart=10\n";
        let fields = parse_element(line).unwrap();
        assert_eq!(fields.node_names(line), vec!["in", "out"]);
        assert!(fields.value.is_none());
        assert_eq!(&line[fields.params.clone().unwrap()], "delay=1m fstart=10");
    }
}
