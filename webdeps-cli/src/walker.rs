//! ECMAScript module parsing and postorder traversal.
//!
//! [`ModuleSource::parse`] parses module text with `swc` and flattens the
//! syntax tree into a postorder arena of [`NodeRecord`]s. Traversal is driven
//! by the generated `swc_ecma_visit` walkers, so every field of every node is
//! descended into without per-node-type traversal code; only the handful of
//! node kinds the import extractor cares about are summarised.

use std::fmt;

use swc_common::{sync::Lrc, BytePos, FileName, SourceMap, Spanned};
use swc_ecma_ast::{Callee, EsVersion, Expr, Lit, Module, ModuleDecl, Stmt, Str};
use swc_ecma_parser::{lexer::Lexer, Parser, StringInput, Syntax};
use swc_ecma_visit::{Visit, VisitWith};

/// Module source text failed to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// Human-readable description of the syntax error.
    pub message: String,
    /// 1-based line of the error.
    pub line: usize,
    /// 1-based column of the error.
    pub column: usize,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "syntax error at {}:{}: {}",
            self.line, self.column, self.message
        )
    }
}

impl std::error::Error for ParseError {}

/// Half-open byte range `[start, end)` into the owning module's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether `inner` lies entirely within this span.
    #[must_use]
    pub fn contains(&self, inner: Span) -> bool {
        self.start <= inner.start && inner.end <= self.end
    }
}

/// A string literal operand: its cooked value and the span of the literal
/// including its quotes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Literal {
    pub value: String,
    pub span: Span,
}

/// Summary of one syntax node, keeping only what import extraction needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Module,
    Statement,
    Expression,
    /// `import ... from "x"` / `import "x"`.
    ImportDeclaration { source: Literal, type_only: bool },
    /// `export { a } from "x"` or a local `export { a }` (no source).
    ExportNamedDeclaration {
        source: Option<Literal>,
        type_only: bool,
    },
    /// `export * from "x"`.
    ExportAllDeclaration { source: Literal, type_only: bool },
    /// Any other module declaration (`export default`, `export const`, ...).
    ModuleDeclaration,
    /// `import(...)`; `argument` is set when the first argument is a string
    /// literal.
    ImportCall { argument: Option<Literal> },
}

/// One node of the flattened tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub kind: NodeKind,
    pub span: Span,
    /// Index of the enclosing recorded node, `None` for the module root.
    pub parent: Option<usize>,
}

/// The postorder node sequence of one module.
///
/// Children always precede their parent. The sequence is finite and can be
/// iterated any number of times.
#[derive(Debug, Clone, Default)]
pub struct Walk {
    nodes: Vec<NodeRecord>,
}

impl Walk {
    /// Iterate `(node, parent)` pairs in postorder.
    pub fn iter(&self) -> impl Iterator<Item = (&NodeRecord, Option<&NodeRecord>)> + '_ {
        self.nodes
            .iter()
            .map(|node| (node, node.parent.map(|idx| &self.nodes[idx])))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// An immutable module text buffer together with its flattened syntax tree.
#[derive(Debug, Clone)]
pub struct ModuleSource {
    text: String,
    walk: Walk,
}

impl ModuleSource {
    /// Parse `text` as an ECMAScript module. The TypeScript grammar is a
    /// superset of it and lets `import type` declarations be recognized.
    ///
    /// `name` only labels the source for diagnostics. A leading byte order
    /// mark is skipped by the parser but still counted in spans, so spans
    /// always index into `text`.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] when the text is not a syntactically valid
    /// module, including errors the parser recovered from.
    pub fn parse(name: &str, text: impl Into<String>) -> Result<Self, ParseError> {
        let text = text.into();
        let body = text.strip_prefix(BOM).unwrap_or(text.as_str());
        let shift = text.len() - body.len();
        let cm: Lrc<SourceMap> = Lrc::default();
        let fm = cm.new_source_file(FileName::Custom(name.to_string()).into(), body.to_string());

        let lexer = Lexer::new(
            Syntax::Typescript(Default::default()),
            EsVersion::Es2022,
            StringInput::from(&*fm),
            None,
        );
        let mut parser = Parser::new_from(lexer);
        let parsed = parser.parse_module();
        let recovered = parser.take_errors().into_iter().next();

        let module = match (parsed, recovered) {
            (Ok(module), None) => module,
            (Ok(_), Some(err)) | (Err(err), _) => {
                let loc = cm.lookup_char_pos(err.span().lo);
                return Err(ParseError {
                    message: err.kind().msg().into_owned(),
                    line: loc.line,
                    column: loc.col.0 + 1,
                });
            }
        };

        let mut flattener = Flattener {
            origin: fm.start_pos,
            shift,
            nodes: Vec::new(),
            pending: Vec::new(),
        };
        module.visit_with(&mut flattener);

        Ok(Self {
            text,
            walk: Walk {
                nodes: flattener.nodes,
            },
        })
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The postorder `(node, parent)` sequence of this module.
    #[must_use]
    pub fn walk(&self) -> &Walk {
        &self.walk
    }
}

/// Parse `source_text` and return its postorder node sequence.
///
/// # Errors
///
/// Returns [`ParseError`] when the text is not a valid module.
pub fn walk(source_text: &str) -> Result<Walk, ParseError> {
    ModuleSource::parse("<module>", source_text).map(|module| module.walk)
}

const BOM: char = '\u{feff}';

/// Visitor that records tracked nodes after their children.
struct Flattener {
    origin: BytePos,
    /// Bytes of `text` before the parsed body.
    shift: usize,
    nodes: Vec<NodeRecord>,
    /// One frame per open tracked node: indices of its already-recorded
    /// children awaiting a parent index.
    pending: Vec<Vec<usize>>,
}

impl Flattener {
    fn span(&self, span: swc_common::Span) -> Span {
        Span {
            start: span.lo.0.saturating_sub(self.origin.0) as usize + self.shift,
            end: span.hi.0.saturating_sub(self.origin.0) as usize + self.shift,
        }
    }

    fn literal(&self, s: &Str) -> Literal {
        Literal {
            value: s.value.to_string(),
            span: self.span(s.span),
        }
    }

    fn track(&mut self, kind: NodeKind, span: Span, visit_children: impl FnOnce(&mut Self)) {
        self.pending.push(Vec::new());
        visit_children(self);
        let children = self.pending.pop().unwrap_or_default();

        let idx = self.nodes.len();
        for child in children {
            self.nodes[child].parent = Some(idx);
        }
        self.nodes.push(NodeRecord {
            kind,
            span,
            parent: None,
        });
        if let Some(frame) = self.pending.last_mut() {
            frame.push(idx);
        }
    }

    fn classify_decl(&self, decl: &ModuleDecl) -> NodeKind {
        match decl {
            ModuleDecl::Import(import) => NodeKind::ImportDeclaration {
                source: self.literal(&import.src),
                type_only: import.type_only,
            },
            ModuleDecl::ExportNamed(named) => NodeKind::ExportNamedDeclaration {
                source: named.src.as_deref().map(|src| self.literal(src)),
                type_only: named.type_only,
            },
            ModuleDecl::ExportAll(all) => NodeKind::ExportAllDeclaration {
                source: self.literal(&all.src),
                type_only: all.type_only,
            },
            _ => NodeKind::ModuleDeclaration,
        }
    }

    fn classify_expr(&self, expr: &Expr) -> NodeKind {
        let Expr::Call(call) = expr else {
            return NodeKind::Expression;
        };
        if !matches!(call.callee, Callee::Import(_)) {
            return NodeKind::Expression;
        }
        let argument = call.args.first().and_then(|arg| match (&arg.spread, &*arg.expr) {
            (None, Expr::Lit(Lit::Str(s))) => Some(self.literal(s)),
            _ => None,
        });
        NodeKind::ImportCall { argument }
    }
}

impl Visit for Flattener {
    fn visit_module(&mut self, n: &Module) {
        let span = self.span(n.span);
        self.track(NodeKind::Module, span, |this| n.visit_children_with(this));
    }

    fn visit_module_decl(&mut self, n: &ModuleDecl) {
        let kind = self.classify_decl(n);
        let span = self.span(n.span());
        self.track(kind, span, |this| n.visit_children_with(this));
    }

    fn visit_stmt(&mut self, n: &Stmt) {
        let span = self.span(n.span());
        self.track(NodeKind::Statement, span, |this| n.visit_children_with(this));
    }

    fn visit_expr(&mut self, n: &Expr) {
        let kind = self.classify_expr(n);
        let span = self.span(n.span());
        self.track(kind, span, |this| n.visit_children_with(this));
    }
}
