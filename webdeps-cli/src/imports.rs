//! Dependency specifier extraction.
//!
//! Classifies walked nodes into the four dependency-bearing kinds and yields
//! the specifier each one references.

use std::fmt;

use crate::walker::{self, NodeKind, NodeRecord, ParseError, Span, Walk};

/// The syntactic form a dependency was referenced through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyKind {
    /// `import x from "spec"` or `import "spec"`.
    StaticImport,
    /// `export { x } from "spec"`.
    NamedExportFrom,
    /// `export * from "spec"`.
    ExportAllFrom,
    /// `import("spec")`.
    DynamicImport,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DependencyKind::StaticImport => "static-import",
            DependencyKind::NamedExportFrom => "named-export-from",
            DependencyKind::ExportAllFrom => "export-all-from",
            DependencyKind::DynamicImport => "dynamic-import",
        })
    }
}

/// A specifier referenced by one node of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyReference {
    pub specifier: String,
    /// Span of the whole dependency-bearing node.
    pub span: Span,
    /// Span of the specifier literal, quotes included.
    pub literal: Span,
    pub kind: DependencyKind,
}

/// Return the dependency `node` references, if it is one of the four
/// dependency-bearing kinds.
#[must_use]
pub fn extract(node: &NodeRecord) -> Option<DependencyReference> {
    let (literal, kind) = match &node.kind {
        NodeKind::ImportDeclaration {
            source,
            type_only: false,
        } => (source, DependencyKind::StaticImport),
        NodeKind::ExportNamedDeclaration {
            source: Some(source),
            ..
        } => (source, DependencyKind::NamedExportFrom),
        NodeKind::ExportAllDeclaration { source, .. } => (source, DependencyKind::ExportAllFrom),
        NodeKind::ImportCall {
            argument: Some(argument),
        } => (argument, DependencyKind::DynamicImport),
        _ => return None,
    };
    Some(DependencyReference {
        specifier: literal.value.clone(),
        span: node.span,
        literal: literal.span,
        kind,
    })
}

/// Every dependency reference of a walked module, in traversal order.
///
/// Duplicates are kept.
#[must_use]
pub fn dependencies(walk: &Walk) -> Vec<DependencyReference> {
    walk.iter().filter_map(|(node, _)| extract(node)).collect()
}

/// Parse `source_text` and list the specifiers it references.
///
/// # Errors
///
/// Returns [`ParseError`] when the text is not a valid module.
pub fn detect(source_text: &str) -> Result<Vec<String>, ParseError> {
    let walk = walker::walk(source_text)?;
    Ok(dependencies(&walk)
        .into_iter()
        .map(|dep| dep.specifier)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_the_four_kinds() {
        let text = "\
import a from './a.js';
import './side-effect.js';
export { b } from './b.js';
export * from './c.js';
const d = () => import('./d.js');
";
        let walk = walker::walk(text).unwrap();
        let deps = dependencies(&walk);
        let specs: Vec<_> = deps.iter().map(|d| d.specifier.as_str()).collect();
        assert_eq!(
            specs,
            ["./a.js", "./side-effect.js", "./b.js", "./c.js", "./d.js"]
        );
        let kinds: Vec<_> = deps.iter().map(|d| d.kind).collect();
        assert_eq!(
            kinds,
            [
                DependencyKind::StaticImport,
                DependencyKind::StaticImport,
                DependencyKind::NamedExportFrom,
                DependencyKind::ExportAllFrom,
                DependencyKind::DynamicImport,
            ]
        );
    }

    #[test]
    fn ignores_non_dependency_nodes() {
        let text = "\
const x = 1;
export const y = 2;
export { x };
export default function f() { return require('nope'); }
import(`./dynamic-${x}.js`);
";
        assert!(detect(text).unwrap().is_empty());
    }

    #[test]
    fn skips_type_only_imports() {
        let text = "\
import type { Options } from './types.js';
import { type Pad, pad } from './pad.js';
export default pad;
";
        assert_eq!(detect(text).unwrap(), ["./pad.js"]);
    }

    #[test]
    fn keeps_duplicates() {
        let text = "import a from 'dep';\nimport { b } from 'dep';\n";
        assert_eq!(detect(text).unwrap(), ["dep", "dep"]);
    }

    #[test]
    fn literal_span_points_at_quoted_specifier() {
        let text = "export * from \"lodash-es\";\n";
        let walk = walker::walk(text).unwrap();
        let dep = dependencies(&walk).pop().unwrap();
        assert_eq!(&text[dep.literal.start..dep.literal.end], "\"lodash-es\"");
        assert!(dep.span.contains(dep.literal));
    }

    #[test]
    fn detect_propagates_parse_errors() {
        assert!(detect("import from;").is_err());
    }

    #[test]
    fn kind_display() {
        assert_eq!(DependencyKind::ExportAllFrom.to_string(), "export-all-from");
    }
}
