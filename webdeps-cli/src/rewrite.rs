//! Byte-exact specifier substitution.
//!
//! All spans are computed against the original text before any replacement
//! is applied. The output is assembled from untouched slices of the original
//! interleaved with the replacement literals, so offsets never drift.

use std::fmt;
use std::future::Future;

use futures::future::try_join_all;

use crate::imports::{self, DependencyReference};
use crate::walker::{ParseError, Span, Walk};

/// Error returned by [`rewrite`].
#[derive(Debug)]
pub enum RewriteError<E> {
    /// The module text does not parse.
    Parse(ParseError),
    /// Two dependency-bearing nodes overlap.
    Overlap { first: Span, second: Span },
    /// The name resolver failed for `specifier`.
    Resolve { specifier: String, source: E },
}

impl<E: fmt::Display> fmt::Display for RewriteError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewriteError::Parse(e) => write!(f, "cannot rewrite module: {e}"),
            RewriteError::Overlap { first, second } => write!(
                f,
                "dependency nodes overlap at {}..{} and {}..{}",
                first.start, first.end, second.start, second.end
            ),
            RewriteError::Resolve { specifier, source } => {
                write!(f, "cannot resolve `{specifier}`: {source}")
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RewriteError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RewriteError::Parse(e) => Some(e),
            RewriteError::Overlap { .. } => None,
            RewriteError::Resolve { source, .. } => Some(source),
        }
    }
}

impl<E> From<ParseError> for RewriteError<E> {
    fn from(e: ParseError) -> Self {
        RewriteError::Parse(e)
    }
}

/// Replace every dependency specifier in `source_text` with the name
/// `resolve_name` returns for it.
///
/// Names are resolved concurrently. Only the inside of each specifier
/// literal changes; the quote character is kept and the replacement is
/// escaped for it.
///
/// # Errors
///
/// Fails if the text does not parse, if dependency nodes overlap, or on the
/// first resolver failure.
pub async fn rewrite<F, Fut, E>(source_text: &str, resolve_name: F) -> Result<String, RewriteError<E>>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<String, E>>,
{
    let walk = crate::walker::walk(source_text)?;
    rewrite_walked(source_text, &walk, resolve_name).await
}

/// [`rewrite`] over an already walked module.
///
/// # Errors
///
/// See [`rewrite`].
pub async fn rewrite_walked<F, Fut, E>(
    source_text: &str,
    walk: &Walk,
    resolve_name: F,
) -> Result<String, RewriteError<E>>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<String, E>>,
{
    let mut deps = imports::dependencies(walk);
    deps.sort_by_key(|dep| dep.span.start);
    check_disjoint(&deps)?;

    let names = try_join_all(deps.iter().map(|dep| {
        let specifier = dep.specifier.clone();
        let fut = resolve_name(specifier.clone());
        async move {
            fut.await
                .map_err(|source| RewriteError::Resolve { specifier, source })
        }
    }))
    .await?;

    let mut out = String::with_capacity(source_text.len());
    let mut cursor = 0;
    for (dep, name) in deps.iter().zip(names) {
        let Span { start, end } = dep.literal;
        let quote = source_text[start..].chars().next().unwrap_or('"');
        out.push_str(&source_text[cursor..start]);
        out.push(quote);
        push_escaped(&mut out, &name, quote);
        out.push(quote);
        cursor = end;
    }
    out.push_str(&source_text[cursor..]);
    Ok(out)
}

fn check_disjoint<E>(sorted: &[DependencyReference]) -> Result<(), RewriteError<E>> {
    for pair in sorted.windows(2) {
        let (first, second) = (pair[0].span, pair[1].span);
        if second.start < first.end {
            return Err(RewriteError::Overlap { first, second });
        }
    }
    Ok(())
}

fn push_escaped(out: &mut String, name: &str, quote: char) {
    for c in name.chars() {
        if c == quote || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
}
