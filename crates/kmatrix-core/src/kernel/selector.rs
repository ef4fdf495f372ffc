//! Narrowing a resolved catalog to the targets of one request.

use regex::Regex;
use tracing::debug;

use super::{KernelCatalog, KernelDescriptor};
use crate::error::{KmatrixError, Result};

/// Select usable kernels in catalog order, truncated to `max`.
///
/// With `guess_all` or an empty `pattern` every usable entry qualifies;
/// otherwise `pattern` is a regular expression matched against
/// [`KernelDescriptor::describe`].
pub fn select(
    catalog: &KernelCatalog,
    pattern: &str,
    guess_all: bool,
    max: usize,
) -> Result<Vec<KernelDescriptor>> {
    let selection_error = |reason: String| KmatrixError::Selection {
        pattern: pattern.to_string(),
        reason,
    };

    if max == 0 {
        return Err(selection_error("max must be at least 1".to_string()));
    }

    let matcher = if guess_all || pattern.is_empty() {
        None
    } else {
        Some(Regex::new(pattern).map_err(|e| selection_error(e.to_string()))?)
    };

    let selected: Vec<KernelDescriptor> = catalog
        .usable()
        .filter(|k| matcher.as_ref().map_or(true, |re| re.is_match(&k.describe())))
        .take(max)
        .cloned()
        .collect();

    if selected.is_empty() {
        return Err(selection_error("no usable kernel matches".to_string()));
    }

    debug!(pattern, guess_all, max, selected = selected.len(), "kernels selected");
    Ok(selected)
}
