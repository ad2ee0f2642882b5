//! Completion helpers built on the package and member queries

use crate::proxy::WorkerProxy;
use symdex_core::Result;

/// Complete one more segment of a dotted module path.
///
/// For `prefix` "os.pa" this asks for packages starting with "os.pa" and
/// answers the segment at the prefix's depth, e.g. "path".
pub fn module_completions(proxy: &mut WorkerProxy, prefix: &str) -> Result<Vec<String>> {
    let packages = proxy.query_packages(prefix)?;
    Ok(segments_at_depth(&packages, prefix))
}

/// Distinct, sorted segments of `packages` at the depth of `prefix`
pub fn segments_at_depth(packages: &[String], prefix: &str) -> Vec<String> {
    let depth = prefix.matches('.').count();
    let mut segments: Vec<String> = packages
        .iter()
        .filter_map(|package| package.split('.').nth(depth))
        .map(str::to_string)
        .collect();
    segments.sort();
    segments.dedup();
    segments
}
