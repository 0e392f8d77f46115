//! Query reformulation: strip engine directives before a query reaches a provider.

/// Reserved directive keywords. A directive is one of these, directly followed by `:`,
/// at the start of the query or right after whitespace.
const DIRECTIVE_MARKERS: [&str; 3] = ["site:", "engine:", "provider:"];

fn first_directive_offset(query: &str) -> Option<usize> {
    let lower = query.to_ascii_lowercase();
    DIRECTIVE_MARKERS
        .iter()
        .flat_map(|m| lower.match_indices(m).map(|(i, _)| i))
        .filter(|&i| {
            i == 0
                || lower[..i]
                    .chars()
                    .next_back()
                    .is_some_and(|c| c.is_whitespace())
        })
        .min()
}

/// Truncate `query` at its first directive and trim.
///
/// Total: a query without directives is returned unchanged, and a truncation that would
/// leave nothing falls back to the original text.
pub fn reformulate_query(query: &str) -> String {
    let Some(at) = first_directive_offset(query) else {
        return query.to_string();
    };
    let head = query[..at].trim();
    if head.is_empty() {
        query.to_string()
    } else {
        head.to_string()
    }
}
