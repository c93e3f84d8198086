pub mod buffers;
pub mod codespecs;
pub mod health;
pub mod runs;

use std::collections::HashMap;

/// Extracts `tag.<key>=<value>` query params the typed `Query` extractor
/// can't express directly (arbitrary key suffixes); shared by
/// `listBuffers`/`listRuns`/`runCounts`, all of which filter conjunctively
/// on tags (spec.md §4.A).
pub(crate) fn extract_tag_filters(raw_query: &str) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    for pair in raw_query.split('&') {
        let Some((k, v)) = pair.split_once('=') else { continue };
        let Some(key) = k.strip_prefix("tag.") else { continue };
        tags.insert(percent_decode(key), percent_decode(v));
    }
    tags
}

/// Minimal `application/x-www-form-urlencoded` decode: `+` as space, `%XX`
/// escapes. Query values here are always plain tag keys/values (spec.md §3
/// tag charset), so a full percent-decoding crate would be overkill.
fn percent_decode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '+' => out.push(' '),
            '%' => {
                let hex: String = chars.by_ref().take(2).collect();
                if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                    out.push(byte as char);
                }
            }
            other => out.push(other),
        }
    }
    out
}
