// Proposed-change application
//
// The tool is asked to reply with the complete revised artifact in a single
// fenced code block. Extraction takes the largest fenced block; a response
// with no fence is used verbatim. An unusable response is an apply failure,
// which the engine treats as a failed iteration rather than a tool failure.

use std::path::Path;

/// Extract the proposed artifact content from a tool response.
///
/// Returns `None` when the response contains nothing usable.
pub fn extract_proposal(response: &str) -> Option<String> {
    let mut blocks: Vec<String> = Vec::new();
    let mut current: Option<Vec<&str>> = None;

    for line in response.lines() {
        let fence = line.trim_start().starts_with("```");
        match (&mut current, fence) {
            (None, true) => current = Some(Vec::new()),
            (Some(lines), true) => {
                blocks.push(lines.join("\n"));
                current = None;
            }
            (Some(lines), false) => lines.push(line),
            (None, false) => {}
        }
    }

    if let Some(largest) = blocks.into_iter().max_by_key(String::len) {
        if !largest.trim().is_empty() {
            return Some(largest);
        }
    }

    // No fenced block: a non-empty response body is taken as the content.
    let body = response.trim();
    if body.is_empty() {
        None
    } else {
        Some(body.to_string())
    }
}

/// Write the proposal to the target path. Returns the applied content, or a
/// description of why the response could not be applied.
pub async fn apply_proposal(target: &Path, response: &str) -> Result<String, String> {
    let content = extract_proposal(response)
        .ok_or_else(|| "response contained no usable content".to_string())?;

    tokio::fs::write(target, &content)
        .await
        .map_err(|e| format!("could not write {}: {}", target.display(), e))?;

    Ok(content)
}
