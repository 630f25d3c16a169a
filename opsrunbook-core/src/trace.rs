//! Stack trace frame extraction.
//!
//! Pulls application frames out of free text (Python tracebacks, Node.js
//! stacks, or bare `path.ext:line` mentions), strips runtime prefixes so the
//! paths line up with repository paths, and drops library frames.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;

pub const MAX_APP_FRAMES: usize = 5;

const STRIP_PREFIXES: &[&str] = &["/var/task/", "/usr/src/app/", "/app/", "/opt/python/", "/opt/"];

const NOISE_MARKERS: &[&str] = &[
    "site-packages/",
    "node_modules/",
    ".venv/",
    "dist-packages/",
    "<frozen ",
    "<string>",
    "<module>",
    "importlib",
    "_bootstrap",
    "__pycache__",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceFrame {
    pub raw_path: String,
    pub normalized_path: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
    #[serde(default)]
    pub function: String,
}

struct Patterns {
    python: Regex,
    node: Regex,
    generic: Regex,
    runner_workspace: Regex,
    tmp_checkout: Regex,
    python_lib: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        // File "/var/task/handler.py", line 42, in lambda_handler
        python: Regex::new(r#"File "([^"]+)",\s+line (\d+)(?:,\s+in (\S+))?"#)
            .expect("valid python frame regex"),
        // at functionName (/path/to/file.js:10:5) or at /path/to/file.js:10:5
        node: Regex::new(r"at\s+(?:(\S+)\s+)?\(?([^():]+):(\d+):(\d+)\)?")
            .expect("valid node frame regex"),
        generic: Regex::new(r"([\w./-]+\.\w{1,5}):(\d+)").expect("valid path:line regex"),
        runner_workspace: Regex::new(r"^/home/runner/work/[^/]+/[^/]+/")
            .expect("valid runner workspace regex"),
        tmp_checkout: Regex::new(r"^/tmp/[a-f0-9-]+/").expect("valid tmp checkout regex"),
        python_lib: Regex::new(r"lib/python\d").expect("valid python lib regex"),
    })
}

/// Strip deployment runtime prefixes from a path.
pub fn normalize_path(raw: &str) -> String {
    let mut result = raw.trim().to_string();
    for prefix in STRIP_PREFIXES {
        if let Some(rest) = result.strip_prefix(prefix) {
            result = rest.to_string();
        }
    }
    let p = patterns();
    for re in [&p.runner_workspace, &p.tmp_checkout] {
        result = re.replace(&result, "").into_owned();
    }
    match result.strip_prefix("./") {
        Some(rest) => rest.to_string(),
        None => result,
    }
}

fn is_noise(path: &str) -> bool {
    NOISE_MARKERS.iter().any(|marker| path.contains(marker)) || patterns().python_lib.is_match(path)
}

/// Every frame found in `text`, deduplicated by normalized path and line.
///
/// Python and Node frames are collected first; the generic `path:line` form
/// is only consulted when neither produced anything.
pub fn parse_frames(text: &str) -> Vec<TraceFrame> {
    let p = patterns();
    let mut frames = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |frame: TraceFrame, frames: &mut Vec<TraceFrame>| {
        let key = format!(
            "{}:{}",
            frame.normalized_path,
            frame.line.map(|l| l.to_string()).unwrap_or_default()
        );
        if seen.insert(key) {
            frames.push(frame);
        }
    };

    for caps in p.python.captures_iter(text) {
        let raw = &caps[1];
        push(
            TraceFrame {
                raw_path: raw.to_string(),
                normalized_path: normalize_path(raw),
                line: caps[2].parse().ok(),
                column: None,
                function: caps.get(3).map(|m| m.as_str().to_string()).unwrap_or_default(),
            },
            &mut frames,
        );
    }

    for caps in p.node.captures_iter(text) {
        let raw = &caps[2];
        push(
            TraceFrame {
                raw_path: raw.to_string(),
                normalized_path: normalize_path(raw),
                line: caps[3].parse().ok(),
                column: caps[4].parse().ok(),
                function: caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
            },
            &mut frames,
        );
    }

    if frames.is_empty() {
        for caps in p.generic.captures_iter(text) {
            let raw = &caps[1];
            push(
                TraceFrame {
                    raw_path: raw.to_string(),
                    normalized_path: normalize_path(raw),
                    line: caps[2].parse().ok(),
                    column: None,
                    function: String::new(),
                },
                &mut frames,
            );
        }
    }

    frames
}

/// Application frames only, at most [`MAX_APP_FRAMES`] of them.
pub fn extract_app_frames(text: &str) -> Vec<TraceFrame> {
    parse_frames(text)
        .into_iter()
        .filter(|f| !f.normalized_path.is_empty() && !is_noise(&f.normalized_path))
        .take(MAX_APP_FRAMES)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PYTHON_TRACE: &str = r#"Traceback (most recent call last):
  File "/var/lang/lib/python3.12/site-packages/botocore/client.py", line 553, in _api_call
  File "/var/task/orders/handler.py", line 42, in lambda_handler
  File "/var/task/orders/service.py", line 17, in place_order
  File "/var/task/orders/service.py", line 17, in place_order
KeyError: 'sku'"#;

    #[test]
    fn test_normalize_strips_runtime_prefixes() {
        assert_eq!(normalize_path("/var/task/handler.py"), "handler.py");
        assert_eq!(normalize_path("/usr/src/app/src/index.js"), "src/index.js");
        assert_eq!(normalize_path("/app/lib/util.py"), "lib/util.py");
        assert_eq!(normalize_path("/opt/python/shared/db.py"), "shared/db.py");
        assert_eq!(
            normalize_path("/home/runner/work/orders/orders/src/main.py"),
            "src/main.py"
        );
        assert_eq!(
            normalize_path("/tmp/3f2a-bc01/worker/job.py"),
            "worker/job.py"
        );
        assert_eq!(normalize_path("./relative/path.py"), "relative/path.py");
        assert_eq!(normalize_path("src/untouched.rs"), "src/untouched.rs");
    }

    #[test]
    fn test_python_frames_skip_libraries_and_duplicates() {
        let frames = extract_app_frames(PYTHON_TRACE);
        let paths: Vec<&str> = frames.iter().map(|f| f.normalized_path.as_str()).collect();
        assert_eq!(paths, vec!["orders/handler.py", "orders/service.py"]);
        assert_eq!(frames[0].line, Some(42));
        assert_eq!(frames[0].function, "lambda_handler");
        assert_eq!(frames[0].raw_path, "/var/task/orders/handler.py");
    }

    #[test]
    fn test_node_frames_with_and_without_function() {
        let text = "TypeError: x is undefined\n    at processOrder (/usr/src/app/src/orders.js:10:5)\n    at /usr/src/app/src/index.js:3:1\n    at Module._compile (/usr/src/app/node_modules/lib/loader.js:1:1)";
        let frames = extract_app_frames(text);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].normalized_path, "src/orders.js");
        assert_eq!(frames[0].function, "processOrder");
        assert_eq!(frames[0].column, Some(5));
        assert_eq!(frames[1].normalized_path, "src/index.js");
        assert_eq!(frames[1].function, "");
    }

    #[test]
    fn test_generic_fallback_only_when_nothing_else_matched() {
        let frames = extract_app_frames("panic near src/billing/invoice.rs:88 during close");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].normalized_path, "src/billing/invoice.rs");
        assert_eq!(frames[0].line, Some(88));

        // A python frame suppresses the generic scan entirely
        let mixed = "see util.py:3\n  File \"/app/main.py\", line 1, in run";
        let frames = extract_app_frames(mixed);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].normalized_path, "main.py");
    }

    #[test]
    fn test_frames_are_capped() {
        let text: String = (1..=8)
            .map(|i| format!("  File \"/var/task/m{}.py\", line {}, in f\n", i, i))
            .collect();
        assert_eq!(extract_app_frames(&text).len(), MAX_APP_FRAMES);
        assert_eq!(parse_frames(&text).len(), 8);
    }

    #[test]
    fn test_no_frames_in_plain_text() {
        assert!(extract_app_frames("latency is elevated on checkout").is_empty());
    }
}
