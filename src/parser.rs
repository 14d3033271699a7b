//! Streaming AI-response parser.
//!
//! Extracts typed code blocks and shell commands from raw model output,
//! which may be a complete response or an in-progress prefix of a stream.
//! A block is only extractable once its closing fence has arrived;
//! unterminated blocks at the end of the buffer are never extracted, so no
//! partial content is ever written.
//!
//! Two file-block conventions are recognized:
//! - a fenced block carrying a `filename="..."` (or `file="..."`) attribute
//!   after the language tag (the primary convention), and
//! - a fenced block whose first line is a comment naming a path (a
//!   lower-confidence fallback for models that drop the attribute).

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

/// Fenced block with an explicit filename attribute:
/// ````text
/// ```tsx filename="app/page.tsx"
/// ...
/// ```
/// ````
const FILE_BLOCK_PATTERN: &str =
    r#"(?ms)^```([A-Za-z0-9_+-]*)[ \t]+(?:filename|file)="([^"\r\n]+)"[^\n]*\r?\n(.*?)^```[ \t]*$"#;

/// Fenced block whose first line is a comment; the comment may name the file.
const COMMENT_HEADER_BLOCK_PATTERN: &str =
    r"(?ms)^```([A-Za-z0-9_+-]*)[ \t]*\r?\n[ \t]*((?://|#|/\*|<!--|--)[^\n]*)\r?\n(.*?)^```[ \t]*$";

/// Fenced shell block without a filename attribute.
const SHELL_BLOCK_PATTERN: &str = r"(?ms)^```(?:bash|sh|zsh|shell)[ \t]*\r?\n(.*?)^```[ \t]*$";

/// Leading fenced JSON planning block (`{"steps": [...]}`), used only for
/// progress display.
const PLAN_BLOCK_PATTERN: &str = r"(?ms)^```json[ \t]*\r?\n(.*?)^```[ \t]*$";

/// Extension-like token inside a comment (`vite.config.ts`, `mod.rs`).
const PATHISH_TOKEN_PATTERN: &str = r"^\S+\.\w+$";

/// Number of leading content characters included in a block's dedup key.
const DEDUP_PREFIX_CHARS: usize = 64;

fn file_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(FILE_BLOCK_PATTERN).expect("file block pattern"))
}

fn comment_header_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(COMMENT_HEADER_BLOCK_PATTERN).expect("comment header pattern"))
}

fn shell_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(SHELL_BLOCK_PATTERN).expect("shell block pattern"))
}

fn plan_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(PLAN_BLOCK_PATTERN).expect("plan block pattern"))
}

fn pathish_token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(PATHISH_TOKEN_PATTERN).expect("pathish token pattern"))
}

/// A completed code block destined for a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCodeBlock {
    /// Relative path of the target file.
    pub filename: String,
    /// Block body, trimmed at the outer edges only.
    pub content: String,
    /// Fence language tag; `"plaintext"` when absent.
    pub language: String,
}

/// A shell command parsed from a fenced shell block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub command: String,
    pub args: Vec<String>,
    /// Original line, kept for logging and echoing.
    pub raw: String,
}

fn language_or_default(tag: &str) -> String {
    if tag.is_empty() {
        "plaintext".to_string()
    } else {
        tag.to_string()
    }
}

/// Pull a path-looking token out of a comment line: a token containing `/`,
/// or one shaped like `name.ext`. Returns `None` for ordinary prose comments.
fn filename_from_comment(comment: &str) -> Option<String> {
    let stripped = comment
        .trim_start()
        .trim_start_matches("//")
        .trim_start_matches('#')
        .trim_start_matches("/*")
        .trim_start_matches("<!--")
        .trim_start_matches("--")
        .trim_end_matches("*/")
        .trim_end_matches("-->")
        .trim();
    stripped
        .split_whitespace()
        .map(|token| token.trim_matches([':', ',', ';', '"', '\'', '`']))
        .find(|token| token.contains('/') || pathish_token_regex().is_match(token))
        .map(|token| token.to_string())
}

/// Extract every completed file block from `text`.
///
/// Both conventions are scanned independently and results are concatenated
/// without cross-pattern deduplication; duplicate entries for one path are
/// harmless because a later identical write is a no-op in effect.
pub fn extract_code_blocks(text: &str) -> Vec<ParsedCodeBlock> {
    let mut blocks = Vec::new();

    for captures in file_block_regex().captures_iter(text) {
        blocks.push(ParsedCodeBlock {
            filename: captures[2].trim().to_string(),
            content: captures[3].trim().to_string(),
            language: language_or_default(captures[1].trim()),
        });
    }

    for captures in comment_header_regex().captures_iter(text) {
        let Some(filename) = filename_from_comment(&captures[2]) else {
            continue;
        };
        blocks.push(ParsedCodeBlock {
            filename,
            content: captures[3].trim().to_string(),
            language: language_or_default(captures[1].trim()),
        });
    }

    blocks
}

/// Extract shell commands from every completed shell block, in source order.
///
/// Blank lines and `#` comments are skipped. A block whose first line is a
/// filename-looking comment is skipped entirely: it is a commented file
/// header, not a command script.
pub fn extract_commands(text: &str) -> Vec<ParsedCommand> {
    let mut commands = Vec::new();

    for captures in shell_block_regex().captures_iter(text) {
        let body = &captures[1];
        let mut lines = body.lines().filter(|line| !line.trim().is_empty());
        let Some(first) = lines.next() else {
            continue;
        };
        let first = first.trim();
        if first.starts_with('#') && filename_from_comment(first).is_some() {
            tracing::debug!(header = %first, "skipping shell block with file-header comment");
            continue;
        }

        for line in std::iter::once(first).chain(lines.map(str::trim)) {
            if line.starts_with('#') {
                continue;
            }
            let mut tokens = line.split_whitespace();
            let Some(command) = tokens.next() else {
                continue;
            };
            commands.push(ParsedCommand {
                command: command.to_string(),
                args: tokens.map(str::to_string).collect(),
                raw: line.to_string(),
            });
        }
    }

    commands
}

/// Parse the optional leading JSON planning block: `{"steps": ["...", ...]}`.
pub fn extract_plan_steps(text: &str) -> Option<Vec<String>> {
    let captures = plan_block_regex().captures(text)?;
    let value: serde_json::Value = serde_json::from_str(captures[1].trim()).ok()?;
    let steps = value.get("steps")?.as_array()?;
    Some(
        steps
            .iter()
            .filter_map(|step| step.as_str().map(str::to_string))
            .collect(),
    )
}

/// Incremental parser over an accumulating stream buffer.
///
/// Each [`push_chunk`](Self::push_chunk) re-runs extraction against the full
/// buffer and returns only blocks not seen before in this session, keyed by
/// filename plus a prefix of the content. Two different blocks for the same
/// file that share their first [`DEDUP_PREFIX_CHARS`] characters would be
/// conflated; that false negative is accepted.
#[derive(Debug, Default)]
pub struct StreamingParser {
    buffer: String,
    applied: HashSet<String>,
}

impl StreamingParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything received so far.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    fn block_key(block: &ParsedCodeBlock) -> String {
        let prefix: String = block.content.chars().take(DEDUP_PREFIX_CHARS).collect();
        format!("{}:{}", block.filename, prefix)
    }

    /// Append a chunk and return blocks newly completed by it.
    pub fn push_chunk(&mut self, chunk: &str) -> Vec<ParsedCodeBlock> {
        self.buffer.push_str(chunk);
        extract_code_blocks(&self.buffer)
            .into_iter()
            .filter(|block| self.applied.insert(Self::block_key(block)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_block_exact_extraction() {
        let text = "Here is the page:\n```tsx filename=\"app/page.tsx\"\nexport default function Page(){return null}\n```\nDone.";
        let blocks = extract_code_blocks(text);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].filename, "app/page.tsx");
        assert_eq!(blocks[0].language, "tsx");
        assert_eq!(blocks[0].content, "export default function Page(){return null}");
    }

    #[test]
    fn test_file_attribute_variant() {
        let text = "```css file=\"styles/main.css\"\nbody { margin: 0; }\n```";
        let blocks = extract_code_blocks(text);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].filename, "styles/main.css");
    }

    #[test]
    fn test_missing_language_defaults_to_plaintext() {
        let text = "``` filename=\"notes.txt\"\nhello\n```";
        let blocks = extract_code_blocks(text);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].language, "plaintext");
    }

    #[test]
    fn test_unterminated_block_not_extracted() {
        let text = "```tsx filename=\"app/page.tsx\"\nexport default";
        assert!(extract_code_blocks(text).is_empty());
    }

    #[test]
    fn test_multiple_blocks_in_order() {
        let text = concat!(
            "```js filename=\"a.js\"\nlet a;\n```\n",
            "prose in between\n",
            "```js filename=\"b.js\"\nlet b;\n```\n",
        );
        let blocks = extract_code_blocks(text);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].filename, "a.js");
        assert_eq!(blocks[1].filename, "b.js");
    }

    #[test]
    fn test_comment_header_fallback() {
        let text = "```js\n// src/utils/math.js\nexport const add = (a, b) => a + b;\n```";
        let blocks = extract_code_blocks(text);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].filename, "src/utils/math.js");
        assert_eq!(blocks[0].content, "export const add = (a, b) => a + b;");
    }

    #[test]
    fn test_comment_without_path_is_not_a_file() {
        let text = "```js\n// just a helper\nconst x = 1;\n```";
        assert!(extract_code_blocks(text).is_empty());
    }

    #[test]
    fn test_body_trimmed_only_at_outer_edges() {
        let text = "```py filename=\"run.py\"\n\nif x:\n    print(x)\n\n```";
        let blocks = extract_code_blocks(text);
        assert_eq!(blocks[0].content, "if x:\n    print(x)");
    }

    #[test]
    fn test_commands_split_into_tokens() {
        let text = "```bash\nnpm install react react-dom\n\n# a comment\nnpm run dev\n```";
        let commands = extract_commands(text);
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].command, "npm");
        assert_eq!(commands[0].args, vec!["install", "react", "react-dom"]);
        assert_eq!(commands[0].raw, "npm install react react-dom");
        assert_eq!(commands[1].args, vec!["run", "dev"]);
    }

    #[test]
    fn test_shell_block_with_filename_header_skipped() {
        let text = "```sh\n# scripts/setup.sh\necho hello\n```";
        assert!(extract_commands(text).is_empty());
        // ...and the same block is picked up as a file by the fallback.
        let blocks = extract_code_blocks(text);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].filename, "scripts/setup.sh");
    }

    #[test]
    fn test_shell_block_with_prose_comment_still_runs() {
        let text = "```bash\n# install dependencies\nnpm install\n```";
        let commands = extract_commands(text);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].command, "npm");
    }

    #[test]
    fn test_file_attribute_block_not_treated_as_commands() {
        let text = "```sh filename=\"deploy.sh\"\nrm -rf build\n```";
        assert!(extract_commands(text).is_empty());
        assert_eq!(extract_code_blocks(text).len(), 1);
    }

    #[test]
    fn test_plan_steps() {
        let text = "```json\n{\"steps\": [\"Set up project\", \"Write components\"]}\n```\nthen files...";
        assert_eq!(
            extract_plan_steps(text).unwrap(),
            vec!["Set up project", "Write components"]
        );
        assert!(extract_plan_steps("no plan here").is_none());
    }

    #[test]
    fn test_streaming_no_write_until_fence_closes() {
        let mut parser = StreamingParser::new();
        let first = parser.push_chunk("```tsx filename=\"app/page.tsx\"\nexport default fun");
        assert!(first.is_empty());

        let second = parser.push_chunk("ction Page(){return null}\n```");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].filename, "app/page.tsx");
        assert_eq!(second[0].content, "export default function Page(){return null}");
    }

    #[test]
    fn test_streaming_does_not_replay_applied_blocks() {
        let mut parser = StreamingParser::new();
        let first = parser.push_chunk("```js filename=\"a.js\"\nlet a;\n```\n");
        assert_eq!(first.len(), 1);

        // The buffer still contains the completed block; only the newly
        // finished one comes back.
        let second = parser.push_chunk("```js filename=\"b.js\"\nlet b;\n```\n");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].filename, "b.js");

        assert!(parser.push_chunk("trailing prose").is_empty());
    }
}
