//! Sandboxed file reads. The canonical path of `base_dir` is resolved at
//! construction and becomes the security boundary; every input runs through
//! a fail-closed validation pipeline before a single byte is read.

use std::path::PathBuf;
use std::sync::LazyLock;

use futures::future::BoxFuture;
use regex::Regex;
use tokio::io::AsyncReadExt;
use unicode_normalization::UnicodeNormalization;

use crate::config::FileReadConfig;
use crate::error::{EngineError, EngineResult};
use crate::task::{ExecutionInput, ExecutionResult};
use crate::tool::Tool;

const MAX_INPUT_CHARS: usize = 4096;
const MAX_COMPONENTS: usize = 10;
const MAX_SEPARATORS: usize = 100;
/// Files below this size are read in one call.
const SINGLE_READ_LIMIT: u64 = 1024 * 1024;

const RESERVED_DEVICE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

const FORBIDDEN_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

const TEMPLATE_MARKERS: &[&str] = &[
    "${", "#{", "%{", "$(", "`", "{{", "{%", "<%", "[%", "[[", "]]", "}}",
];

/// Matched against the lowercased input.
const ENCODED_TRAVERSAL: &[&str] = &[
    "%2e%2e",
    "%252e%252e",
    "\\u002e\\u002e",
    "\\x2e\\x2e",
    "%c0%ae%c0%ae",
    "%e0%80%ae",
    "..%2f",
    "..%5c",
    "...",
];

/// Matched against the lowercased, slash-normalized input with a leading
/// separator prepended, so `etc/passwd` is caught as well as `a/etc/b`.
const SYSTEM_PATH_MARKERS: &[&str] = &[
    "/system32/", "/windows/", "/etc/", "/usr/", "/var/", "/bin/", "/sbin/",
];

/// Unicode Format (Cf) code points plus the zero-width and bidi-override
/// ranges the pipeline names explicitly.
const FORMAT_RANGES: &[(u32, u32)] = &[
    (0x00AD, 0x00AD),
    (0x0600, 0x0605),
    (0x061C, 0x061C),
    (0x06DD, 0x06DD),
    (0x070F, 0x070F),
    (0x08E2, 0x08E2),
    (0x180E, 0x180E),
    (0x200B, 0x200F),
    (0x202A, 0x202E),
    (0x2060, 0x2064),
    (0x2066, 0x206F),
    (0xFEFF, 0xFEFF),
    (0xFFF9, 0xFFFB),
    (0x110BD, 0x110BD),
    (0x1BCA0, 0x1BCA3),
    (0x1D173, 0x1D17A),
    (0xE0001, 0xE0001),
    (0xE0020, 0xE007F),
];

static URI_SCHEME: LazyLock<Regex> = LazyLock::new(|| {
    // `scheme://...` or `scheme:` immediately followed by an ASCII
    // alphanumeric.
    Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*:(//|[A-Za-z0-9])").expect("scheme pattern is valid")
});

#[derive(Debug)]
pub struct FileReadTool {
    base_dir: PathBuf,
    allow_symlinks: bool,
    max_size_bytes: u64,
    max_path_length: usize,
}

impl FileReadTool {
    /// Resolves the real path of `base_dir` up front; a base directory that
    /// does not exist is a configuration error.
    pub fn new(config: &FileReadConfig) -> EngineResult<Self> {
        let base_dir = std::fs::canonicalize(&config.base_dir).map_err(|e| {
            EngineError::configuration(format!(
                "file read base directory '{}' cannot be resolved",
                config.base_dir.display()
            ))
            .with_source(e)
        })?;
        Ok(Self {
            base_dir,
            allow_symlinks: config.allow_symlinks,
            max_size_bytes: config.max_size_bytes,
            max_path_length: config.max_path_length,
        })
    }

    pub fn base_dir(&self) -> &std::path::Path {
        &self.base_dir
    }

    async fn read_validated(&self, raw: &str) -> Result<String, String> {
        self.validate_input(raw)?;
        self.scan_patterns(raw)?;
        self.check_structure(raw)?;

        let candidate = self.base_dir.join(raw);

        if !self.allow_symlinks {
            if let Ok(meta) = tokio::fs::symlink_metadata(&candidate).await {
                if meta.file_type().is_symlink() {
                    return Err("Symbolic links are not allowed".to_owned());
                }
            }
        }

        let real = match tokio::fs::canonicalize(&candidate).await {
            Ok(real) => real,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err("File not found".to_owned());
            },
            Err(_) => return Err("Path cannot be resolved".to_owned()),
        };

        if !real.starts_with(&self.base_dir) {
            tracing::warn!(input = raw, "rejected path escaping base directory");
            return Err("Path escapes base directory".to_owned());
        }

        let meta = tokio::fs::metadata(&real)
            .await
            .map_err(|_| "File not found".to_owned())?;
        if meta.is_dir() {
            return Err("Path is a directory".to_owned());
        }
        let size = meta.len();
        if size > self.max_size_bytes {
            return Err(format!(
                "File exceeds maximum size of {} bytes",
                self.max_size_bytes
            ));
        }

        let bytes = if size < SINGLE_READ_LIMIT {
            tokio::fs::read(&real)
                .await
                .map_err(|e| format!("Failed to read file: {e}"))?
        } else {
            self.read_chunked(&real, size).await?
        };

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn read_chunked(&self, path: &std::path::Path, size: u64) -> Result<Vec<u8>, String> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| format!("Failed to open file: {e}"))?;
        let mut buffer = vec![0u8; buffer_size(size)];
        let mut accumulated = Vec::with_capacity(size as usize);

        loop {
            let read = file
                .read(&mut buffer)
                .await
                .map_err(|e| format!("Failed to read file: {e}"))?;
            if read == 0 {
                break;
            }
            accumulated.extend_from_slice(&buffer[..read]);
            if accumulated.len() as u64 > self.max_size_bytes {
                return Err(format!(
                    "File exceeds maximum size of {} bytes",
                    self.max_size_bytes
                ));
            }
        }
        Ok(accumulated)
    }

    fn validate_input(&self, raw: &str) -> Result<(), String> {
        if raw.trim().is_empty() {
            return Err("Path must not be blank".to_owned());
        }
        if raw.chars().count() > MAX_INPUT_CHARS {
            return Err(format!("Path exceeds {MAX_INPUT_CHARS} characters"));
        }
        if raw
            .chars()
            .any(|c| c.is_control() && !matches!(c, '\t' | '\n' | '\r'))
        {
            return Err("Path contains control characters".to_owned());
        }
        if raw.nfc().collect::<String>() != raw {
            return Err("Path is not NFC-normalized".to_owned());
        }
        Ok(())
    }

    fn scan_patterns(&self, raw: &str) -> Result<(), String> {
        let components: Vec<&str> = raw.split(['/', '\\']).collect();

        if components.iter().any(|c| *c == "..")
            || raw == ".."
            || ["../", "..\\", "/..", "\\.."].iter().any(|p| raw.contains(p))
        {
            return Err("Path traversal is not allowed".to_owned());
        }
        if raw.starts_with('/') || raw.starts_with('\\') {
            return Err("Absolute paths are not allowed".to_owned());
        }
        if raw.len() >= 2 && raw.as_bytes()[1] == b':' && raw.as_bytes()[0].is_ascii_alphabetic() {
            return Err("Absolute paths are not allowed".to_owned());
        }
        if raw.starts_with("\\\\") {
            return Err("UNC paths are not allowed".to_owned());
        }
        if URI_SCHEME.is_match(raw) {
            return Err("URI schemes are not allowed".to_owned());
        }
        for component in &components {
            let stem = component.split('.').next().unwrap_or("");
            if RESERVED_DEVICE_NAMES.contains(&stem.to_ascii_uppercase().as_str()) {
                return Err("Reserved device names are not allowed".to_owned());
            }
        }
        if raw.chars().any(|c| {
            FORBIDDEN_CHARS.contains(&c)
                || (c as u32) <= 0x1F
                || (0x7F..=0x9F).contains(&(c as u32))
        }) {
            return Err("Path contains forbidden characters".to_owned());
        }
        for marker in TEMPLATE_MARKERS {
            if raw.contains(marker) {
                return Err("Path contains template markers".to_owned());
            }
        }
        let lower = raw.to_ascii_lowercase();
        for pattern in ENCODED_TRAVERSAL {
            if lower.contains(pattern) {
                return Err("Path contains encoded traversal sequences".to_owned());
            }
        }
        if raw
            .chars()
            .any(|c| FORMAT_RANGES.iter().any(|&(lo, hi)| (lo..=hi).contains(&(c as u32))))
        {
            return Err("Path contains invisible or bidirectional characters".to_owned());
        }
        if raw.contains('/') && raw.contains('\\') {
            return Err("Path mixes separator styles".to_owned());
        }
        let normalized = format!("/{}", lower.replace('\\', "/"));
        for marker in SYSTEM_PATH_MARKERS {
            if normalized.contains(marker) {
                return Err("System paths are not allowed".to_owned());
            }
        }
        Ok(())
    }

    fn check_structure(&self, raw: &str) -> Result<(), String> {
        if raw.chars().count() > self.max_path_length {
            return Err(format!(
                "Path exceeds maximum length of {} characters",
                self.max_path_length
            ));
        }
        let component_count = raw.split(['/', '\\']).filter(|c| !c.is_empty()).count();
        if component_count > MAX_COMPONENTS {
            return Err(format!("Path exceeds {MAX_COMPONENTS} components"));
        }
        let separator_count = raw.chars().filter(|c| matches!(c, '/' | '\\')).count();
        if separator_count > MAX_SEPARATORS {
            return Err(format!("Path exceeds {MAX_SEPARATORS} separators"));
        }
        Ok(())
    }
}

fn buffer_size(size: u64) -> usize {
    match size {
        s if s < SINGLE_READ_LIMIT => 1024,
        s if s < 16 * 1024 * 1024 => 4 * 1024,
        s if s < 64 * 1024 * 1024 => 8 * 1024,
        _ => 16 * 1024,
    }
}

impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "file_read"
    }

    fn description(&self) -> &str {
        "Reads a UTF-8 text file from within the configured base directory. \
         Input: a relative path with forward slashes, no traversal."
    }

    fn run(&self, input: ExecutionInput) -> BoxFuture<'_, ExecutionResult> {
        Box::pin(async move {
            let raw = input.content.trim().to_owned();
            match self.read_validated(&raw).await {
                Ok(text) => ExecutionResult::ok(text).with_metadata(serde_json::json!({
                    "path": raw,
                    "base_dir": self.base_dir.display().to_string(),
                })),
                Err(message) => ExecutionResult::failure(message),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_in(dir: &tempfile::TempDir) -> FileReadTool {
        FileReadTool::new(&FileReadConfig {
            base_dir: dir.path().to_path_buf(),
            allow_symlinks: false,
            max_size_bytes: 1024 * 1024,
            max_path_length: 512,
        })
        .expect("base dir exists")
    }

    async fn run(tool: &FileReadTool, input: &str) -> ExecutionResult {
        tool.run(ExecutionInput::new(input)).await
    }

    #[tokio::test]
    async fn test_reads_file_inside_base() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello sandbox").unwrap();

        let result = run(&tool_in(&dir), "notes.txt").await;
        assert!(result.success, "{}", result.output);
        assert_eq!(result.output, "hello sandbox");
    }

    #[tokio::test]
    async fn test_reads_nested_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        std::fs::write(dir.path().join("sub/deeper/a.txt"), "nested").unwrap();

        let result = run(&tool_in(&dir), "sub/deeper/a.txt").await;
        assert!(result.success);
        assert_eq!(result.output, "nested");
    }

    #[tokio::test]
    async fn test_traversal_denied() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool_in(&dir);

        for input in [
            "../../etc/passwd",
            "..",
            "a/../b",
            "..\\windows\\system.ini",
        ] {
            let result = run(&tool, input).await;
            assert!(!result.success, "should reject {input:?}");
        }
    }

    #[tokio::test]
    async fn test_absolute_and_drive_paths_denied() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool_in(&dir);

        for input in ["/tmp/x", "C:\\temp\\x", "c:x", "\\\\server\\share\\f"] {
            let result = run(&tool, input).await;
            assert!(!result.success, "should reject {input:?}");
        }
    }

    #[tokio::test]
    async fn test_uri_schemes_denied() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool_in(&dir);

        for input in ["file:///etc/passwd", "http://example.com/x", "data:text"] {
            let result = run(&tool, input).await;
            assert!(!result.success, "should reject {input:?}");
        }
    }

    #[tokio::test]
    async fn test_device_names_denied() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool_in(&dir);

        for input in ["CON", "con.txt", "sub/NUL", "lpt1.log", "COM9"] {
            let result = run(&tool, input).await;
            assert!(!result.success, "should reject {input:?}");
        }
    }

    #[tokio::test]
    async fn test_template_markers_denied() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool_in(&dir);

        for input in ["${HOME}/x", "a$(id).txt", "a`id`.txt", "{{var}}.txt", "a{%b%}.txt"] {
            let result = run(&tool, input).await;
            assert!(!result.success, "should reject {input:?}");
        }
    }

    #[tokio::test]
    async fn test_encoded_traversal_denied() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool_in(&dir);

        for input in [
            "%2e%2e/secret",
            "%252E%252E/secret",
            "..%2fsecret",
            "a...b",
            "\\u002e\\u002e/x",
        ] {
            let result = run(&tool, input).await;
            assert!(!result.success, "should reject {input:?}");
        }
    }

    #[tokio::test]
    async fn test_invisible_characters_denied() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool_in(&dir);

        for input in ["a\u{200B}b.txt", "a\u{FEFF}.txt", "a\u{202E}txt.exe"] {
            let result = run(&tool, input).await;
            assert!(!result.success, "should reject {input:?}");
        }
    }

    #[tokio::test]
    async fn test_mixed_separators_denied() {
        let dir = tempfile::tempdir().unwrap();
        let result = run(&tool_in(&dir), "a/b\\c.txt").await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_system_paths_denied_any_case() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool_in(&dir);

        for input in ["etc/passwd", "a/ETC/b", "usr/lib/x", "project/System32/cfg"] {
            let result = run(&tool, input).await;
            assert!(!result.success, "should reject {input:?}");
        }
    }

    #[tokio::test]
    async fn test_structural_limits() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool_in(&dir);

        let deep = (0..12).map(|i| format!("d{i}")).collect::<Vec<_>>().join("/");
        assert!(!run(&tool, &deep).await.success);

        let long = "x".repeat(600);
        assert!(!run(&tool, &long).await.success);
    }

    #[tokio::test]
    async fn test_blank_and_control_inputs_denied() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool_in(&dir);

        assert!(!run(&tool, "").await.success);
        assert!(!run(&tool, "   ").await.success);
        assert!(!run(&tool, "a\u{0007}b").await.success);
    }

    #[tokio::test]
    async fn test_missing_file_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let result = run(&tool_in(&dir), "absent.txt").await;
        assert!(!result.success);
        assert_eq!(result.output, "File not found");
    }

    #[tokio::test]
    async fn test_directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();
        let result = run(&tool_in(&dir), "subdir").await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_size_limit_enforced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.txt"), vec![b'x'; 2048]).unwrap();

        let tool = FileReadTool::new(&FileReadConfig {
            base_dir: dir.path().to_path_buf(),
            allow_symlinks: false,
            max_size_bytes: 1024,
            max_path_length: 512,
        })
        .unwrap();

        let result = run(&tool, "big.txt").await;
        assert!(!result.success);
        assert!(result.output.contains("maximum size"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_denied() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "secret").unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            dir.path().join("link.txt"),
        )
        .unwrap();

        let result = run(&tool_in(&dir), "link.txt").await;
        assert!(!result.success);
    }

    #[test]
    fn test_buffer_size_ladder() {
        assert_eq!(buffer_size(512 * 1024), 1024);
        assert_eq!(buffer_size(2 * 1024 * 1024), 4 * 1024);
        assert_eq!(buffer_size(32 * 1024 * 1024), 8 * 1024);
        assert_eq!(buffer_size(256 * 1024 * 1024), 16 * 1024);
    }

    #[test]
    fn test_missing_base_dir_is_configuration_error() {
        let err = FileReadTool::new(&FileReadConfig {
            base_dir: PathBuf::from("/definitely/not/a/real/dir"),
            ..FileReadConfig::default()
        })
        .unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::Configuration);
    }
}
