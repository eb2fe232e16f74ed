//! Shell command and tool output heuristics.
//!
//! Agents without dedicated file tools read files and search code through
//! the shell. This module sniffs those commands (`cat`, `sed -n`, `nl | sed`,
//! `head`, `rg`, `grep`) so they can be shown as structured Read/Grep calls,
//! and parses the text envelopes tool output arrives in.
//!
//! Everything here is best effort and pure: no I/O, no session state.

use crate::sessions::StructuredResult;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellIntent {
    Read(ReadCall),
    Grep(GrepCall),
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadCall {
    pub file_path: String,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    /// Output lines carry `nl`/`cat -n` style number prefixes.
    pub numbered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GrepCall {
    pub pattern: String,
    pub path: Option<String>,
    pub glob: Option<String>,
    pub case_insensitive: bool,
    pub files_only: bool,
}

/// Parsed tool output: body with the envelope stripped, plus error status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub body: String,
    pub exit_code: Option<i64>,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Op(String),
}

/// Split a command line into words and unquoted operators.
/// Returns None on unbalanced quotes.
fn tokenize(command: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = command.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next()? {
                        '\'' => break,
                        ch => word.push(ch),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next()? {
                        '"' => break,
                        '\\' => {
                            let escaped = chars.next()?;
                            if !matches!(escaped, '"' | '\\' | '$' | '`') {
                                word.push('\\');
                            }
                            word.push(escaped);
                        }
                        ch => word.push(ch),
                    }
                }
            }
            '\\' => {
                in_word = true;
                word.push(chars.next()?);
            }
            '|' | '&' | ';' | '<' | '>' => {
                if in_word {
                    tokens.push(Token::Word(std::mem::take(&mut word)));
                    in_word = false;
                }
                let mut op = c.to_string();
                while let Some(&next) = chars.peek() {
                    if matches!(next, '|' | '&' | ';' | '<' | '>') {
                        op.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Op(op));
            }
            c if c.is_whitespace() => {
                if in_word {
                    tokens.push(Token::Word(std::mem::take(&mut word)));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }
    if in_word {
        tokens.push(Token::Word(word));
    }
    Some(tokens)
}

/// Split tokens into pipeline stages; None if any other operator appears.
fn pipeline(tokens: Vec<Token>) -> Option<Vec<Vec<String>>> {
    let mut stages = vec![Vec::new()];
    for token in tokens {
        match token {
            Token::Word(w) => stages.last_mut()?.push(w),
            Token::Op(op) if op == "|" => stages.push(Vec::new()),
            Token::Op(_) => return None,
        }
    }
    if stages.iter().any(|s| s.is_empty()) {
        return None;
    }
    Some(stages)
}

/// Classify a shell command as a file read, a search, or anything else.
pub fn classify(command: &str) -> ShellIntent {
    let Some(stages) = tokenize(command.trim()).and_then(pipeline) else {
        return ShellIntent::Other;
    };

    let intent = match stages.as_slice() {
        [single] => classify_single(single),
        [first, second] => classify_numbered_pipe(first, second),
        _ => None,
    };
    intent.unwrap_or(ShellIntent::Other)
}

fn classify_single(words: &[String]) -> Option<ShellIntent> {
    let (program, args) = words.split_first()?;
    match program.as_str() {
        "cat" => parse_cat(args).map(ShellIntent::Read),
        "sed" => {
            let (range, file) = parse_sed(args)?;
            let file = file?;
            Some(ShellIntent::Read(ReadCall {
                file_path: file,
                offset: Some(range.0),
                limit: Some(range.1 - range.0 + 1),
                numbered: false,
            }))
        }
        "head" => parse_head(args).map(ShellIntent::Read),
        "nl" => {
            let file = parse_nl(args)?;
            Some(ShellIntent::Read(ReadCall {
                file_path: file,
                offset: None,
                limit: None,
                numbered: true,
            }))
        }
        "rg" => parse_rg(args).map(ShellIntent::Grep),
        "grep" | "egrep" => parse_grep(args).map(ShellIntent::Grep),
        _ => None,
    }
}

/// `nl -ba FILE | sed -n 'A,Bp'`
fn classify_numbered_pipe(first: &[String], second: &[String]) -> Option<ShellIntent> {
    let (program, args) = first.split_first()?;
    let (sed, sed_args) = second.split_first()?;
    if program != "nl" || sed != "sed" {
        return None;
    }
    let file = parse_nl(args)?;
    let (range, sed_file) = parse_sed(sed_args)?;
    if sed_file.is_some() {
        return None;
    }
    Some(ShellIntent::Read(ReadCall {
        file_path: file,
        offset: Some(range.0),
        limit: Some(range.1 - range.0 + 1),
        numbered: true,
    }))
}

fn parse_cat(args: &[String]) -> Option<ReadCall> {
    let mut numbered = false;
    let mut file = None;
    for arg in args {
        match arg.as_str() {
            "-n" => numbered = true,
            a if a.starts_with('-') => return None,
            a => {
                if file.replace(a.to_string()).is_some() {
                    // Multiple files are a concatenation, not a read.
                    return None;
                }
            }
        }
    }
    Some(ReadCall {
        file_path: file?,
        offset: None,
        limit: None,
        numbered,
    })
}

/// `sed -n 'Ap'` / `sed -n 'A,Bp' [FILE]` → ((A, B), FILE)
fn parse_sed(args: &[String]) -> Option<((u64, u64), Option<String>)> {
    let mut quiet = false;
    let mut script = None;
    let mut file = None;
    for arg in args {
        if arg == "-n" {
            quiet = true;
        } else if arg.starts_with('-') {
            return None;
        } else if script.is_none() {
            script = Some(arg.as_str());
        } else if file.replace(arg.clone()).is_some() {
            return None;
        }
    }
    if !quiet {
        return None;
    }
    let range = script?.strip_suffix('p')?;
    let (start, end) = match range.split_once(',') {
        Some((a, b)) => (a.trim().parse().ok()?, b.trim().parse().ok()?),
        None => {
            let line: u64 = range.trim().parse().ok()?;
            (line, line)
        }
    };
    if start == 0 || end < start {
        return None;
    }
    Some(((start, end), file))
}

fn parse_head(args: &[String]) -> Option<ReadCall> {
    let mut limit = None;
    let mut file = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "-n" {
            limit = Some(iter.next()?.parse().ok()?);
        } else if let Some(n) = arg.strip_prefix("-n") {
            limit = Some(n.parse().ok()?);
        } else if let Some(n) = arg.strip_prefix('-') {
            limit = Some(n.parse().ok()?);
        } else if file.replace(arg.clone()).is_some() {
            return None;
        }
    }
    Some(ReadCall {
        file_path: file?,
        offset: Some(1),
        limit: Some(limit.unwrap_or(10)),
        numbered: false,
    })
}

fn parse_nl(args: &[String]) -> Option<String> {
    let mut file = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-ba" => {}
            "-b" => {
                if iter.next()? != "a" {
                    return None;
                }
            }
            a if a.starts_with('-') => return None,
            a => {
                if file.replace(a.to_string()).is_some() {
                    return None;
                }
            }
        }
    }
    file
}

fn parse_rg(args: &[String]) -> Option<GrepCall> {
    let mut call = GrepCall::default();
    let mut positional = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-i" | "--ignore-case" => call.case_insensitive = true,
            "-l" | "--files-with-matches" => call.files_only = true,
            "-g" | "--glob" => call.glob = Some(iter.next()?.clone()),
            "-e" | "--regexp" => call.pattern = iter.next()?.clone(),
            "-C" | "-A" | "-B" | "-m" | "-t" | "--type" | "--max-count" | "--context" => {
                iter.next()?;
            }
            a if a.starts_with("--glob=") => call.glob = Some(a["--glob=".len()..].to_string()),
            a if a.starts_with('-') => {}
            a => positional.push(a.to_string()),
        }
    }
    finish_grep(call, positional)
}

fn parse_grep(args: &[String]) -> Option<GrepCall> {
    let mut call = GrepCall::default();
    let mut positional = Vec::new();
    let mut recursive = false;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-e" => call.pattern = iter.next()?.clone(),
            "-C" | "-A" | "-B" | "-m" => {
                iter.next()?;
            }
            a if a.starts_with("--include=") => {
                call.glob = Some(a["--include=".len()..].to_string())
            }
            a if a.starts_with("--") => {}
            a if a.starts_with('-') => {
                // Bundled short flags: -rni, -rl, ...
                for flag in a[1..].chars() {
                    match flag {
                        'i' => call.case_insensitive = true,
                        'l' => call.files_only = true,
                        'r' | 'R' => recursive = true,
                        _ => {}
                    }
                }
            }
            a => positional.push(a.to_string()),
        }
    }
    // A non-recursive grep without a path reads stdin.
    if !recursive && positional.len() < 2 && call.pattern.is_empty() {
        return None;
    }
    finish_grep(call, positional)
}

fn finish_grep(mut call: GrepCall, mut positional: Vec<String>) -> Option<GrepCall> {
    if call.pattern.is_empty() {
        if positional.is_empty() {
            return None;
        }
        call.pattern = positional.remove(0);
    }
    match positional.len() {
        0 => {}
        1 => call.path = positional.pop(),
        _ => return None,
    }
    Some(call)
}

/// Pull the command line out of a shell tool's input, whichever shape it uses.
pub fn command_from_input(input: &Value) -> Option<String> {
    if let Some(cmd) = input.get("cmd").and_then(|v| v.as_str()) {
        return Some(cmd.to_string());
    }
    match input.get("command")? {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let parts: Vec<&str> = parts.iter().filter_map(|p| p.as_str()).collect();
            match parts.as_slice() {
                [shell, flag, script, ..]
                    if is_shell(shell) && matches!(*flag, "-lc" | "-c") =>
                {
                    Some(script.to_string())
                }
                [] => None,
                other => Some(other.join(" ")),
            }
        }
        _ => None,
    }
}

fn is_shell(program: &str) -> bool {
    matches!(
        program.rsplit('/').next().unwrap_or(program),
        "bash" | "sh" | "zsh"
    )
}

fn exit_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^(?:Exit code:|Process exited with code)\s*(-?\d+)")
            .expect("exit code regex is valid")
    })
}

fn envelope_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:Exit code:|Process exited with code|Wall time:|Chunk ID:|Original token count:|Total output lines:)",
        )
        .expect("envelope regex is valid")
    })
}

fn error_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?mi)^\s*(?:error|fatal|failed):")
            .expect("error line regex is valid")
    })
}

/// Parse raw shell output (plain text, JSON string, or structured value).
pub fn parse_output(raw: &Value) -> ToolOutput {
    parse_tool_output(raw, true)
}

/// Parse raw tool output. With `sniff_errors`, an `error:` / `fatal:` /
/// `failed:` line marks the output failed when no exit code is reported;
/// only shell commands report failure that way.
pub fn parse_tool_output(raw: &Value, sniff_errors: bool) -> ToolOutput {
    match raw {
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(obj @ Value::Object(_)) => parse_object(&obj, sniff_errors),
            _ => parse_text(s, sniff_errors),
        },
        Value::Object(_) => parse_object(raw, sniff_errors),
        Value::Array(items) => {
            let text = items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.as_str()),
                    other => other.get("text").and_then(|t| t.as_str()),
                })
                .collect::<Vec<_>>()
                .join("\n");
            parse_text(&text, sniff_errors)
        }
        Value::Null => ToolOutput {
            body: String::new(),
            exit_code: None,
            is_error: false,
        },
        other => parse_text(&other.to_string(), sniff_errors),
    }
}

fn parse_object(obj: &Value, sniff_errors: bool) -> ToolOutput {
    let text_field = ["output", "stdout", "content", "text"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(|v| v.as_str()));
    let stderr = obj.get("stderr").and_then(|v| v.as_str()).unwrap_or("");
    let body = match text_field {
        Some(t) if !t.is_empty() => t,
        _ => stderr,
    };

    let exit_code = obj
        .get("exit_code")
        .or_else(|| obj.get("exitCode"))
        .or_else(|| obj.get("metadata").and_then(|m| m.get("exit_code")))
        .and_then(|v| v.as_i64());

    // The body may itself carry an envelope; its framing is stripped either way.
    let inner = parse_text(body, sniff_errors);

    if let Some(code) = exit_code {
        return ToolOutput {
            body: inner.body,
            exit_code: Some(code),
            is_error: code != 0,
        };
    }
    if let Some(status) = obj.get("status").and_then(|v| v.as_str()) {
        let is_error = matches!(
            status.to_ascii_lowercase().as_str(),
            "error" | "failed" | "failure" | "errored"
        );
        return ToolOutput {
            body: inner.body,
            exit_code: inner.exit_code,
            is_error,
        };
    }
    inner
}

fn parse_text(text: &str, sniff_errors: bool) -> ToolOutput {
    let exit_code = exit_code_re()
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<i64>().ok());

    let body = strip_envelope(text, exit_code.is_some());
    let is_error = match exit_code {
        Some(code) => code != 0,
        None => sniff_errors && error_line_re().is_match(text),
    };
    ToolOutput {
        body,
        exit_code,
        is_error,
    }
}

fn strip_envelope(text: &str, has_envelope: bool) -> String {
    if let Some(pos) = text.find("\nOutput:\n") {
        return text[pos + "\nOutput:\n".len()..].to_string();
    }
    if let Some(rest) = text.strip_prefix("Output:\n") {
        return rest.to_string();
    }
    if !has_envelope {
        return text.to_string();
    }
    text.lines()
        .skip_while(|line| envelope_line_re().is_match(line) || line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Strip an `nl -ba` / `cat -n` prefix, returning (line number, text).
fn split_numbered(line: &str) -> Option<(u64, &str)> {
    let trimmed = line.trim_start();
    let digits = trimmed.len() - trimmed.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }
    let number = trimmed[..digits].parse().ok()?;
    let rest = &trimmed[digits..];
    let rest = rest.strip_prefix('\t').or_else(|| rest.strip_prefix("  "))?;
    Some((number, rest))
}

/// Rebuild a Read result from the body of a sniffed shell read.
pub fn read_result(call: &ReadCall, body: &str) -> StructuredResult {
    let mut start_line = call.offset.unwrap_or(1);
    let lines: Vec<&str> = if call.numbered {
        let mut first = None;
        let lines: Vec<&str> = body
            .lines()
            .map(|line| match split_numbered(line) {
                Some((n, text)) => {
                    first.get_or_insert(n);
                    text
                }
                None => line,
            })
            .collect();
        if let Some(n) = first {
            start_line = n;
        }
        lines
    } else {
        body.lines().collect()
    };

    StructuredResult::File {
        file_path: call.file_path.clone(),
        content: lines.join("\n"),
        start_line,
        num_lines: lines.len() as u64,
    }
}

/// Rebuild a Grep result from the body of a sniffed `rg`/`grep`.
pub fn grep_result(call: &GrepCall, body: &str) -> StructuredResult {
    let lines: Vec<&str> = body
        .lines()
        .filter(|l| !l.trim().is_empty() && *l != "--")
        .collect();

    let mut filenames: Vec<String> = Vec::new();
    let mut push_file = |name: &str| {
        if !filenames.iter().any(|f| f == name) {
            filenames.push(name.to_string());
        }
    };

    for line in &lines {
        if call.files_only {
            push_file(line.trim());
            continue;
        }
        let mut parts = line.splitn(3, ':');
        let first = parts.next().unwrap_or("");
        let second = parts.next();
        let third = parts.next();
        let first_is_number = !first.is_empty() && first.chars().all(|c| c.is_ascii_digit());
        match (second, third) {
            (Some(n), Some(_)) if !first_is_number && n.chars().all(|c| c.is_ascii_digit()) => {
                push_file(first)
            }
            (Some(_), _) if !first_is_number && (first.contains('/') || first.contains('.')) => {
                push_file(first)
            }
            _ => {}
        }
    }
    if filenames.is_empty() && !lines.is_empty() {
        if let Some(path) = &call.path {
            filenames.push(path.clone());
        }
    }

    StructuredResult::Matches {
        num_files: filenames.len(),
        filenames,
        num_matches: lines.len(),
        content: lines.join("\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn read(path: &str, offset: Option<u64>, limit: Option<u64>, numbered: bool) -> ShellIntent {
        ShellIntent::Read(ReadCall {
            file_path: path.to_string(),
            offset,
            limit,
            numbered,
        })
    }

    #[test]
    fn classifies_reads() {
        let cases = [
            ("cat src/main.rs", read("src/main.rs", None, None, false)),
            ("cat -n 'my file.rs'", read("my file.rs", None, None, true)),
            ("sed -n '10,20p' src/lib.rs", read("src/lib.rs", Some(10), Some(11), false)),
            ("sed -n 5p a.txt", read("a.txt", Some(5), Some(1), false)),
            (
                "nl -ba src/lib.rs | sed -n '1,40p'",
                read("src/lib.rs", Some(1), Some(40), true),
            ),
            ("nl -b a x.py", read("x.py", None, None, true)),
            ("head -n 25 README.md", read("README.md", Some(1), Some(25), false)),
            ("head -5 README.md", read("README.md", Some(1), Some(5), false)),
        ];
        for (command, expected) in cases {
            assert_eq!(classify(command), expected, "command: {command}");
        }
    }

    #[test]
    fn classifies_greps() {
        let cases = [
            (
                "rg -n 'fn main' src",
                GrepCall {
                    pattern: "fn main".into(),
                    path: Some("src".into()),
                    ..Default::default()
                },
            ),
            (
                "rg -i --glob '*.rs' TODO",
                GrepCall {
                    pattern: "TODO".into(),
                    glob: Some("*.rs".into()),
                    case_insensitive: true,
                    ..Default::default()
                },
            ),
            (
                "grep -rl \"use serde\" .",
                GrepCall {
                    pattern: "use serde".into(),
                    path: Some(".".into()),
                    files_only: true,
                    ..Default::default()
                },
            ),
            (
                "rg -e foo -C 2 lib",
                GrepCall {
                    pattern: "foo".into(),
                    path: Some("lib".into()),
                    ..Default::default()
                },
            ),
        ];
        for (command, expected) in cases {
            assert_eq!(classify(command), ShellIntent::Grep(expected), "command: {command}");
        }
    }

    #[test]
    fn leaves_everything_else_alone() {
        let cases = [
            "cat a.txt b.txt",
            "cat a.txt > b.txt",
            "cd src && cat main.rs",
            "sed -i 's/a/b/' file",
            "sed '1,5p' file",
            "grep foo",
            "cat src/main.rs | rg foo",
            "cargo test",
            "echo 'unterminated",
            "",
            "rg",
        ];
        for command in cases {
            assert_eq!(classify(command), ShellIntent::Other, "command: {command}");
        }
    }

    #[test]
    fn extracts_command_from_inputs() {
        let cases = [
            (json!({"command": ["bash", "-lc", "cat a.rs"]}), Some("cat a.rs")),
            (json!({"command": ["/bin/zsh", "-c", "ls"]}), Some("ls")),
            (json!({"command": ["ls", "-la"]}), Some("ls -la")),
            (json!({"cmd": "rg foo"}), Some("rg foo")),
            (json!({"command": "git status"}), Some("git status")),
            (json!({"path": "x"}), None),
        ];
        for (input, expected) in cases {
            assert_eq!(command_from_input(&input).as_deref(), expected, "input: {input}");
        }
    }

    #[test]
    fn output_prefers_explicit_exit_code() {
        let raw = json!(r#"{"output":"error: nope\n","metadata":{"exit_code":0,"duration_seconds":0.1}}"#);
        let out = parse_output(&raw);
        assert_eq!(out.exit_code, Some(0));
        assert!(!out.is_error);
        assert_eq!(out.body, "error: nope\n");

        let out = parse_output(&json!({"stdout": "", "stderr": "boom", "exitCode": 2}));
        assert!(out.is_error);
        assert_eq!(out.body, "boom");

        let out = parse_output(&json!({"output": "done", "status": "failed"}));
        assert!(out.is_error);
    }

    #[test]
    fn output_envelopes_are_stripped() {
        let text = "Exit code: 1\nWall time: 0.2 seconds\nOutput:\nno such file\n";
        let out = parse_output(&json!(text));
        assert_eq!(out.exit_code, Some(1));
        assert!(out.is_error);
        assert_eq!(out.body, "no such file\n");

        let text = "Chunk ID: 9f\nWall time: 0.0010 seconds\nProcess exited with code 0\nOriginal token count: 3\nOutput:\nfn main() {}\n";
        let out = parse_output(&json!(text));
        assert_eq!(out.exit_code, Some(0));
        assert!(!out.is_error);
        assert_eq!(out.body, "fn main() {}\n");

        let text = "Process exited with code 0\nWall time: 1s\n\nhello";
        assert_eq!(parse_output(&json!(text)).body, "hello");
    }

    #[test]
    fn plain_text_errors_need_line_prefix() {
        let cases = [
            ("error: could not compile", true),
            ("warning\nfatal: not a git repository", true),
            ("Failed: 3 tests", true),
            ("the word error: appears mid-line", false),
            ("no errors found; failed: 0 is fine mid text", false),
            ("all good", false),
        ];
        for (text, expected) in cases {
            assert_eq!(parse_output(&json!(text)).is_error, expected, "text: {text}");
        }
    }

    #[test]
    fn non_shell_output_only_fails_on_reported_codes() {
        assert!(!parse_tool_output(&json!("error: could not compile"), false).is_error);
        assert!(parse_tool_output(&json!("Exit code: 2\nOutput:\nboom"), false).is_error);
        assert!(parse_tool_output(&json!({"output": "x", "status": "failed"}), false).is_error);
    }

    #[test]
    fn read_result_strips_line_numbers() {
        let call = ReadCall {
            file_path: "src/lib.rs".into(),
            offset: Some(1),
            limit: Some(40),
            numbered: true,
        };
        let body = "    12\tuse std::fs;\n    13\t\n    14\tfn main() {}";
        let StructuredResult::File { content, start_line, num_lines, file_path } =
            read_result(&call, body)
        else {
            panic!("expected file result");
        };
        assert_eq!(file_path, "src/lib.rs");
        assert_eq!(start_line, 12);
        assert_eq!(num_lines, 3);
        assert_eq!(content, "use std::fs;\n\nfn main() {}");
    }

    #[test]
    fn grep_result_collects_filenames() {
        let call = GrepCall {
            pattern: "fn".into(),
            path: Some("src".into()),
            ..Default::default()
        };
        let body = "src/a.rs:1:fn a() {}\nsrc/b.rs:7:fn b() {}\n--\nsrc/a.rs:9:fn c() {}\n";
        let StructuredResult::Matches { filenames, num_files, num_matches, .. } =
            grep_result(&call, body)
        else {
            panic!("expected matches");
        };
        assert_eq!(filenames, vec!["src/a.rs", "src/b.rs"]);
        assert_eq!(num_files, 2);
        assert_eq!(num_matches, 3);

        let single = GrepCall {
            pattern: "x".into(),
            path: Some("main.rs".into()),
            ..Default::default()
        };
        let StructuredResult::Matches { filenames, .. } = grep_result(&single, "3:let x = 1;") else {
            panic!("expected matches");
        };
        assert_eq!(filenames, vec!["main.rs"]);
    }
}
