// kiln-common/src/formula_dsl.rs
//! Reader for the declarative subset of Ruby formula files:
//! metadata fields, `depends_on`, `system` lines inside `def install`,
//! a `def caveats` heredoc and a `test do` block.

use tracing::debug;

use crate::error::{KilnError, Result};
use crate::model::formula::{
    BuildPhase, FormulaRecord, InstallStep, TestInvocation, STD_CMAKE_ARGS_TOKEN,
};

const CONTEXT: &str = "formula DSL";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Arg {
    Str(String),
    Splat(String),
    Symbol(String),
    Arrow,
    Bare(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    Class,
    Install,
    Caveats,
    Test,
    /// A block we do not interpret. Holds its nesting depth.
    Skipped(usize),
}

#[derive(Default)]
struct Draft {
    name: Option<String>,
    desc: Option<String>,
    homepage: Option<String>,
    url: Option<String>,
    sha256: Option<String>,
    version: Option<String>,
    build_dependencies: Vec<String>,
    runtime_dependencies: Vec<String>,
    install: Option<Vec<InstallStep>>,
    test: Option<TestInvocation>,
    caveats: Option<String>,
}

/// Parses a formula file. `file_stem` takes precedence over the class name
/// when naming the record.
pub fn parse_formula(source: &str, file_stem: Option<&str>) -> Result<FormulaRecord> {
    let mut draft = Draft::default();
    let mut block: Option<Block> = None;
    let mut lines = source.lines().enumerate();

    while let Some((idx, raw)) = lines.next() {
        let line_no = idx + 1;
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }

        match block {
            None => {
                if let Some(rest) = line.strip_prefix("class ") {
                    let class_name = rest
                        .split('<')
                        .next()
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .ok_or_else(|| err(line_no, "class header without a name"))?;
                    draft.name = Some(match file_stem {
                        Some(stem) => stem.to_string(),
                        None => kebab_case(class_name),
                    });
                    block = Some(Block::Class);
                } else {
                    debug!("Ignoring top-level line {}: {}", line_no, line);
                }
            }
            Some(Block::Class) => {
                if line == "end" {
                    block = None;
                } else if line == "def install" {
                    draft.install = Some(Vec::new());
                    block = Some(Block::Install);
                } else if line == "def caveats" {
                    block = Some(Block::Caveats);
                } else if line == "test do" {
                    block = Some(Block::Test);
                } else if opens_block(line) {
                    debug!("Skipping unsupported block at line {}: {}", line_no, line);
                    block = Some(Block::Skipped(1));
                } else {
                    parse_field(line, line_no, &mut draft)?;
                }
            }
            Some(Block::Install) => {
                if line == "end" {
                    block = Some(Block::Class);
                    continue;
                }
                let Some(args) = system_args(line, line_no)? else {
                    debug!("Ignoring non-system line {} in install: {}", line_no, line);
                    continue;
                };
                let steps = draft.install.get_or_insert_with(Vec::new);
                let step = install_step(args, line_no, steps.last().map(|s| s.phase))?;
                steps.push(step);
            }
            Some(Block::Caveats) => {
                if line == "end" {
                    block = Some(Block::Class);
                } else if let Some(marker) = heredoc_marker(line) {
                    let mut body = Vec::new();
                    let mut closed = false;
                    for (_, raw_body) in lines.by_ref() {
                        if raw_body.trim() == marker {
                            closed = true;
                            break;
                        }
                        body.push(raw_body);
                    }
                    if !closed {
                        return Err(err(line_no, &format!("unterminated heredoc <<~{marker}")));
                    }
                    draft.caveats = Some(rewrite_interpolation(&dedent(&body)));
                } else if let Some(Arg::Str(text)) = tokenize(line, line_no)?.into_iter().next() {
                    draft.caveats = Some(text);
                }
            }
            Some(Block::Test) => {
                if line == "end" {
                    block = Some(Block::Class);
                    continue;
                }
                match system_args(line, line_no)? {
                    Some(args) if draft.test.is_none() => {
                        draft.test = Some(TestInvocation {
                            command: command_from_args(args, line_no)?,
                        });
                    }
                    Some(_) => debug!("Only the first test command is kept; ignoring line {}", line_no),
                    None => debug!("Ignoring non-system line {} in test: {}", line_no, line),
                }
            }
            Some(Block::Skipped(depth)) => {
                if line == "end" {
                    block = Some(if depth == 1 { Block::Class } else { Block::Skipped(depth - 1) });
                } else if opens_block(line) {
                    block = Some(Block::Skipped(depth + 1));
                }
            }
        }
    }

    if let Some(open) = block {
        return Err(KilnError::ParseError(
            CONTEXT,
            format!("unexpected end of file inside {open:?} block"),
        ));
    }

    let name = draft
        .name
        .ok_or_else(|| KilnError::ParseError(CONTEXT, "no `class ... < Formula` header".to_string()))?;
    let url = draft
        .url
        .ok_or_else(|| KilnError::ParseError(CONTEXT, format!("formula '{name}' has no url")))?;

    FormulaRecord {
        name,
        version: draft.version.unwrap_or_default(),
        desc: draft.desc,
        homepage: draft.homepage,
        url,
        sha256: draft.sha256.unwrap_or_default(),
        build_dependencies: draft.build_dependencies,
        runtime_dependencies: draft.runtime_dependencies,
        install: draft.install,
        test: draft.test,
        caveats: draft.caveats,
    }
    .normalized()
}

fn parse_field(line: &str, line_no: usize, draft: &mut Draft) -> Result<()> {
    let (keyword, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let args = tokenize(rest, line_no)?;
    let first_string = || match args.first() {
        Some(Arg::Str(s)) => Ok(s.clone()),
        _ => Err(err(line_no, &format!("`{keyword}` expects a string"))),
    };

    match keyword {
        "desc" => draft.desc = Some(first_string()?),
        "homepage" => draft.homepage = Some(first_string()?),
        "url" => draft.url = Some(first_string()?),
        "sha256" => draft.sha256 = Some(first_string()?),
        "version" => draft.version = Some(first_string()?),
        "depends_on" => {
            let dep = first_string()?;
            let symbols: Vec<&str> = args
                .iter()
                .skip_while(|a| **a != Arg::Arrow)
                .filter_map(|a| match a {
                    Arg::Symbol(s) => Some(s.as_str()),
                    _ => None,
                })
                .collect();
            if symbols.contains(&"build") {
                draft.build_dependencies.push(dep);
            } else if symbols.iter().any(|s| matches!(*s, "test" | "optional")) {
                debug!("Ignoring {:?} dependency '{}' at line {}", symbols, dep, line_no);
            } else {
                draft.runtime_dependencies.push(dep);
            }
        }
        other => debug!("Ignoring unsupported field `{}` at line {}", other, line_no),
    }
    Ok(())
}

/// Arguments of a `system` call, or `None` for other statements and for
/// calls guarded by a trailing `if`/`unless`.
fn system_args(line: &str, line_no: usize) -> Result<Option<Vec<Arg>>> {
    let Some(rest) = line.strip_prefix("system") else {
        return Ok(None);
    };
    if !rest.starts_with(char::is_whitespace) && !rest.starts_with('(') {
        return Ok(None);
    }
    let rest = rest.trim().trim_start_matches('(');
    let args = tokenize(rest, line_no)?;
    if args
        .iter()
        .any(|a| matches!(a, Arg::Bare(w) if w == "if" || w == "unless"))
    {
        debug!("Skipping conditional system call at line {}: {}", line_no, line);
        return Ok(None);
    }
    Ok(Some(args))
}

fn command_from_args(args: Vec<Arg>, line_no: usize) -> Result<Vec<String>> {
    let mut command = Vec::with_capacity(args.len());
    for arg in args {
        match arg {
            Arg::Str(s) => command.push(s),
            Arg::Splat(name) if name == "std_cmake_args" => {
                command.push(STD_CMAKE_ARGS_TOKEN.to_string())
            }
            Arg::Splat(name) => {
                return Err(err(line_no, &format!("unsupported splat `*{name}`")));
            }
            Arg::Symbol(_) | Arg::Arrow | Arg::Bare(_) => {
                return Err(err(line_no, "system arguments must be strings"));
            }
        }
    }
    if command.is_empty() {
        return Err(err(line_no, "system call without a command"));
    }
    Ok(command)
}

fn install_step(
    args: Vec<Arg>,
    line_no: usize,
    previous: Option<BuildPhase>,
) -> Result<InstallStep> {
    let command = command_from_args(args, line_no)?;
    let phase = classify(&command).max(previous.unwrap_or(BuildPhase::Configure));
    Ok(InstallStep { phase, command })
}

/// Phase a command most plausibly belongs to, judged by the build tool's
/// conventional sub-commands.
fn classify(command: &[String]) -> BuildPhase {
    let program = command[0].rsplit('/').next().unwrap_or(&command[0]);
    let has = |flag: &str| command.iter().skip(1).any(|a| a == flag);
    match program {
        "cmake" if has("--install") => BuildPhase::Install,
        "cmake" if has("--build") => BuildPhase::Build,
        "make" | "gmake" | "ninja" if has("install") => BuildPhase::Install,
        "make" | "gmake" | "ninja" => BuildPhase::Build,
        _ => BuildPhase::Configure,
    }
}

fn tokenize(input: &str, line_no: usize) -> Result<Vec<Arg>> {
    let mut args = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | ',' | '(' | ')' | '[' | ']' => {
                chars.next();
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                while let Some(ch) = chars.next() {
                    match ch {
                        '\\' => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some(other) => s.push(other),
                            None => break,
                        },
                        '#' if chars.peek() == Some(&'{') => {
                            chars.next();
                            let inner: String = chars.by_ref().take_while(|&ch| ch != '}').collect();
                            s.push('{');
                            s.push_str(interpolation_token(inner.trim()));
                            s.push('}');
                        }
                        '"' => {
                            closed = true;
                            break;
                        }
                        other => s.push(other),
                    }
                }
                if !closed {
                    return Err(err(line_no, "unterminated string literal"));
                }
                args.push(Arg::Str(s));
            }
            '\'' => {
                chars.next();
                let s: String = chars.by_ref().take_while(|&ch| ch != '\'').collect();
                args.push(Arg::Str(s));
            }
            '*' => {
                chars.next();
                args.push(Arg::Splat(take_word(&mut chars)));
            }
            ':' => {
                chars.next();
                args.push(Arg::Symbol(take_word(&mut chars)));
            }
            '=' => {
                chars.next();
                if chars.next() != Some('>') {
                    return Err(err(line_no, "expected `=>`"));
                }
                args.push(Arg::Arrow);
            }
            _ => {
                let word = take_word(&mut chars);
                if word.is_empty() {
                    chars.next();
                } else {
                    args.push(Arg::Bare(word));
                }
            }
        }
    }
    Ok(args)
}

fn take_word(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut word = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_alphanumeric() || matches!(c, '_' | '?' | '!' | '.') {
            word.push(c);
            chars.next();
        } else {
            break;
        }
    }
    word
}

fn interpolation_token(expr: &str) -> &str {
    match expr {
        "buildpath" => "source_dir",
        "ENV.make_jobs" => "jobs",
        other => other,
    }
}

fn rewrite_interpolation(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("#{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                out.push('{');
                out.push_str(interpolation_token(after[..end].trim()));
                out.push('}');
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn heredoc_marker(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("<<~").or_else(|| line.strip_prefix("<<-"))?;
    let marker = rest.split('.').next()?.trim();
    (!marker.is_empty()).then_some(marker)
}

fn dedent(lines: &[&str]) -> String {
    let indent = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    let mut out = lines
        .iter()
        .map(|l| if l.len() >= indent { &l[indent..] } else { l.trim_start() })
        .collect::<Vec<_>>()
        .join("\n");
    out.push('\n');
    out
}

fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut prev = '\0';
    for (i, c) in line.char_indices() {
        match c {
            '"' if prev != '\\' => in_string = !in_string,
            '#' if !in_string => return &line[..i],
            _ => {}
        }
        prev = c;
    }
    line
}

fn opens_block(line: &str) -> bool {
    let first = line.split_whitespace().next().unwrap_or("");
    matches!(first, "def" | "if" | "unless" | "case" | "begin" | "while" | "class" | "module")
        || line.ends_with(" do")
        || line.contains(" do |")
}

/// `QvmFfmpeg` -> `qvm-ffmpeg`, `OpensslAT3` -> `openssl@3`.
fn kebab_case(class_name: &str) -> String {
    let chars: Vec<char> = class_name.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == 'A' && chars.get(i + 1) == Some(&'T') && chars.get(i + 2).is_some_and(char::is_ascii_digit) {
            out.push('@');
            i += 2;
            continue;
        }
        if c.is_ascii_uppercase() {
            if i > 0 && !out.ends_with('@') {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
        i += 1;
    }
    out
}

fn err(line_no: usize, msg: &str) -> KilnError {
    KilnError::ParseError(CONTEXT, format!("line {line_no}: {msg}"))
}
