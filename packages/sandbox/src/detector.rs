// ABOUTME: Static dependency detection for inline source code
// ABOUTME: Tokenizes source per language so imports inside comments and string literals never match

use crate::languages::Language;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::debug;

/// Ordered-by-first-occurrence, duplicate-free set of installable package names
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct DependencySet {
    packages: Vec<String>,
}

impl DependencySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a package, returning false when it was already present
    pub fn insert(&mut self, package: impl Into<String>) -> bool {
        let package = package.into();
        if self.contains(&package) {
            return false;
        }
        self.packages.push(package);
        true
    }

    pub fn contains(&self, package: &str) -> bool {
        self.packages.iter().any(|p| p == package)
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.packages.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.packages
    }
}

// Set equality: discovery order is not significant
impl PartialEq for DependencySet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|p| other.contains(p))
    }
}

impl Eq for DependencySet {}

impl<S: Into<String>> FromIterator<S> for DependencySet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = Self::new();
        for package in iter {
            set.insert(package);
        }
        set
    }
}

impl<'a> IntoIterator for &'a DependencySet {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.packages.iter()
    }
}

/// Extract likely third-party packages from source text without running it
pub fn detect(source: &str, language: Language) -> DependencySet {
    let deps: DependencySet = match language {
        Language::Python => python_imports(&tokenize(source, &PYTHON))
            .into_iter()
            .filter(|name| !PYTHON_STDLIB.contains(name.as_str()))
            .map(|name| canonical_python_package(&name))
            .collect(),
        Language::Go => go_imports(&tokenize(source, &GO))
            .into_iter()
            .filter(|path| !is_go_stdlib(path))
            .collect(),
        Language::NodeJs => node_imports(&tokenize(source, &JAVASCRIPT))
            .into_iter()
            .filter_map(|spec| node_installable_unit(&spec))
            .collect(),
    };

    debug!(
        language = %language,
        count = deps.len(),
        "Detected dependencies"
    );
    deps
}

// Alias table for import names that differ from the distributable name
const PYTHON_PACKAGE_ALIASES: &[(&str, &str)] = &[
    ("PIL", "pillow"),
    ("cv2", "opencv-python"),
    ("sklearn", "scikit-learn"),
    ("yaml", "PyYAML"),
    ("bs4", "beautifulsoup4"),
    ("dateutil", "python-dateutil"),
    ("dotenv", "python-dotenv"),
    ("jwt", "PyJWT"),
    ("Crypto", "pycryptodome"),
    ("attr", "attrs"),
];

fn canonical_python_package(import_name: &str) -> String {
    PYTHON_PACKAGE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == import_name)
        .map(|(_, package)| package.to_string())
        .unwrap_or_else(|| import_name.to_string())
}

static PYTHON_STDLIB: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "__future__", "__main__", "_thread", "abc", "aifc", "argparse", "array", "ast",
        "asynchat",
        "asyncio", "asyncore", "atexit", "audioop", "base64", "bdb", "binascii", "bisect",
        "builtins", "bz2", "cProfile", "calendar", "cgi", "cgitb", "chunk", "cmath", "cmd",
        "code", "codecs", "codeop", "collections", "colorsys", "compileall", "concurrent",
        "configparser", "contextlib", "contextvars", "copy", "copyreg", "crypt", "csv",
        "ctypes", "curses", "dataclasses", "datetime", "dbm", "decimal", "difflib", "dis",
        "doctest", "email", "encodings", "ensurepip", "enum", "errno", "faulthandler",
        "fcntl", "filecmp", "fileinput", "fnmatch", "fractions", "ftplib", "functools", "gc",
        "getopt", "getpass", "gettext", "glob", "graphlib", "grp", "gzip", "hashlib", "heapq",
        "hmac", "html", "http", "idlelib", "imaplib", "imghdr", "importlib", "inspect", "io",
        "ipaddress", "itertools", "json", "keyword", "lib2to3", "linecache", "locale",
        "logging", "lzma", "mailbox", "mailcap", "marshal", "math", "mimetypes", "mmap",
        "modulefinder", "msilib", "msvcrt", "multiprocessing", "netrc", "nis", "nntplib",
        "ntpath", "numbers", "opcode", "operator", "optparse", "os", "ossaudiodev", "pathlib",
        "pdb", "pickle", "pickletools", "pipes", "pkgutil", "platform", "plistlib", "poplib",
        "posix", "posixpath", "pprint", "profile", "pstats", "pty", "pwd", "py_compile",
        "pyclbr", "pydoc", "pyexpat", "queue", "quopri", "random", "re", "readline",
        "reprlib", "resource", "rlcompleter", "runpy", "sched", "secrets", "select",
        "selectors", "shelve", "shlex", "shutil", "signal", "site", "smtplib", "sndhdr",
        "socket", "socketserver", "spwd", "sqlite3", "sre_compile", "sre_constants",
        "sre_parse", "ssl", "stat", "statistics", "string", "stringprep", "struct",
        "subprocess", "sunau", "symtable", "sys", "sysconfig", "syslog", "tabnanny",
        "tarfile", "telnetlib", "tempfile", "termios", "textwrap", "this", "threading",
        "time", "timeit", "tkinter", "token", "tokenize", "tomllib", "trace", "traceback",
        "tracemalloc", "tty", "turtle", "types", "typing", "unicodedata", "unittest",
        "urllib", "uu", "uuid", "venv", "warnings", "wave", "weakref", "webbrowser",
        "winreg", "winsound", "wsgiref", "xdrlib", "xml", "xmlrpc", "zipapp", "zipfile",
        "zipimport", "zlib", "zoneinfo",
    ]
    .into_iter()
    .collect()
});

static NODE_BUILTINS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "assert", "async_hooks", "buffer", "child_process", "cluster", "console",
        "constants", "crypto", "dgram", "diagnostics_channel", "dns", "domain", "events",
        "fs", "http", "http2", "https", "inspector", "module", "net", "os", "path",
        "perf_hooks", "process", "punycode", "querystring", "readline", "repl", "stream",
        "string_decoder", "sys", "timers", "tls", "trace_events", "tty", "url", "util", "v8",
        "vm", "wasi", "worker_threads", "zlib",
    ]
    .into_iter()
    .collect()
});

/// Go standard library paths never carry a domain in their first element
fn is_go_stdlib(path: &str) -> bool {
    if path == "C" {
        return true;
    }
    let first = path.split('/').next().unwrap_or(path);
    !first.contains('.')
}

/// Reduce a module specifier to the npm package that provides it
fn node_installable_unit(spec: &str) -> Option<String> {
    if spec.is_empty()
        || spec.starts_with('.')
        || spec.starts_with('/')
        || spec.starts_with("node:")
        || spec.starts_with("bun:")
        || spec.contains("://")
    {
        return None;
    }

    let unit = if spec.starts_with('@') {
        let mut parts = spec.splitn(3, '/');
        let scope = parts.next()?;
        let name = parts.next().filter(|n| !n.is_empty())?;
        format!("{}/{}", scope, name)
    } else {
        spec.split('/').next()?.to_string()
    };

    if NODE_BUILTINS.contains(unit.as_str()) {
        None
    } else {
        Some(unit)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Punct(char),
    /// Numbers and regex literals; carried only so they act as operands
    Literal,
    Newline,
}

/// Comment and string syntax of one source language
struct Dialect {
    line_comment: &'static str,
    block_comments: bool,
    triple_quotes: bool,
    string_prefixes: bool,
    backtick_strings: bool,
    backtick_escapes: bool,
    template_interpolation: bool,
    regex_literals: bool,
    line_continuation: bool,
}

const PYTHON: Dialect = Dialect {
    line_comment: "#",
    block_comments: false,
    triple_quotes: true,
    string_prefixes: true,
    backtick_strings: false,
    backtick_escapes: false,
    template_interpolation: false,
    regex_literals: false,
    line_continuation: true,
};

const GO: Dialect = Dialect {
    line_comment: "//",
    block_comments: true,
    triple_quotes: false,
    string_prefixes: false,
    backtick_strings: true,
    backtick_escapes: false,
    template_interpolation: false,
    regex_literals: false,
    line_continuation: false,
};

const JAVASCRIPT: Dialect = Dialect {
    line_comment: "//",
    block_comments: true,
    triple_quotes: false,
    string_prefixes: false,
    backtick_strings: true,
    backtick_escapes: true,
    template_interpolation: true,
    regex_literals: true,
    line_continuation: false,
};

const REGEX_PRECEDING_KEYWORDS: &[&str] = &[
    "return", "typeof", "case", "do", "else", "in", "of", "new", "delete", "void", "throw",
    "instanceof", "yield", "await",
];

fn starts_with_at(chars: &[char], at: usize, pattern: &str) -> bool {
    let mut idx = at;
    for p in pattern.chars() {
        if chars.get(idx) != Some(&p) {
            return false;
        }
        idx += 1;
    }
    true
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_continue(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn is_string_prefix(ident: &str) -> bool {
    ident.len() <= 2
        && ident
            .chars()
            .all(|c| matches!(c.to_ascii_lowercase(), 'r' | 'b' | 'f' | 'u'))
}

fn regex_allowed(prev: Option<&Token>) -> bool {
    match prev {
        None => true,
        Some(Token::Punct(c)) => !matches!(c, ')' | ']'),
        Some(Token::Ident(word)) => REGEX_PRECEDING_KEYWORDS.contains(&word.as_str()),
        Some(Token::Str(_)) | Some(Token::Literal) => false,
        Some(Token::Newline) => true,
    }
}

fn tokenize(source: &str, dialect: &Dialect) -> Vec<Token> {
    let chars: Vec<char> = source.chars().collect();
    let n = chars.len();
    let mut tokens = Vec::new();
    let mut last_significant: Option<usize> = None;
    let mut i = 0;

    while i < n {
        let c = chars[i];

        if c == '\n' {
            tokens.push(Token::Newline);
            i += 1;
            continue;
        }
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if dialect.line_continuation && c == '\\' {
            let mut j = i + 1;
            if chars.get(j) == Some(&'\r') {
                j += 1;
            }
            if chars.get(j) == Some(&'\n') {
                i = j + 1;
                continue;
            }
        }
        if starts_with_at(&chars, i, dialect.line_comment) {
            while i < n && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if dialect.block_comments && starts_with_at(&chars, i, "/*") {
            let mut j = i + 2;
            let mut saw_newline = false;
            while j < n && !starts_with_at(&chars, j, "*/") {
                saw_newline |= chars[j] == '\n';
                j += 1;
            }
            if saw_newline {
                tokens.push(Token::Newline);
            }
            i = (j + 2).min(n);
            continue;
        }

        let is_quote = c == '"' || c == '\'' || (c == '`' && dialect.backtick_strings);
        if is_quote {
            let (content, next) = lex_string(&chars, i, dialect);
            last_significant = Some(tokens.len());
            // An interpolated template is not a static specifier
            let interpolated = c == '`'
                && dialect.template_interpolation
                && has_interpolation(&chars[i..next]);
            if interpolated {
                tokens.push(Token::Literal);
            } else {
                tokens.push(Token::Str(content));
            }
            i = next;
            continue;
        }

        if dialect.regex_literals
            && c == '/'
            && regex_allowed(last_significant.map(|idx| &tokens[idx]))
        {
            i = skip_regex(&chars, i);
            last_significant = Some(tokens.len());
            tokens.push(Token::Literal);
            continue;
        }

        if is_ident_start(c) {
            let start = i;
            while i < n && is_ident_continue(chars[i]) {
                i += 1;
            }
            let ident: String = chars[start..i].iter().collect();
            let prefixed_quote = i < n && (chars[i] == '"' || chars[i] == '\'');
            if dialect.string_prefixes && prefixed_quote && is_string_prefix(&ident) {
                let (content, next) = lex_string(&chars, i, dialect);
                last_significant = Some(tokens.len());
                tokens.push(Token::Str(content));
                i = next;
                continue;
            }
            last_significant = Some(tokens.len());
            tokens.push(Token::Ident(ident));
            continue;
        }

        if c.is_ascii_digit() {
            while i < n && (chars[i].is_alphanumeric() || chars[i] == '.' || chars[i] == '_') {
                i += 1;
            }
            last_significant = Some(tokens.len());
            tokens.push(Token::Literal);
            continue;
        }

        last_significant = Some(tokens.len());
        tokens.push(Token::Punct(c));
        i += 1;
    }

    tokens
}

/// Lex a quoted literal starting at `start`; returns content and the index after it
fn lex_string(chars: &[char], start: usize, dialect: &Dialect) -> (String, usize) {
    let n = chars.len();
    let quote = chars[start];
    let mut content = String::new();

    if dialect.triple_quotes && starts_with_at(chars, start, &quote.to_string().repeat(3)) {
        let closing = quote.to_string().repeat(3);
        let mut j = start + 3;
        while j < n {
            if chars[j] == '\\' && j + 1 < n {
                content.push(chars[j + 1]);
                j += 2;
                continue;
            }
            if starts_with_at(chars, j, &closing) {
                return (content, j + 3);
            }
            content.push(chars[j]);
            j += 1;
        }
        return (content, n);
    }

    let backtick = quote == '`';
    let escapes = !backtick || dialect.backtick_escapes;
    let mut j = start + 1;
    while j < n {
        let ch = chars[j];
        if escapes && ch == '\\' && j + 1 < n {
            content.push(chars[j + 1]);
            j += 2;
            continue;
        }
        if ch == quote {
            return (content, j + 1);
        }
        // Unterminated single-line literal ends at the line break
        if ch == '\n' && !backtick {
            return (content, j);
        }
        content.push(ch);
        j += 1;
    }
    (content, n)
}

/// True when a raw template literal holds an unescaped `${`
fn has_interpolation(raw: &[char]) -> bool {
    let mut j = 0;
    while j < raw.len() {
        match raw[j] {
            '\\' => j += 2,
            '$' if raw.get(j + 1) == Some(&'{') => return true,
            _ => j += 1,
        }
    }
    false
}

fn skip_regex(chars: &[char], start: usize) -> usize {
    let n = chars.len();
    let mut j = start + 1;
    let mut in_class = false;
    while j < n {
        match chars[j] {
            '\\' => {
                j += 2;
                continue;
            }
            '\n' => return j,
            '[' => in_class = true,
            ']' => in_class = false,
            '/' if !in_class => {
                j += 1;
                while j < n && chars[j].is_alphanumeric() {
                    j += 1;
                }
                return j;
            }
            _ => {}
        }
        j += 1;
    }
    n
}

fn ident_at<'a>(tokens: &'a [Token], idx: usize) -> Option<&'a str> {
    match tokens.get(idx) {
        Some(Token::Ident(s)) => Some(s.as_str()),
        _ => None,
    }
}

fn str_at(tokens: &[Token], idx: usize) -> Option<&str> {
    match tokens.get(idx) {
        Some(Token::Str(s)) => Some(s.as_str()),
        _ => None,
    }
}

fn punct_at(tokens: &[Token], idx: usize, c: char) -> bool {
    tokens.get(idx) == Some(&Token::Punct(c))
}

/// Parse `a.b.c` at `idx`; returns the first segment and the index after the name
fn dotted_name(tokens: &[Token], idx: usize) -> Option<(String, usize)> {
    let first = ident_at(tokens, idx)?.to_string();
    let mut j = idx + 1;
    while punct_at(tokens, j, '.') && ident_at(tokens, j + 1).is_some() {
        j += 2;
    }
    Some((first, j))
}

fn top_level_module(name: &str) -> Option<String> {
    if name.is_empty() || name.starts_with('.') {
        return None;
    }
    name.split('.').next().map(str::to_string)
}

fn python_imports(tokens: &[Token]) -> Vec<String> {
    let mut found = Vec::new();
    let mut depth = 0usize;
    let mut stmt_start = true;
    let mut i = 0;

    while i < tokens.len() {
        match &tokens[i] {
            Token::Newline => {
                if depth == 0 {
                    stmt_start = true;
                }
                i += 1;
                continue;
            }
            Token::Punct(';') | Token::Punct(':') if depth == 0 => {
                stmt_start = true;
                i += 1;
                continue;
            }
            Token::Punct('(') | Token::Punct('[') | Token::Punct('{') => depth += 1,
            Token::Punct(')') | Token::Punct(']') | Token::Punct('}') => {
                depth = depth.saturating_sub(1)
            }
            Token::Ident(word) if stmt_start && word == "import" => {
                i = python_import_statement(tokens, i + 1, &mut found);
                stmt_start = false;
                continue;
            }
            Token::Ident(word) if stmt_start && word == "from" => {
                i = python_from_statement(tokens, i + 1, &mut found);
                stmt_start = false;
                continue;
            }
            Token::Ident(word) if word == "__import__" || word == "import_module" => {
                if punct_at(tokens, i + 1, '(') {
                    if let Some(module) = str_at(tokens, i + 2).and_then(top_level_module) {
                        found.push(module);
                    }
                }
            }
            _ => {}
        }
        stmt_start = false;
        i += 1;
    }

    found
}

// `import a.b [as x], c`
fn python_import_statement(tokens: &[Token], mut i: usize, found: &mut Vec<String>) -> usize {
    while let Some((first, next)) = dotted_name(tokens, i) {
        found.push(first);
        i = next;
        if ident_at(tokens, i) == Some("as") {
            i += 2;
        }
        if punct_at(tokens, i, ',') {
            i += 1;
            continue;
        }
        break;
    }
    i
}

// `from a.b import ...`; relative imports are local code
fn python_from_statement(tokens: &[Token], i: usize, found: &mut Vec<String>) -> usize {
    if punct_at(tokens, i, '.') {
        return i;
    }
    match dotted_name(tokens, i) {
        Some((first, next)) if ident_at(tokens, next) == Some("import") => {
            found.push(first);
            next + 1
        }
        _ => i,
    }
}

fn go_imports(tokens: &[Token]) -> Vec<String> {
    let mut found = Vec::new();
    let mut i = 0;

    while i < tokens.len() {
        if ident_at(tokens, i) != Some("import") {
            i += 1;
            continue;
        }
        let mut j = i + 1;
        if punct_at(tokens, j, '(') {
            j += 1;
            while j < tokens.len() && !punct_at(tokens, j, ')') {
                if let Some(path) = str_at(tokens, j) {
                    found.push(path.to_string());
                }
                j += 1;
            }
            i = j + 1;
            continue;
        }
        // Named (`x "p"`), dot (`. "p"`) and blank (`_ "p"`) forms
        if ident_at(tokens, j).is_some() || punct_at(tokens, j, '.') {
            j += 1;
        }
        if let Some(path) = str_at(tokens, j) {
            found.push(path.to_string());
        }
        i = j + 1;
    }

    found
}

const NODE_SCAN_LIMIT: usize = 512;

fn node_imports(tokens: &[Token]) -> Vec<String> {
    let tokens: Vec<Token> = tokens
        .iter()
        .filter(|t| **t != Token::Newline)
        .cloned()
        .collect();
    let mut found = Vec::new();

    for i in 0..tokens.len() {
        let member_access = i > 0 && punct_at(&tokens, i - 1, '.');
        if member_access {
            continue;
        }
        match ident_at(&tokens, i) {
            Some("require") => {
                if punct_at(&tokens, i + 1, '(') && punct_at(&tokens, i + 3, ')') {
                    if let Some(spec) = str_at(&tokens, i + 2) {
                        found.push(spec.to_string());
                    }
                }
            }
            Some("import") => {
                if punct_at(&tokens, i + 1, '(') {
                    if let Some(spec) = str_at(&tokens, i + 2) {
                        found.push(spec.to_string());
                    }
                } else if let Some(spec) = str_at(&tokens, i + 1) {
                    found.push(spec.to_string());
                } else if !punct_at(&tokens, i + 1, '.') {
                    if let Some(spec) = scan_from_clause(&tokens, i + 1) {
                        found.push(spec);
                    }
                }
            }
            Some("export") => {
                if punct_at(&tokens, i + 1, '{') || punct_at(&tokens, i + 1, '*') {
                    if let Some(spec) = scan_from_clause(&tokens, i + 1) {
                        found.push(spec);
                    }
                }
            }
            _ => {}
        }
    }

    found
}

/// Find the `from "spec"` that closes an import/export clause
fn scan_from_clause(tokens: &[Token], start: usize) -> Option<String> {
    let end = (start + NODE_SCAN_LIMIT).min(tokens.len());
    for k in start..end {
        match &tokens[k] {
            Token::Punct(';') => return None,
            Token::Ident(word) if word == "import" || word == "export" => return None,
            Token::Ident(word) if word == "from" => {
                if let Some(spec) = str_at(tokens, k + 1) {
                    return Some(spec.to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn set(items: &[&str]) -> DependencySet {
        items.iter().copied().collect()
    }

    #[rstest]
    #[case::simple("import requests\nimport pandas as pd\nfrom PIL import Image", &["requests", "pandas", "pillow"])]
    #[case::stdlib_only("import os\nimport sys\nfrom datetime import datetime", &[])]
    #[case::mixed(
        "import os\nimport requests\nfrom datetime import datetime\nimport numpy as np\nfrom tensorflow import keras",
        &["requests", "numpy", "tensorflow"]
    )]
    #[case::multiline_block(
        "from fastapi import (\n    FastAPI,\n    HTTPException,\n    Depends,\n)\nimport numpy as np",
        &["fastapi", "numpy"]
    )]
    #[case::commented("# import requests\nimport numpy as np\n# from PIL import Image", &["numpy"])]
    #[case::string_literal("x = \"import requests\"\nimport numpy as np", &["numpy"])]
    #[case::docstring("\"\"\"\nimport requests\nfrom flask import Flask\n\"\"\"\nimport numpy", &["numpy"])]
    #[case::string_line_start("msg = '''\nimport torch\n'''\n", &[])]
    #[case::dynamic("np = __import__('numpy')\nrequests = __import__('requests')", &["numpy", "requests"])]
    #[case::importlib("import importlib\nmod = importlib.import_module('yaml')", &["PyYAML"])]
    #[case::submodule("import matplotlib.pyplot as plt\nfrom google.cloud import storage", &["matplotlib", "google"])]
    #[case::comma_list("import os, requests, sys as system, httpx", &["requests", "httpx"])]
    #[case::relative("from . import utils\nfrom .models import User\nimport attr", &["attrs"])]
    #[case::nested_statement("try:\n    import ujson as json\nexcept ImportError:\n    import json", &["ujson"])]
    #[case::inline_after_colon("if True: import rich", &["rich"])]
    #[case::future("from __future__ import annotations\nimport pydantic", &["pydantic"])]
    #[case::main_module("import __main__\nimport requests", &["requests"])]
    #[case::attribute_named_import("obj.import_thing = 1\nimport boto3", &["boto3"])]
    fn test_python_detection(#[case] code: &str, #[case] expected: &[&str]) {
        assert_eq!(detect(code, Language::Python), set(expected));
    }

    #[rstest]
    #[case::require("const express = require('express');\nconst axios = require('axios');", &["express", "axios"])]
    #[case::es6(
        "import axios from 'axios';\nimport { useState } from 'react';\nimport * as d3 from 'd3';",
        &["axios", "react", "d3"]
    )]
    #[case::builtins("const fs = require('fs');\nconst path = require('path');\nimport { Buffer } from 'buffer';", &[])]
    #[case::mixed(
        "const fs = require('fs');\nconst express = require('express');\nimport { useState } from 'react';\nconst path = require('path');",
        &["express", "react"]
    )]
    #[case::commented("// const express = require('express');\nconst axios = require('axios');\n// import { useState } from 'react';", &["axios"])]
    #[case::block_comment("/* import x from 'lodash';\n require('chalk') */\nimport y from 'zod';", &["zod"])]
    #[case::string_literal("const x = \"const express = require('express')\";\nconst axios = require('axios');", &["axios"])]
    #[case::template_literal("const t = `import a from 'left-pad'`;\nconst b = require('uuid');", &["uuid"])]
    #[case::dynamic("const mod = await import('lodash');\nimport('react').then(React => {});", &["lodash", "react"])]
    #[case::scoped("import { render } from '@testing-library/react/pure';", &["@testing-library/react"])]
    #[case::subpath("import map from 'lodash/map';\nconst fp = require('lodash/fp');", &["lodash"])]
    #[case::node_prefix("import fs from 'node:fs/promises';\nimport test from 'node:test';", &[])]
    #[case::relative("import x from './local';\nconst y = require('../up');\nimport z from '/abs';", &[])]
    #[case::multiline_named("import {\n  a,\n  b,\n} from 'some-lib';", &["some-lib"])]
    #[case::side_effect("import 'dotenv/config';", &["dotenv"])]
    #[case::reexport("export { default } from 'preact';\nexport * from '@scope/kit';", &["preact", "@scope/kit"])]
    #[case::member_require("const p = require.resolve('not-a-dep');\nconst m = import.meta.url;", &[])]
    #[case::regex_with_quote("const re = /['\"]/g;\nconst k = require('kleur');", &["kleur"])]
    #[case::type_import("import type { Foo } from 'foo-types';", &["foo-types"])]
    #[case::interpolated_require("const c = require(`${dir}/config`);\nconst d = require(`dayjs`);", &["dayjs"])]
    #[case::interpolated_import("const m = await import(`./locales/${lang}.js`);", &[])]
    // A regex right after `)` lexes as division, so the quote inside it opens a string
    #[case::regex_after_paren("if (ok) /'/.test(s); require('axios')", &[])]
    fn test_node_detection(#[case] code: &str, #[case] expected: &[&str]) {
        assert_eq!(detect(code, Language::NodeJs), set(expected));
    }

    #[rstest]
    #[case::single("package main\n\nimport \"github.com/gin-gonic/gin\"\nimport \"gorm.io/gorm\"", &["github.com/gin-gonic/gin", "gorm.io/gorm"])]
    #[case::grouped(
        "package main\n\nimport (\n    \"fmt\"\n    \"github.com/gin-gonic/gin\"\n    \"os\"\n    \"gorm.io/gorm\"\n)",
        &["github.com/gin-gonic/gin", "gorm.io/gorm"]
    )]
    #[case::stdlib_only("package main\n\nimport (\n    \"fmt\"\n    \"os\"\n    \"strings\"\n    \"net/http\"\n)", &[])]
    #[case::commented("package main\n\nimport (\n    // \"github.com/gin-gonic/gin\"\n    \"gorm.io/gorm\"\n)", &["gorm.io/gorm"])]
    #[case::named("package main\n\nimport (\n    gin \"github.com/gin-gonic/gin\"\n    db \"gorm.io/gorm\"\n)", &["github.com/gin-gonic/gin", "gorm.io/gorm"])]
    #[case::dot("package main\n\nimport (\n    . \"github.com/gin-gonic/gin\"\n    \"gorm.io/gorm\"\n)", &["github.com/gin-gonic/gin", "gorm.io/gorm"])]
    #[case::blank("package main\n\nimport _ \"github.com/lib/pq\"", &["github.com/lib/pq"])]
    #[case::block_comment("package main\n/*\nimport \"github.com/x/y\"\n*/\nimport \"fmt\"", &[])]
    #[case::string_body("package main\nimport \"fmt\"\nfunc main() { fmt.Println(`import \"github.com/a/b\"`) }", &[])]
    #[case::cgo("package main\nimport \"C\"", &[])]
    fn test_go_detection(#[case] code: &str, #[case] expected: &[&str]) {
        assert_eq!(detect(code, Language::Go), set(expected));
    }

    #[test]
    fn test_duplicates_collapse() {
        let code = "import requests\nimport requests\nfrom requests import get\n__import__('requests')";
        let deps = detect(code, Language::Python);
        assert_eq!(deps.len(), 1);
        assert!(deps.contains("requests"));

        let code = "const a = require('axios');\nimport b from 'axios';\nimport('axios/lib/x');";
        assert_eq!(detect(code, Language::NodeJs).len(), 1);
    }

    #[test]
    fn test_alias_and_canonical_name_dedupe() {
        let deps = detect("from PIL import Image\nimport pillow", Language::Python);
        assert_eq!(deps.as_slice(), ["pillow".to_string()]);
    }

    #[test]
    fn test_first_occurrence_order_is_kept() {
        let deps = detect("import zlib\nimport b_pkg\nimport a_pkg\nimport b_pkg", Language::Python);
        assert_eq!(deps.as_slice(), ["b_pkg".to_string(), "a_pkg".to_string()]);
    }

    #[test]
    fn test_set_equality_ignores_order() {
        assert_eq!(set(&["a", "b"]), set(&["b", "a"]));
        assert_ne!(set(&["a"]), set(&["a", "b"]));
    }

    #[test]
    fn test_empty_source_yields_empty_set() {
        for lang in Language::ALL {
            let deps = detect("", lang);
            assert!(deps.is_empty());
        }
    }

    #[test]
    fn test_scoped_package_keeps_both_segments() {
        let deps = detect("import x from '@org/pkg';", Language::NodeJs);
        assert_eq!(deps.as_slice(), ["@org/pkg".to_string()]);
        assert!(!deps.contains("@org"));
    }

    #[test]
    fn test_serializes_as_plain_list() {
        let deps = set(&["requests", "numpy"]);
        assert_eq!(
            serde_json::to_string(&deps).unwrap(),
            r#"["requests","numpy"]"#
        );
    }
}
