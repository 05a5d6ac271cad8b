//! Line-oriented text format for persistent entries.
//!
//! One entry per line, `<type> "<name>"=<value>`, under a fixed header.
//! The format is meant to be hand-editable: malformed lines are
//! reported as warnings with their line number and skipped, never
//! fatal.

use bytes::Bytes;
use nettable_core::Value;

use crate::error::PersistError;

/// First line of every persistence file.
pub const FILE_HEADER: &str = "[nettable storage 3.0]";

/// Serialize entries (already filtered to persistent, sorted by name)
/// into file text.
pub fn serialize(entries: &[(String, Value)]) -> String {
    let mut out = String::with_capacity(64 * (entries.len() + 1));
    out.push_str(FILE_HEADER);
    out.push('\n');
    for (name, value) in entries {
        out.push_str(type_keyword(value));
        out.push(' ');
        write_quoted(&mut out, name);
        out.push('=');
        write_value(&mut out, value);
        out.push('\n');
    }
    out
}

/// Parse file text into entries plus per-line warnings.
pub fn parse(text: &str) -> Result<(Vec<(String, Value)>, Vec<(usize, String)>), PersistError> {
    let mut lines = text.lines().enumerate();
    match lines.next() {
        Some((_, header)) if header.trim() == FILE_HEADER => {}
        _ => return Err(PersistError::BadHeader),
    }

    let mut entries = Vec::new();
    let mut warnings = Vec::new();
    for (idx, line) in lines {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        // line numbers are 1-based for humans
        match parse_line(line) {
            Ok(entry) => entries.push(entry),
            Err(msg) => warnings.push((idx + 1, msg)),
        }
    }
    Ok((entries, warnings))
}

fn type_keyword(value: &Value) -> &'static str {
    match value {
        Value::Boolean(_) => "boolean",
        Value::Double(_) => "double",
        Value::Str(_) => "string",
        Value::Raw(_) => "raw",
        Value::Rpc(_) => "rpc",
        Value::BooleanArray(_) => "array boolean",
        Value::DoubleArray(_) => "array double",
        Value::StringArray(_) => "array string",
    }
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Double(d) => out.push_str(&format_double(*d)),
        Value::Str(s) => write_quoted(out, s),
        Value::Raw(bytes) | Value::Rpc(bytes) => out.push_str(&hex::encode(bytes)),
        Value::BooleanArray(items) => {
            join(out, items.len(), |out, i| {
                out.push_str(if items[i] { "true" } else { "false" })
            });
        }
        Value::DoubleArray(items) => {
            join(out, items.len(), |out, i| out.push_str(&format_double(items[i])));
        }
        Value::StringArray(items) => {
            join(out, items.len(), |out, i| write_quoted(out, &items[i]));
        }
    }
}

fn format_double(d: f64) -> String {
    format!("{}", d)
}

fn join(out: &mut String, len: usize, mut f: impl FnMut(&mut String, usize)) {
    for i in 0..len {
        if i > 0 {
            out.push(',');
        }
        f(out, i);
    }
}

fn write_quoted(out: &mut String, s: &str) {
    out.push('"');
    for byte in s.bytes() {
        match byte {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(byte as char),
            other => out.push_str(&format!("\\x{:02x}", other)),
        }
    }
    out.push('"');
}

fn parse_line(line: &str) -> Result<(String, Value), String> {
    let (keyword, rest) = split_keyword(line)?;
    let rest = rest.trim_start();
    let (name, rest) = parse_quoted(rest)?;
    let rest = rest
        .strip_prefix('=')
        .ok_or_else(|| "expected '=' after entry name".to_owned())?;
    let value = parse_value(keyword, rest.trim())?;
    Ok((name, value))
}

fn split_keyword(line: &str) -> Result<(&str, &str), String> {
    for keyword in [
        "array boolean",
        "array double",
        "array string",
        "boolean",
        "double",
        "string",
        "raw",
        "rpc",
    ] {
        if let Some(rest) = line.strip_prefix(keyword) {
            if rest.starts_with(' ') {
                return Ok((keyword, rest));
            }
        }
    }
    Err(format!("unrecognized entry type in '{}'", line))
}

fn parse_value(keyword: &str, text: &str) -> Result<Value, String> {
    match keyword {
        "boolean" => parse_bool(text).map(Value::Boolean),
        "double" => parse_double(text).map(Value::Double),
        "string" => {
            let (s, rest) = parse_quoted(text)?;
            expect_end(rest)?;
            Ok(Value::Str(s))
        }
        "raw" => parse_hex(text).map(Value::Raw),
        "rpc" => parse_hex(text).map(Value::Rpc),
        "array boolean" => split_elements(text)?
            .iter()
            .map(|e| parse_bool(e))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::BooleanArray),
        "array double" => split_elements(text)?
            .iter()
            .map(|e| parse_double(e))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::DoubleArray),
        "array string" => {
            let mut items = Vec::new();
            let mut rest = text.trim();
            while !rest.is_empty() {
                let (s, tail) = parse_quoted(rest)?;
                items.push(s);
                rest = tail.trim_start();
                if let Some(tail) = rest.strip_prefix(',') {
                    rest = tail.trim_start();
                } else if !rest.is_empty() {
                    return Err("expected ',' between string elements".to_owned());
                }
            }
            Ok(Value::StringArray(items))
        }
        _ => unreachable!("split_keyword only yields known keywords"),
    }
}

fn parse_bool(text: &str) -> Result<bool, String> {
    match text.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(format!("'{}' is not a boolean", other)),
    }
}

fn parse_double(text: &str) -> Result<f64, String> {
    text.trim()
        .parse::<f64>()
        .map_err(|_| format!("'{}' is not a double", text.trim()))
}

fn parse_hex(text: &str) -> Result<Bytes, String> {
    hex::decode(text.trim())
        .map(Bytes::from)
        .map_err(|_| format!("'{}' is not a hex blob", text.trim()))
}

fn split_elements(text: &str) -> Result<Vec<&str>, String> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    Ok(text.split(',').collect())
}

fn expect_end(rest: &str) -> Result<(), String> {
    if rest.trim().is_empty() {
        Ok(())
    } else {
        Err(format!("trailing garbage '{}'", rest.trim()))
    }
}

/// Parse one double-quoted, backslash-escaped string. Returns the
/// string and the unconsumed tail.
fn parse_quoted(text: &str) -> Result<(String, &str), String> {
    let rest = text
        .strip_prefix('"')
        .ok_or_else(|| "expected opening '\"'".to_owned())?;
    // \xNN escapes carry raw UTF-8 bytes, so the string is assembled
    // as bytes and validated once at the closing quote
    let mut out = Vec::new();
    let mut chars = rest.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => {
                let s = String::from_utf8(out)
                    .map_err(|_| "string is not valid UTF-8".to_owned())?;
                return Ok((s, &rest[i + 1..]));
            }
            '\\' => match chars.next() {
                Some((_, '"')) => out.push(b'"'),
                Some((_, '\\')) => out.push(b'\\'),
                Some((_, 'n')) => out.push(b'\n'),
                Some((_, 't')) => out.push(b'\t'),
                Some((j, 'x')) => {
                    let hex_digits = rest.get(j + 1..j + 3).ok_or("truncated \\x escape")?;
                    let byte = u8::from_str_radix(hex_digits, 16)
                        .map_err(|_| format!("bad \\x escape '{}'", hex_digits))?;
                    out.push(byte);
                    chars.next();
                    chars.next();
                }
                Some((_, other)) => return Err(format!("unknown escape '\\{}'", other)),
                None => return Err("dangling backslash".to_owned()),
            },
            other => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    Err("unterminated string".to_owned())
}
