//! Reads the `skb/kfree_skb` tracepoint format so the drop observer uses the
//! running kernel's record offsets and drop-reason names.

use std::{collections::HashMap, fs, path::Path};

use netwatch_common::DropHookLayout;

use crate::{
    error::{Error, Result},
    reasons::DropReasons,
};

const FORMAT_PATH: &str = "events/skb/kfree_skb/format";
const REASON_SYMBOLS: &str = "__print_symbolic(REC->reason,";
const POINTER_SIZE: u32 = std::mem::size_of::<usize>() as u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldSpec {
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Default)]
pub struct TraceFormat {
    fields: HashMap<String, FieldSpec>,
    pub reasons: DropReasons,
}

impl TraceFormat {
    pub fn field(&self, name: &str) -> Option<FieldSpec> {
        self.fields.get(name).copied()
    }

    /// Overrides the tracepoint offsets in `layout`. Returns the names of
    /// the fields the format did not describe, or described with a size the
    /// drop observer does not read.
    pub fn apply(&self, layout: &mut DropHookLayout) -> Vec<&'static str> {
        let mut missing = Vec::new();
        for (name, size, slot) in [
            ("skbaddr", POINTER_SIZE, &mut layout.tp_skbaddr),
            ("protocol", 2, &mut layout.tp_protocol),
            ("reason", 4, &mut layout.tp_reason),
        ] {
            match self.field(name) {
                Some(field) if field.size == size => *slot = field.offset,
                _ => missing.push(name),
            }
        }
        missing
    }
}

pub fn read(tracefs: &Path) -> Result<TraceFormat> {
    let text = fs::read_to_string(tracefs.join(FORMAT_PATH))?;
    parse(&text)
}

pub fn parse(text: &str) -> Result<TraceFormat> {
    let mut format = TraceFormat::default();

    for line in text.lines() {
        let line = line.trim();
        if line.starts_with("field:") {
            let (name, field) = parse_field(line)?;
            format.fields.insert(name, field);
        } else if let Some(fmt) = line.strip_prefix("print fmt:") {
            format.reasons = parse_symbols(fmt);
        }
    }

    if format.fields.is_empty() {
        return Err(Error::TraceFormat("no fields".to_string()));
    }
    Ok(format)
}

// field:void * skbaddr;	offset:8;	size:8;	signed:0;
fn parse_field(line: &str) -> Result<(String, FieldSpec)> {
    let malformed = || Error::TraceFormat(line.to_string());
    let mut parts = line.split(';').map(str::trim);

    let decl = parts
        .next()
        .and_then(|p| p.strip_prefix("field:"))
        .ok_or_else(malformed)?;
    let name = decl
        .rsplit([' ', '*'])
        .next()
        .map(|n| n.split('[').next().unwrap_or(n))
        .filter(|n| !n.is_empty())
        .ok_or_else(malformed)?;

    let mut offset = None;
    let mut size = None;
    for part in parts {
        if let Some(v) = part.strip_prefix("offset:") {
            offset = v.parse::<u32>().ok();
        } else if let Some(v) = part.strip_prefix("size:") {
            size = v.parse::<u32>().ok();
        }
    }

    match (offset, size) {
        (Some(offset), Some(size)) => Ok((name.to_string(), FieldSpec { offset, size })),
        _ => Err(malformed()),
    }
}

// __print_symbolic(REC->reason, { 2, "NOT_SPECIFIED" }, { 3, "NO_SOCKET" }, ...)
fn parse_symbols(fmt: &str) -> DropReasons {
    let mut reasons = Vec::new();
    let Some(start) = fmt.find(REASON_SYMBOLS) else {
        return DropReasons::default();
    };

    let mut rest = &fmt[start + REASON_SYMBOLS.len()..];
    while let Some(open) = rest.find('{') {
        if rest.find(')').is_some_and(|close| close < open) {
            break;
        }
        let Some(close) = rest[open..].find('}') else {
            break;
        };
        let entry = &rest[open + 1..open + close];
        if let Some((code, name)) = entry.split_once(',') {
            if let Ok(code) = code.trim().parse::<u32>() {
                reasons.push((code, name.trim().trim_matches('"').to_string()));
            }
        }
        rest = &rest[open + close + 1..];
    }
    reasons.into_iter().collect()
}
