//! WRAPI: the line-oriented micro-DSL that drives per-message HL7 edits.
//!
//! A script is parsed once into a command list and replayed against every
//! message a channel handles. Every mutation works on the encoded segment
//! strings directly rather than a structural AST, since HL7 has no single
//! stable grammar to build one against.

use crate::error::{EngineError, Result};
use crate::hl7;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Path {
    seg: String,
    occurrence: usize,
    field: usize,
    component: Option<usize>,
    subcomponent: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Set {
        seg: String,
        field: usize,
        literal: String,
    },
    Copy {
        from: Path,
        to: Path,
    },
    Clear {
        seg: String,
        field: usize,
    },
    DelSeg {
        seg: String,
    },
    TruncSeg {
        seg: String,
        n: usize,
    },
    TruncField {
        seg: String,
        field: usize,
        n: usize,
    },
    AddSeg {
        anchor: Option<String>,
        text: String,
    },
}

/// A parsed WRAPI script, ready to run against any number of messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapiScript {
    commands: Vec<Command>,
}

impl WrapiScript {
    /// Parses `source`: trims lines, skips blanks and `#` comments, and
    /// stops at the first `SAVE` line. A syntax error here fails channel
    /// start.
    pub fn parse(source: &str) -> Result<Self> {
        let mut commands = Vec::new();
        for raw_line in source.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.to_ascii_uppercase().starts_with("SAVE") {
                break;
            }
            commands.push(parse_command(line)?);
        }
        Ok(Self { commands })
    }

    /// Executes every command against `msg` in order, returning the
    /// transformed message. `create_missing` comes from
    /// `TranslateConfig.transformer.createMissing` and only affects `SET`.
    pub fn apply(&self, msg: &hl7::Message, create_missing: bool) -> hl7::Message {
        let mut segments = msg.segments.clone();
        let field_sep = segments
            .first()
            .map(|msh| hl7::derive_separators(msh).0)
            .unwrap_or('|');
        let rep_sep = segments
            .first()
            .map(|msh| hl7::derive_separators(msh).1)
            .unwrap_or('~');

        for cmd in &self.commands {
            match cmd {
                Command::Set { seg, field, literal } => {
                    exec_set(&mut segments, field_sep, seg, *field, literal, create_missing)
                }
                Command::Copy { from, to } => exec_copy(&mut segments, field_sep, from, to),
                Command::Clear { seg, field } => exec_clear(&mut segments, field_sep, seg, *field),
                Command::DelSeg { seg } => exec_delseg(&mut segments, seg),
                Command::TruncSeg { seg, n } => exec_trunc_seg(&mut segments, seg, *n),
                Command::TruncField { seg, field, n } => {
                    exec_trunc_field(&mut segments, field_sep, rep_sep, seg, *field, *n)
                }
                Command::AddSeg { anchor, text } => {
                    exec_addseg(&mut segments, anchor.as_deref(), text)
                }
            }
        }

        hl7::Message { segments }
    }
}

fn segment_id(segment: &str) -> String {
    segment.get(0..3).unwrap_or("").to_ascii_uppercase()
}

/// MSH field 1 is the separator itself (no token); MSH field n>=2 maps to
/// token index n-1. Every other segment's field n maps to token index n
/// (index 0 is the segment ID).
fn field_token_index(seg_id: &str, field: usize) -> Option<usize> {
    if seg_id.eq_ignore_ascii_case("MSH") {
        if field < 2 {
            None
        } else {
            Some(field - 1)
        }
    } else {
        Some(field)
    }
}

fn nth_segment<'a>(segments: &'a [String], seg: &str, occurrence: usize) -> Option<&'a String> {
    let target = seg.to_ascii_uppercase();
    segments
        .iter()
        .filter(|s| segment_id(s) == target)
        .nth(occurrence.saturating_sub(1))
}

fn set_field(segment: &str, field_sep: char, field: usize, literal: &str) -> String {
    let seg_id = segment_id(segment);
    let mut tokens: Vec<String> = segment.split(field_sep).map(|t| t.to_string()).collect();
    if let Some(idx) = field_token_index(&seg_id, field) {
        while tokens.len() <= idx {
            tokens.push(String::new());
        }
        tokens[idx] = literal.to_string();
    }
    tokens.join(&field_sep.to_string())
}

fn build_segment(field_sep: char, seg: &str, field: usize, literal: &str) -> String {
    let seg_upper = seg.to_ascii_uppercase();
    let mut tokens = vec![seg_upper.clone()];
    if let Some(idx) = field_token_index(&seg_upper, field) {
        while tokens.len() <= idx {
            tokens.push(String::new());
        }
        tokens[idx] = literal.to_string();
    }
    tokens.join(&field_sep.to_string())
}

fn exec_set(
    segments: &mut Vec<String>,
    field_sep: char,
    seg: &str,
    field: usize,
    literal: &str,
    create_missing: bool,
) {
    let target = seg.to_ascii_uppercase();
    let mut found = false;
    for s in segments.iter_mut() {
        if segment_id(s) == target {
            found = true;
            *s = set_field(s, field_sep, field, literal);
        }
    }
    if !found && create_missing {
        segments.push(build_segment(field_sep, seg, field, literal));
    }
}

fn exec_clear(segments: &mut Vec<String>, field_sep: char, seg: &str, field: usize) {
    let target = seg.to_ascii_uppercase();
    for s in segments.iter_mut() {
        if segment_id(s) == target {
            *s = set_field(s, field_sep, field, "");
        }
    }
}

fn exec_delseg(segments: &mut Vec<String>, seg: &str) {
    let target = seg.to_ascii_uppercase();
    segments.retain(|s| segment_id(s) != target);
}

fn exec_trunc_seg(segments: &mut Vec<String>, seg: &str, n: usize) {
    let target = seg.to_ascii_uppercase();
    let mut seen = 0usize;
    segments.retain(|s| {
        if segment_id(s) == target {
            seen += 1;
            seen <= n
        } else {
            true
        }
    });
}

fn trunc_field_in_segment(segment: &str, field_sep: char, rep_sep: char, field: usize, n: usize) -> String {
    let seg_id = segment_id(segment);
    let mut tokens: Vec<String> = segment.split(field_sep).map(|t| t.to_string()).collect();
    if let Some(idx) = field_token_index(&seg_id, field) {
        if let Some(value) = tokens.get(idx) {
            let truncated: Vec<&str> = value.split(rep_sep).take(n).collect();
            tokens[idx] = truncated.join(&rep_sep.to_string());
        }
    }
    tokens.join(&field_sep.to_string())
}

fn exec_trunc_field(
    segments: &mut Vec<String>,
    field_sep: char,
    rep_sep: char,
    seg: &str,
    field: usize,
    n: usize,
) {
    let target = seg.to_ascii_uppercase();
    for s in segments.iter_mut() {
        if segment_id(s) == target {
            *s = trunc_field_in_segment(s, field_sep, rep_sep, field, n);
        }
    }
}

fn exec_addseg(segments: &mut Vec<String>, anchor: Option<&str>, text: &str) {
    segments.retain(|s| s != text);

    match anchor {
        Some(anchor_seg) => {
            let target = anchor_seg.to_ascii_uppercase();
            if let Some(pos) = segments.iter().position(|s| segment_id(s) == target) {
                segments.insert(pos + 1, text.to_string());
            }
        }
        None => segments.push(text.to_string()),
    }
}

fn get_value(segments: &[String], field_sep: char, path: &Path) -> Option<String> {
    let segment = nth_segment(segments, &path.seg, path.occurrence)?;
    let seg_id = segment_id(segment);
    let tokens: Vec<&str> = segment.split(field_sep).collect();
    let idx = field_token_index(&seg_id, path.field)?;
    let field_value = tokens.get(idx).copied().unwrap_or("").to_string();

    let after_component = match path.component {
        Some(c) => field_value
            .split('^')
            .nth(c.saturating_sub(1))
            .unwrap_or("")
            .to_string(),
        None => field_value,
    };

    let result = match path.subcomponent {
        Some(sc) => after_component
            .split('&')
            .nth(sc.saturating_sub(1))
            .unwrap_or("")
            .to_string(),
        None => after_component,
    };

    Some(result)
}

fn set_structured_field(segment: &str, field_sep: char, path: &Path, value: &str) -> Option<String> {
    let seg_id = segment_id(segment);
    let idx = field_token_index(&seg_id, path.field)?;
    let mut tokens: Vec<String> = segment.split(field_sep).map(|t| t.to_string()).collect();
    while tokens.len() <= idx {
        tokens.push(String::new());
    }

    let component = match path.component {
        None => {
            tokens[idx] = value.to_string();
            return Some(tokens.join(&field_sep.to_string()));
        }
        Some(c) => c,
    };

    let mut comps: Vec<String> = tokens[idx].split('^').map(|t| t.to_string()).collect();
    while comps.len() < component {
        comps.push(String::new());
    }

    match path.subcomponent {
        None => comps[component - 1] = value.to_string(),
        Some(sc) => {
            let mut subs: Vec<String> = comps[component - 1].split('&').map(|t| t.to_string()).collect();
            while subs.len() < sc {
                subs.push(String::new());
            }
            subs[sc - 1] = value.to_string();
            comps[component - 1] = subs.join("&");
        }
    }

    tokens[idx] = comps.join("^");
    Some(tokens.join(&field_sep.to_string()))
}

fn set_value(segments: &mut [String], field_sep: char, path: &Path, value: &str) -> bool {
    let target = path.seg.to_ascii_uppercase();
    let mut seen = 0usize;
    for s in segments.iter_mut() {
        if segment_id(s) == target {
            seen += 1;
            if seen == path.occurrence {
                return match set_structured_field(s, field_sep, path, value) {
                    Some(new_text) => {
                        *s = new_text;
                        true
                    }
                    None => false,
                };
            }
        }
    }
    false
}

fn exec_copy(segments: &mut Vec<String>, field_sep: char, from: &Path, to: &Path) {
    let value = match get_value(segments, field_sep, from) {
        Some(v) => v,
        None => {
            tracing::warn!(path = ?from, "WRAPI COPY source unreadable, skipping");
            return;
        }
    };
    if !set_value(segments, field_sep, to, &value) {
        tracing::warn!(path = ?to, "WRAPI COPY destination unwritable, skipping");
    }
}

fn parse_command(line: &str) -> Result<Command> {
    let (keyword, rest) = split_first_token(line);
    match keyword.to_ascii_uppercase().as_str() {
        "SET" => parse_set(rest),
        "COPY" => parse_copy(rest),
        "CLEAR" => parse_clear(rest),
        "DELSEG" => parse_delseg(rest),
        "TRUNC" => parse_trunc(rest),
        "ADDSEG" => parse_addseg(rest),
        other => Err(EngineError::Transform(format!(
            "unknown WRAPI command: {other}"
        ))),
    }
}

fn split_first_token(line: &str) -> (&str, &str) {
    match line.find(char::is_whitespace) {
        Some(idx) => (&line[..idx], line[idx..].trim_start()),
        None => (line, ""),
    }
}

fn extract_quoted(s: &str) -> Result<(&str, String)> {
    let start = s
        .find('"')
        .ok_or_else(|| EngineError::Transform(format!("expected quoted literal: {s}")))?;
    let after = &s[start + 1..];
    let end = after
        .find('"')
        .ok_or_else(|| EngineError::Transform(format!("unterminated literal: {s}")))?;
    Ok((&s[..start], after[..end].to_string()))
}

fn validate_seg_id(seg: &str, raw: &str) -> Result<()> {
    let valid = seg.len() == 3
        && seg.chars().next().map(|c| c.is_ascii_uppercase()).unwrap_or(false)
        && seg.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(EngineError::Transform(format!(
            "invalid segment id in path: {raw}"
        )))
    }
}

/// Parses the base path grammar `^[A-Z][A-Z0-9]{2}(-[0-9]+)?$`, used by
/// `SET`, `CLEAR`, and the field form of `TRUNC`.
fn parse_simple_path(raw: &str) -> Result<(String, usize)> {
    let s = raw.trim();
    let (seg, rest) = s.split_at(s.len().min(3));
    validate_seg_id(seg, raw)?;
    let field_str = rest.strip_prefix('-').unwrap_or(rest).trim();
    let field = if field_str.is_empty() {
        1
    } else {
        field_str
            .parse()
            .map_err(|_| EngineError::Transform(format!("bad field number in path: {raw}")))?
    };
    Ok((seg.to_ascii_uppercase(), field))
}

/// Parses the extended structured form `SEG(occ)-field-component-subcomponent`
/// used by `COPY`'s source/destination paths.
fn parse_struct_path(raw: &str) -> Result<Path> {
    let s = raw.trim();
    if s.len() < 3 {
        return Err(EngineError::Transform(format!("invalid path: {raw}")));
    }
    let (seg_part, mut rest) = s.split_at(3);
    validate_seg_id(seg_part, raw)?;

    let mut occurrence = 1usize;
    if let Some(after_paren) = rest.strip_prefix('(') {
        let close = after_paren
            .find(')')
            .ok_or_else(|| EngineError::Transform(format!("unterminated '(' in path: {raw}")))?;
        occurrence = after_paren[..close]
            .parse()
            .map_err(|_| EngineError::Transform(format!("bad occurrence in path: {raw}")))?;
        rest = &after_paren[close + 1..];
    }

    let rest = rest.strip_prefix('-').unwrap_or(rest);
    let mut parts = rest.split('-').filter(|p| !p.is_empty());
    let field = match parts.next() {
        Some(p) => p
            .parse()
            .map_err(|_| EngineError::Transform(format!("bad field in path: {raw}")))?,
        None => 1,
    };
    let component = parts
        .next()
        .map(|p| p.parse::<usize>())
        .transpose()
        .map_err(|_| EngineError::Transform(format!("bad component in path: {raw}")))?;
    let subcomponent = parts
        .next()
        .map(|p| p.parse::<usize>())
        .transpose()
        .map_err(|_| EngineError::Transform(format!("bad subcomponent in path: {raw}")))?;

    Ok(Path {
        seg: seg_part.to_ascii_uppercase(),
        occurrence,
        field,
        component,
        subcomponent,
    })
}

fn parse_set(rest: &str) -> Result<Command> {
    let (path_part, literal) = extract_quoted(rest)?;
    let (seg, field) = parse_simple_path(path_part.trim())?;
    Ok(Command::Set { seg, field, literal })
}

fn parse_clear(rest: &str) -> Result<Command> {
    let (seg, field) = parse_simple_path(rest.trim())?;
    Ok(Command::Clear { seg, field })
}

fn parse_delseg(rest: &str) -> Result<Command> {
    let seg = rest.trim();
    if seg.len() != 3 {
        return Err(EngineError::Transform(format!(
            "DELSEG expects a 3-char segment id: {rest}"
        )));
    }
    Ok(Command::DelSeg {
        seg: seg.to_ascii_uppercase(),
    })
}

fn parse_trunc(rest: &str) -> Result<Command> {
    let (path_part, n_part) = rest
        .split_once(',')
        .ok_or_else(|| EngineError::Transform(format!("expected 'SEG,n' or 'SEG-f,n': {rest}")))?;
    let n: usize = n_part
        .trim()
        .parse()
        .map_err(|_| EngineError::Transform(format!("bad count in TRUNC: {rest}")))?;

    let path_part = path_part.trim();
    if let Some((seg, field_str)) = path_part.split_once('-') {
        let field: usize = field_str
            .trim()
            .parse()
            .map_err(|_| EngineError::Transform(format!("bad field in TRUNC: {path_part}")))?;
        Ok(Command::TruncField {
            seg: seg.trim().to_ascii_uppercase(),
            field,
            n,
        })
    } else {
        Ok(Command::TruncSeg {
            seg: path_part.to_ascii_uppercase(),
            n,
        })
    }
}

fn parse_copy(rest: &str) -> Result<Command> {
    let (from, to) = rest
        .split_once("->")
        .ok_or_else(|| EngineError::Transform(format!("expected 'from -> to': {rest}")))?;
    Ok(Command::Copy {
        from: parse_struct_path(from.trim())?,
        to: parse_struct_path(to.trim())?,
    })
}

fn parse_addseg(rest: &str) -> Result<Command> {
    let trimmed = rest.trim_start();
    if trimmed.len() >= 5 && trimmed[..5].eq_ignore_ascii_case("after") {
        let after_rest = trimmed[5..].trim_start();
        let (seg_part, text) = extract_quoted(after_rest)?;
        Ok(Command::AddSeg {
            anchor: Some(seg_part.trim().to_ascii_uppercase()),
            text,
        })
    } else {
        let (_, text) = extract_quoted(trimmed)?;
        Ok(Command::AddSeg { anchor: None, text })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(segments: &[&str]) -> hl7::Message {
        hl7::Message {
            segments: segments.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Builds `"<id>|<fields[0]>|<fields[1]>|..."` so field-N assertions
    /// don't depend on hand-counted pipe runs.
    fn make_segment(id: &str, fields: &[&str]) -> String {
        let mut parts = vec![id.to_string()];
        parts.extend(fields.iter().map(|f| f.to_string()));
        parts.join("|")
    }

    #[test]
    fn delseg_removes_matching_segments_case_insensitively() {
        let script = WrapiScript::parse("DELSEG in1\nSAVE\n").unwrap();
        let out = script.apply(&msg(&["MSH|^~\\&|A", "IN1|1|X", "PID|1"]), false);
        assert_eq!(out.segments, vec!["MSH|^~\\&|A".to_string(), "PID|1".to_string()]);
    }

    #[test]
    fn clear_blanks_field_in_every_occurrence() {
        let script = WrapiScript::parse("CLEAR PID-5").unwrap();
        let out = script.apply(
            &msg(&["MSH|^~\\&|A", "PID|1||A||LAST^FIRST", "PID|2||B||OTHER^NAME"]),
            false,
        );
        assert_eq!(out.segments[1], "PID|1||A||");
        assert_eq!(out.segments[2], "PID|2||B||");
    }

    #[test]
    fn trunc_field_keeps_first_n_repetitions() {
        let script = WrapiScript::parse("TRUNC PID-13,2").unwrap();
        let pid_fields = [
            "1", "", "A", "", "B", "", "", "", "", "", "", "",
            "555-1^^^~555-2^^^~555-3^^^",
        ];
        let pid = make_segment("PID", &pid_fields);
        let out = script.apply(&msg(&["MSH|^~\\&|A", &pid]), false);

        let expected_fields = [
            "1", "", "A", "", "B", "", "", "", "", "", "", "",
            "555-1^^^~555-2^^^",
        ];
        assert_eq!(out.segments[1], make_segment("PID", &expected_fields));
    }

    #[test]
    fn trunc_segment_keeps_first_n_occurrences() {
        let script = WrapiScript::parse("TRUNC OBX,1").unwrap();
        let out = script.apply(&msg(&["MSH|^~\\&|A", "OBX|1|A", "OBX|2|B"]), false);
        assert_eq!(out.segments, vec!["MSH|^~\\&|A".to_string(), "OBX|1|A".to_string()]);
    }

    #[test]
    fn addseg_after_anchor_inserts_once() {
        let script = WrapiScript::parse("ADDSEG after PID \"NTE|1|OK\"").unwrap();
        let out = script.apply(&msg(&["MSH|^~\\&|A", "PID|1", "IN1|1"]), false);
        assert_eq!(
            out.segments,
            vec!["MSH|^~\\&|A".to_string(), "PID|1".to_string(), "NTE|1|OK".to_string(), "IN1|1".to_string()]
        );
    }

    #[test]
    fn addseg_without_anchor_appends_at_end() {
        let script = WrapiScript::parse("ADDSEG \"ZXT|1|OK\"").unwrap();
        let out = script.apply(&msg(&["MSH|^~\\&|A", "PID|1"]), false);
        assert_eq!(out.segments.last().unwrap(), "ZXT|1|OK");
    }

    #[test]
    fn addseg_is_idempotent_across_runs() {
        let script = WrapiScript::parse("ADDSEG after PID \"NTE|1|OK\"\nADDSEG \"ZXT|1|OK\"\nSAVE").unwrap();
        let once = script.apply(&msg(&["MSH|^~\\&|A", "PID|1"]), false);
        let twice = script.apply(&once, false);
        assert_eq!(
            twice.segments.iter().filter(|s| s.as_str() == "NTE|1|OK").count(),
            1
        );
        assert_eq!(
            twice.segments.iter().filter(|s| s.as_str() == "ZXT|1|OK").count(),
            1
        );
    }

    #[test]
    fn set_creates_missing_segment_when_allowed() {
        let script = WrapiScript::parse("SET ZZZ-2 \"value\"").unwrap();
        let out = script.apply(&msg(&["MSH|^~\\&|A"]), true);
        assert_eq!(out.segments.last().unwrap(), "ZZZ|value");
    }

    #[test]
    fn set_does_not_create_missing_segment_by_default() {
        let script = WrapiScript::parse("SET ZZZ-2 \"value\"").unwrap();
        let out = script.apply(&msg(&["MSH|^~\\&|A"]), false);
        assert_eq!(out.segments.len(), 1);
    }

    #[test]
    fn copy_moves_value_between_fields() {
        let script = WrapiScript::parse("COPY PID-5 -> PID-9").unwrap();
        let out = script.apply(&msg(&["MSH|^~\\&|A", "PID|1||A||LAST^FIRST"]), false);
        assert_eq!(out.segments[1], "PID|1||A||LAST^FIRST||||LAST^FIRST");
    }

    #[test]
    fn copy_skips_silently_when_source_missing() {
        let script = WrapiScript::parse("COPY ZZZ-2 -> PID-9").unwrap();
        let out = script.apply(&msg(&["MSH|^~\\&|A", "PID|1"]), false);
        assert_eq!(out.segments[1], "PID|1");
    }

    #[test]
    fn scenario_two_wrapi_pipeline_matches_spec_example() {
        let source = "DELSEG IN1\nCLEAR PID-5\nTRUNC PID-13,2\nADDSEG after PID \"NTE|1|OK\"\nADDSEG \"ZXT|1|OK\"\nSAVE";
        let script = WrapiScript::parse(source).unwrap();
        let pid_fields = [
            "1", "", "A", "", "LAST^FIRST", "", "", "", "", "", "", "",
            "555-1^^^~555-2^^^~555-3^^^",
        ];
        let pid = make_segment("PID", &pid_fields);
        let input = msg(&["MSH|^~\\&|A", &pid, "IN1|1|X"]);
        let out = script.apply(&input, false);

        let expected_fields = [
            "1", "", "A", "", "", "", "", "", "", "", "", "",
            "555-1^^^~555-2^^^",
        ];
        assert!(!out.segments.iter().any(|s| segment_id(s) == "IN1"));
        assert_eq!(out.segments[1], make_segment("PID", &expected_fields));
        assert_eq!(
            out.segments.iter().filter(|s| s.as_str() == "NTE|1|OK").count(),
            1
        );
        assert_eq!(out.segments.last().unwrap(), "ZXT|1|OK");
        assert_eq!(out.segments[2], "NTE|1|OK");
    }

    #[test]
    fn save_terminates_script_parsing() {
        let script = WrapiScript::parse("DELSEG PID\nSAVE\nDELSEG MSH").unwrap();
        let out = script.apply(&msg(&["MSH|^~\\&|A", "PID|1"]), false);
        assert_eq!(out.segments, vec!["MSH|^~\\&|A".to_string()]);
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let script = WrapiScript::parse("# a comment\n\nDELSEG PID\n").unwrap();
        let out = script.apply(&msg(&["MSH|^~\\&|A", "PID|1"]), false);
        assert_eq!(out.segments, vec!["MSH|^~\\&|A".to_string()]);
    }
}
