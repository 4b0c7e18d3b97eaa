use crate::error::{EngineError, Result};

/// An HL7 message as a sequence of `\r`-terminated segments (terminator
/// not stored).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub segments: Vec<String>,
}

impl Message {
    pub fn msh(&self) -> Option<&str> {
        self.segments.iter().find(|s| s.starts_with("MSH")).map(|s| s.as_str())
    }
}

/// Normalizes segment terminators to `\r`, tolerating `\r\n` and bare
/// `\n` input without ever introducing `\n` into the result.
pub fn normalize(text: &str) -> String {
    text.replace("\r\n", "\r").replace('\n', "\r")
}

/// Derives the field separator (4th byte of the segment) and repetition
/// separator (2nd byte of the encoding-characters field, MSH-2), with
/// `|`/`~` defaults. Shared by the HL7 codec and the WRAPI engine.
pub fn derive_separators(msh_segment: &str) -> (char, char) {
    let bytes = msh_segment.as_bytes();
    let field_sep = bytes.get(3).copied().unwrap_or(b'|') as char;
    let tokens: Vec<&str> = msh_segment.split(field_sep).collect();
    let rep_sep = tokens
        .get(1)
        .and_then(|enc| enc.as_bytes().get(1))
        .copied()
        .unwrap_or(b'~') as char;
    (field_sep, rep_sep)
}

/// Splits `text` into segments, normalizing terminators, and validates
/// the first segment is `MSH`.
pub fn parse(text: &str) -> Result<Message> {
    let normalized = normalize(text);
    let segments: Vec<String> = normalized
        .split('\r')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();

    if segments.is_empty() {
        return Err(EngineError::Parse("empty HL7 message".to_string()));
    }
    if !segments[0].starts_with("MSH") {
        return Err(EngineError::Parse(
            "message does not begin with an MSH segment".to_string(),
        ));
    }
    Ok(Message { segments })
}

/// Re-joins segments with `\r`, CR-terminated.
pub fn encode(msg: &Message) -> String {
    let mut out = String::with_capacity(msg.segments.iter().map(|s| s.len() + 1).sum());
    for seg in &msg.segments {
        out.push_str(seg);
        out.push('\r');
    }
    out
}

/// Builds a new `MSH`+`MSA` message acknowledging `msg`: `MSA-1 = AA`,
/// `MSA-2` echoes the source's `MSH-10`, sending/receiving
/// application-facility pairs swapped.
pub fn generate_ack(msg: &Message) -> Result<Message> {
    let msh = msg
        .msh()
        .ok_or_else(|| EngineError::Parse("no MSH segment to acknowledge".to_string()))?;

    let (field_sep, _rep_sep) = derive_separators(msh);
    let tokens: Vec<&str> = msh.split(field_sep).collect();

    let encoding_chars = tokens.get(1).copied().unwrap_or("^~\\&");
    let sending_app = tokens.get(2).copied().unwrap_or("");
    let sending_fac = tokens.get(3).copied().unwrap_or("");
    let receiving_app = tokens.get(4).copied().unwrap_or("");
    let receiving_fac = tokens.get(5).copied().unwrap_or("");
    let control_id = tokens.get(9).copied().unwrap_or("");

    let now = chrono::Utc::now();
    let ts = now.format("%Y%m%d%H%M%S").to_string();
    let ack_id = format!("ACK-{}", now.format("%Y%m%d%H%M%S%3f"));

    let sep = field_sep;
    let new_msh = format!(
        "MSH{sep}{encoding_chars}{sep}{receiving_app}{sep}{receiving_fac}{sep}{sending_app}{sep}{sending_fac}{sep}{ts}{sep}{sep}ACK{sep}{ack_id}{sep}P{sep}2.5"
    );
    let new_msa = format!("MSA{sep}AA{sep}{control_id}");

    Ok(Message {
        segments: vec![new_msh, new_msa],
    })
}

/// Synthesizes a textual fallback ACK when `generate_ack` cannot run
/// (parse failure) or the frame was empty. `reason` is one of
/// `"EMPTY"` / `"PARSEFAIL"`.
pub fn fallback_ack(original: &str, reason: &str) -> String {
    let now = chrono::Utc::now();
    let ts = now.format("%Y%m%d%H%M%S").to_string();
    let ack_id = format!("ACK-{}", now.format("%Y%m%d%H%M%S%3f"));
    let control_id = extract_control_id(original).unwrap_or_else(|| "UNKNOWN".to_string());

    format!(
        "MSH|^~\\&|LOCALBRIDGE|ENGINE|||{ts}||ACK^A01|{ack_id}|P|2.5\rMSA|AA|{control_id}|{reason}\r"
    )
}

fn extract_control_id(original: &str) -> Option<String> {
    let normalized = normalize(original);
    let first_segment = normalized.split('\r').next()?;
    if !first_segment.starts_with("MSH") {
        return None;
    }
    let (field_sep, _) = derive_separators(first_segment);
    let tokens: Vec<&str> = first_segment.split(field_sep).collect();
    tokens
        .get(9)
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "MSH|^~\\&|S|F|D|F|20250101010101||ADT^A01|MSG001|P|2.5\rPID|1||123^^^H~456^^^H||DOE^JOHN\r";

    #[test]
    fn parses_segments() {
        let msg = parse(SAMPLE).unwrap();
        assert_eq!(msg.segments.len(), 2);
        assert!(msg.segments[0].starts_with("MSH"));
        assert!(msg.segments[1].starts_with("PID"));
    }

    #[test]
    fn rejects_message_without_msh() {
        assert!(parse("PID|1||123\r").is_err());
    }

    #[test]
    fn normalizes_crlf_and_bare_lf() {
        let msg = parse("MSH|^~\\&|A\r\nPID|1\n").unwrap();
        assert_eq!(msg.segments, vec!["MSH|^~\\&|A".to_string(), "PID|1".to_string()]);
    }

    #[test]
    fn encode_is_cr_terminated() {
        let msg = parse(SAMPLE).unwrap();
        let text = encode(&msg);
        assert!(text.ends_with('\r'));
        assert!(!text.contains('\n'));
    }

    #[test]
    fn generate_ack_echoes_control_id_and_swaps_apps() {
        let msg = parse(SAMPLE).unwrap();
        let ack = generate_ack(&msg).unwrap();
        let msa = ack.segments[1].clone();
        assert!(msa.starts_with("MSA|AA|MSG001"));
        assert!(ack.segments[0].contains("|D|F|S|F|"));
    }

    #[test]
    fn fallback_ack_matches_literal_template() {
        let text = fallback_ack(SAMPLE, "PARSEFAIL");
        assert!(text.starts_with("MSH|^~\\&|LOCALBRIDGE|ENGINE|||"));
        assert!(text.contains("MSA|AA|MSG001|PARSEFAIL"));
        assert!(text.ends_with('\r'));
    }

    #[test]
    fn fallback_ack_uses_unknown_when_control_id_missing() {
        let text = fallback_ack("not hl7 at all", "EMPTY");
        assert!(text.contains("MSA|AA|UNKNOWN|EMPTY"));
    }
}
