//! RFC 5322 / MIME assembly of an [`OutgoingEmail`].

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::OutgoingEmail;

const BASE64_LINE_LEN: usize = 76;
const MAX_LINE_LEN: usize = 998;
// Raw bytes per RFC 2047 encoded-word; keeps each word within 75 characters.
const ENCODED_WORD_CHUNK: usize = 45;
// Encoded characters per RFC 2231 parameter section.
const PARAM_SECTION_LEN: usize = 60;

/// Assembles the DATA payload with a fresh boundary and the current date.
pub fn assemble(email: &OutgoingEmail) -> String {
    let boundary = format!("=_email_{}", Uuid::new_v4().simple());
    assemble_with(email, &boundary, Utc::now())
}

/// Deterministic assembly: same inputs give byte-identical output.
pub fn assemble_with(email: &OutgoingEmail, boundary: &str, date: DateTime<Utc>) -> String {
    let mut out = String::new();

    push_header(&mut out, "From", &email.from);
    push_header(&mut out, "To", &email.to.join(", "));
    if !email.cc.is_empty() {
        push_header(&mut out, "Cc", &email.cc.join(", "));
    }
    push_header(&mut out, "Subject", &encode_header_value(&email.subject));
    push_header(&mut out, "Date", &date.to_rfc2822());
    push_header(
        &mut out,
        "Message-ID",
        &format!("<{}@{}>", email.send_id, domain_of(&email.from)),
    );
    push_header(&mut out, "MIME-Version", "1.0");

    if email.attachments.is_empty() {
        push_text_part(&mut out, &email.content_type, &email.body);
        return out;
    }

    push_header(
        &mut out,
        "Content-Type",
        &format!("multipart/mixed; boundary=\"{}\"", boundary),
    );
    out.push_str("\r\n");

    out.push_str(&format!("--{}\r\n", boundary));
    push_text_part(&mut out, &email.content_type, &email.body);

    for attachment in &email.attachments {
        out.push_str(&format!("--{}\r\n", boundary));
        push_header(
            &mut out,
            "Content-Type",
            &format!(
                "{}; {}",
                attachment.content_type,
                encode_param("name", &attachment.filename)
            ),
        );
        push_header(
            &mut out,
            "Content-Disposition",
            &format!("attachment; {}", encode_param("filename", &attachment.filename)),
        );
        push_header(&mut out, "Content-Transfer-Encoding", "base64");
        out.push_str("\r\n");
        push_base64(&mut out, &attachment.content);
    }

    out.push_str(&format!("--{}--\r\n", boundary));
    out
}

fn push_header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push_str("\r\n");
}

/// Headers plus body of a single text part, terminated by CRLF.
fn push_text_part(out: &mut String, content_type: &str, body: &str) {
    let body = normalize_newlines(body);
    let seven_bit = body.is_ascii() && body.split("\r\n").all(|line| line.len() <= MAX_LINE_LEN);

    push_header(
        out,
        "Content-Type",
        &format!("{}; charset=UTF-8", content_type),
    );

    if seven_bit {
        push_header(out, "Content-Transfer-Encoding", "7bit");
        out.push_str("\r\n");
        out.push_str(&body);
        if !body.ends_with("\r\n") {
            out.push_str("\r\n");
        }
    } else {
        push_header(out, "Content-Transfer-Encoding", "base64");
        out.push_str("\r\n");
        push_base64(out, body.as_bytes());
    }
}

fn push_base64(out: &mut String, bytes: &[u8]) {
    let encoded = STANDARD.encode(bytes);
    // Base64 output is ASCII, so byte chunks are valid UTF-8.
    for chunk in encoded.as_bytes().chunks(BASE64_LINE_LEN) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push_str("\r\n");
    }
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n").replace('\n', "\r\n")
}

/// RFC 2047 `B` encoding for non-ASCII header values.
fn encode_header_value(value: &str) -> String {
    if value.is_ascii() {
        return value.to_string();
    }

    let mut words = Vec::new();
    let mut chunk = String::new();
    for c in value.chars() {
        if chunk.len() + c.len_utf8() > ENCODED_WORD_CHUNK {
            words.push(format!("=?UTF-8?B?{}?=", STANDARD.encode(chunk.as_bytes())));
            chunk.clear();
        }
        chunk.push(c);
    }
    if !chunk.is_empty() {
        words.push(format!("=?UTF-8?B?{}?=", STANDARD.encode(chunk.as_bytes())));
    }

    words.join("\r\n ")
}

/// Quoted parameter for plain ASCII values, RFC 2231 `UTF-8''` form otherwise.
fn encode_param(key: &str, value: &str) -> String {
    let plain = value.is_ascii() && !value.chars().any(|c| c.is_ascii_control());
    if plain && value.len() <= PARAM_SECTION_LEN {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        return format!("{}=\"{}\"", key, escaped);
    }

    let mut sections = Vec::new();
    let mut section = String::new();
    for byte in value.bytes() {
        let encoded = if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            (byte as char).to_string()
        } else {
            format!("%{:02X}", byte)
        };
        if section.len() + encoded.len() > PARAM_SECTION_LEN {
            sections.push(std::mem::take(&mut section));
        }
        section.push_str(&encoded);
    }
    sections.push(section);

    if sections.len() == 1 {
        return format!("{}*=UTF-8''{}", key, sections[0]);
    }

    sections
        .iter()
        .enumerate()
        .map(|(index, section)| match index {
            0 => format!("{}*0*=UTF-8''{}", key, section),
            _ => format!("{}*{}*={}", key, index, section),
        })
        .collect::<Vec<_>>()
        .join(";\r\n ")
}

fn domain_of(address: &str) -> &str {
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain)
        .filter(|domain| !domain.is_empty())
        .unwrap_or("localhost")
}
