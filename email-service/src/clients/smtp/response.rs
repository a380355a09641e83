use super::error::SmtpError;

/// One line of a possibly multi-line reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    pub code: u16,
    pub is_last: bool,
    pub message: String,
}

/// A complete SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    pub fn message(&self) -> String {
        self.lines.join(" ")
    }

    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    pub const fn is_error(&self) -> bool {
        self.code >= 400 && self.code < 600
    }

    /// Whether an EHLO reply advertises `keyword`.
    pub fn has_extension(&self, keyword: &str) -> bool {
        self.lines.iter().skip(1).any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|word| word.eq_ignore_ascii_case(keyword))
        })
    }

    pub fn parse_line(line: &str) -> Result<ResponseLine, SmtpError> {
        let code_str = line
            .get(..3)
            .ok_or_else(|| SmtpError::Protocol(format!("response line too short: '{line}'")))?;

        let code = code_str
            .parse::<u16>()
            .map_err(|_| SmtpError::Protocol(format!("invalid status code: '{code_str}'")))?;

        let is_last = match line.as_bytes().get(3) {
            None | Some(b' ') => true,
            Some(b'-') => false,
            Some(c) => {
                return Err(SmtpError::Protocol(format!(
                    "invalid separator character: '{}'",
                    *c as char
                )));
            }
        };

        Ok(ResponseLine {
            code,
            is_last,
            message: line.get(4..).unwrap_or_default().to_string(),
        })
    }

    /// Parses one reply from the front of `buffer`.
    ///
    /// Returns the reply and the number of bytes consumed, or `None` when more
    /// data is needed.
    pub fn parse_response(buffer: &[u8]) -> Result<Option<(Self, usize)>, SmtpError> {
        let mut lines = Vec::new();
        let mut consumed = 0;
        let mut first_code = None;

        while let Some(end) = buffer[consumed..].iter().position(|b| *b == b'\n') {
            let raw = &buffer[consumed..consumed + end];
            consumed += end + 1;

            let text = std::str::from_utf8(raw)
                .map_err(|e| SmtpError::Protocol(format!("invalid UTF-8: {e}")))?
                .trim_end_matches('\r');

            if text.is_empty() {
                continue;
            }

            let line = Self::parse_line(text)?;

            match first_code {
                Some(code) if code != line.code => {
                    return Err(SmtpError::Protocol(format!(
                        "status code mismatch in multi-line response: expected {code}, got {}",
                        line.code
                    )));
                }
                Some(_) => {}
                None => first_code = Some(line.code),
            }

            lines.push(line.message);

            if line.is_last {
                return Ok(Some((Self::new(line.code, lines), consumed)));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_line() {
        assert_eq!(
            Response::parse_line("220 mail.example.com ESMTP").unwrap(),
            ResponseLine {
                code: 220,
                is_last: true,
                message: "mail.example.com ESMTP".to_string(),
            }
        );
    }

    #[test]
    fn parses_continuation_marker() {
        let line = Response::parse_line("250-mail.example.com").unwrap();
        assert!(!line.is_last);
        assert_eq!(line.code, 250);
    }

    #[test]
    fn parses_multi_line_reply() {
        let data = b"250-mail.example.com\r\n250-STARTTLS\r\n250 AUTH PLAIN\r\n";
        let (response, consumed) = Response::parse_response(data).unwrap().unwrap();

        assert_eq!(response.code, 250);
        assert_eq!(
            response.lines,
            vec!["mail.example.com", "STARTTLS", "AUTH PLAIN"]
        );
        assert_eq!(consumed, data.len());
        assert!(response.has_extension("starttls"));
        assert!(response.has_extension("AUTH"));
        assert!(!response.has_extension("mail.example.com"));
    }

    #[test]
    fn leaves_trailing_bytes_unconsumed() {
        let data = b"250 OK\r\n354 go ahead\r\n";
        let (response, consumed) = Response::parse_response(data).unwrap().unwrap();

        assert_eq!(response.code, 250);
        assert_eq!(consumed, 8);
    }

    #[test]
    fn waits_for_more_data() {
        assert!(Response::parse_response(b"250-mail.example.com\r\n250-SIZE").unwrap().is_none());
        assert!(Response::parse_response(b"").unwrap().is_none());
    }

    #[test]
    fn rejects_garbage() {
        assert!(Response::parse_response(b"hello\r\n").is_err());
        assert!(Response::parse_response(b"250-a\r\n251 b\r\n").is_err());
        assert!(Response::parse_line("250*x").is_err());
    }
}
