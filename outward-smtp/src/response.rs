//! SMTP reply parsing.

use outward_common::{EnhancedCode, Status};

use crate::error::{ClientError, Result};

/// A complete SMTP reply, possibly multi-line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// The reply code shared by every line.
    pub code: u16,
    /// The text of each line, without code and separator.
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// The reply text as a single string, lines joined by `\n`.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// A positive intermediate reply, e.g. the `354` go-ahead after DATA.
    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    #[must_use]
    pub const fn is_temporary_error(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    /// Whether an EHLO reply advertises the given capability keyword,
    /// bare or with parameters, case-insensitively. The first line is the
    /// server greeting and never a capability.
    #[must_use]
    pub fn has_capability(&self, name: &str) -> bool {
        let name = name.as_bytes();
        self.lines.iter().skip(1).any(|line| {
            let line = line.as_bytes();
            line.eq_ignore_ascii_case(name)
                || (line.len() > name.len()
                    && line[name.len()] == b' '
                    && line[..name.len()].eq_ignore_ascii_case(name))
        })
    }

    /// Converts the reply into a delivery [`Status`].
    ///
    /// Lines carrying an RFC 2034 enhanced status code contribute it and
    /// have it stripped from the text; replies without one get the generic
    /// triple for their code class. The resulting status reproduces the
    /// server's code and text exactly, which is what gets relayed verbatim
    /// for single-recipient deliveries.
    #[must_use]
    pub fn to_status(&self) -> Status {
        let mut enhanced = None;
        let mut lines = Vec::with_capacity(self.lines.len());

        for line in &self.lines {
            match parse_enhanced(line) {
                Some((code, rest)) => {
                    enhanced.get_or_insert(code);
                    lines.push(rest);
                }
                None => lines.push(line.as_str()),
            }
        }

        Status::new(
            self.code,
            enhanced.unwrap_or_else(|| EnhancedCode::for_code(self.code)),
            lines.join("\n"),
        )
    }

    /// Parses one complete reply from the front of `buffer`.
    ///
    /// Returns the reply and the number of bytes consumed, or `None` when
    /// the buffer does not yet hold a full reply.
    ///
    /// # Errors
    /// [`ClientError::Parse`] for a line that is not `<code><sp|dash>text`,
    /// or a multi-line reply whose code changes between lines.
    pub fn parse(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let text = std::str::from_utf8(buffer)?;
        let mut consumed = 0;
        let mut lines = Vec::new();
        let mut code = None;

        loop {
            let remaining = &text[consumed..];
            let Some(end) = remaining.find('\n') else {
                return Ok(None);
            };
            consumed += end + 1;

            let line = remaining[..end].strip_suffix('\r').unwrap_or(&remaining[..end]);
            if line.is_empty() {
                continue;
            }

            let (line_code, is_last, message) = parse_line(line)?;
            match code {
                Some(code) if code != line_code => {
                    return Err(ClientError::Parse(format!(
                        "code changed mid-reply: {code} then {line_code}"
                    )));
                }
                None => code = Some(line_code),
                Some(_) => {}
            }
            lines.push(message.to_owned());

            if is_last {
                // `code` was set on the first parsed line
                let code = code.ok_or_else(|| ClientError::Parse("empty reply".into()))?;
                return Ok(Some((Self::new(code, lines), consumed)));
            }
        }
    }
}

/// Splits one reply line into `(code, is_last, text)`. A space separator
/// marks the final line, a dash a continuation.
fn parse_line(line: &str) -> Result<(u16, bool, &str)> {
    if line.len() < 3 || !line.is_char_boundary(3) {
        return Err(ClientError::Parse(format!("reply line too short: {line:?}")));
    }

    let code = line[..3]
        .parse::<u16>()
        .map_err(|_| ClientError::Parse(format!("invalid reply code in {line:?}")))?;

    match line.as_bytes().get(3) {
        None => Ok((code, true, "")),
        Some(b' ') => Ok((code, true, &line[4..])),
        Some(b'-') => Ok((code, false, &line[4..])),
        Some(_) => Err(ClientError::Parse(format!(
            "invalid separator in reply line {line:?}"
        ))),
    }
}

/// Recognizes a leading RFC 3463 enhanced status triple and returns it
/// with the remaining text.
fn parse_enhanced(line: &str) -> Option<(EnhancedCode, &str)> {
    let (token, rest) = match line.split_once(' ') {
        Some((token, rest)) => (token, rest),
        None => (line, ""),
    };

    let mut fields = token.split('.');
    let class = fields.next()?.parse::<u8>().ok()?;
    let subject = fields.next()?.parse::<u8>().ok()?;
    let detail = fields.next()?.parse::<u16>().ok()?;
    if fields.next().is_some() || !matches!(class, 2 | 4 | 5) {
        return None;
    }

    Some((EnhancedCode(class, subject, detail), rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_line_reply() {
        let (response, consumed) = Response::parse(b"220 mail.example.org ESMTP\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(response.code, 220);
        assert_eq!(response.lines, vec!["mail.example.org ESMTP"]);
        assert_eq!(consumed, 28);
    }

    #[test]
    fn parses_multi_line_reply() {
        let data = b"250-mail.example.org\r\n250-STARTTLS\r\n250 SIZE 10240000\r\n";
        let (response, consumed) = Response::parse(data).unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(
            response.lines,
            vec!["mail.example.org", "STARTTLS", "SIZE 10240000"]
        );
        assert_eq!(consumed, data.len());
    }

    #[test]
    fn incomplete_reply_needs_more_data() {
        assert!(Response::parse(b"250-mail.example.org\r\n250-SIZ").unwrap().is_none());
        assert!(Response::parse(b"25").unwrap().is_none());
    }

    #[test]
    fn code_change_mid_reply_is_an_error() {
        assert!(Response::parse(b"250-one\r\n550 two\r\n").is_err());
    }

    #[test]
    fn bare_code_line_is_final() {
        let (response, _) = Response::parse(b"250\r\n").unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(response.lines, vec![""]);
    }

    #[test]
    fn reply_classes_are_disjoint() {
        let go_ahead = Response::new(354, vec!["End data with <CR><LF>.<CR><LF>".into()]);
        assert!(go_ahead.is_intermediate());
        assert!(!go_ahead.is_success());
        assert!(!go_ahead.is_temporary_error());

        let ok = Response::new(250, vec!["OK".into()]);
        assert!(ok.is_success());
        assert!(!ok.is_intermediate());
    }

    #[test]
    fn capability_lookup_ignores_greeting_line() {
        let response = Response::new(
            250,
            vec![
                "STARTTLS.example.org hello".into(),
                "starttls".into(),
                "SIZE 10240000".into(),
            ],
        );
        assert!(response.has_capability("STARTTLS"));
        assert!(response.has_capability("SIZE"));
        assert!(!response.has_capability("PIPELINING"));

        let greeting_only = Response::new(250, vec!["STARTTLS.example.org hello".into()]);
        assert!(!greeting_only.has_capability("STARTTLS"));
    }

    #[test]
    fn status_extracts_enhanced_code() {
        let response = Response::new(550, vec!["5.1.2 Hey".into()]);
        let status = response.to_status();
        assert_eq!(status.code, 550);
        assert_eq!(status.enhanced, EnhancedCode(5, 1, 2));
        assert_eq!(status.message, "Hey");
    }

    #[test]
    fn status_without_enhanced_code_gets_generic_triple() {
        let status = Response::new(421, vec!["Service not available".into()]).to_status();
        assert_eq!(status.enhanced, EnhancedCode(4, 0, 0));
        assert_eq!(status.message, "Service not available");
    }

    #[test]
    fn dotted_hostname_is_not_an_enhanced_code() {
        let status = Response::new(554, vec!["10.0.0.1 rejected you".into()]).to_status();
        assert_eq!(status.enhanced, EnhancedCode(5, 0, 0));
        assert_eq!(status.message, "10.0.0.1 rejected you");
    }
}
