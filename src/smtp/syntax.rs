//-
// Copyright (c) 2024, the Tidemail developers
//
// This file is part of Tidemail.
//
// Tidemail is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Tidemail is distributed  in the hope that it  will be useful,  but WITHOUT
// ANY WARRANTY; without even  the implied warranty of  MERCHANTABILITY or
// FITNESS FOR  A PARTICULAR  PURPOSE. See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Tidemail. If not, see <http://www.gnu.org/licenses/>.

use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// (HELO|EHLO) origin-host ignored...
    Helo(String, String),
    /// AUTH mechanism [initial-response]
    Auth(String, Option<String>),
    /// MAIL FROM:<return-path> [SIZE=n] [BODY=...]
    /// The final element is a list of warnings about ignored parameters.
    MailFrom(String, Option<u64>, Vec<String>),
    /// RCPT TO:<forward-path>
    Recipient(String, Vec<String>),
    /// DATA
    Data,
    /// RSET
    Reset,
    /// VRFY address
    Verify(String),
    /// HELP ignored...
    Help,
    /// NOOP
    Noop,
    /// QUIT
    Quit,
    /// STARTTLS
    StartTls,
}

const MAX_WARNINGS: usize = 4;

lazy_static! {
    static ref RX_HELO: Regex =
        Regex::new("^(?i)(HELO|EHLO) ([^ ]+)").unwrap();
    static ref RX_MAIL: Regex =
        Regex::new("^(?i)MAIL FROM: ?(<[^>]*>|[^ ]*)(.*)$").unwrap();
    static ref RX_MAIL_BODY_PARM: Regex =
        Regex::new("(?i)^BODY=(7BIT|8BITMIME)$").unwrap();
    static ref RX_MAIL_SIZE_PARM: Regex =
        Regex::new("(?i)^SIZE=([0-9]+)$").unwrap();
    static ref RX_RCPT: Regex =
        Regex::new("^(?i)RCPT TO: ?(<[^>]*>|[^ ]*)(.*)$").unwrap();
    static ref RX_AUTH: Regex =
        Regex::new("^(?i)AUTH ([A-Z0-9-]+)(?: ([0-9A-Za-z+/=]+))?$").unwrap();
    static ref RX_VRFY: Regex = Regex::new("^(?i)VRFY (.+)$").unwrap();
    static ref RX_KNOWN_COMMANDS: Regex = Regex::new(
        "^(?i)(DATA|RSET|VRFY|HELP|NOOP|QUIT|\
         STARTTLS|MAIL|RCPT|HELO|EHLO|AUTH)( .*)?$"
    )
    .unwrap();
}

pub fn looks_like_known_command(s: &str) -> bool {
    RX_KNOWN_COMMANDS.is_match(s)
}

impl FromStr for Command {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        let mut warnings = Vec::<String>::new();
        let mut add_warning = |w: String| {
            if warnings.len() < MAX_WARNINGS {
                warnings.push(w);
            }
        };

        static SIMPLE_COMMANDS: &[(&str, Command, bool)] = &[
            ("DATA", Command::Data, false),
            ("RSET", Command::Reset, false),
            ("HELP", Command::Help, true),
            ("NOOP", Command::Noop, false),
            ("QUIT", Command::Quit, false),
            ("STARTTLS", Command::StartTls, false),
        ];

        for &(prefix, ref cmd, allow_trailing_garbage) in SIMPLE_COMMANDS {
            if s.len() >= prefix.len()
                && (allow_trailing_garbage || s.len() == prefix.len())
                && s.get(0..prefix.len())
                    .is_some_and(|sp| prefix.eq_ignore_ascii_case(sp))
            {
                return Ok(cmd.clone());
            }
        }

        if let Some(cap) = RX_HELO.captures(s) {
            Ok(Command::Helo(
                cap.get(1).unwrap().as_str().to_uppercase(),
                cap.get(2).unwrap().as_str().to_owned(),
            ))
        } else if let Some(cap) = RX_MAIL.captures(s) {
            let mut size = None::<u64>;
            for parm in cap
                .get(2)
                .map(|c| c.as_str())
                .unwrap_or("")
                .split(' ')
                .filter(|p| !p.is_empty())
            {
                if let Some(cap) = RX_MAIL_SIZE_PARM.captures(parm) {
                    size = cap.get(1).and_then(|c| c.as_str().parse().ok());
                    if size.is_none() {
                        add_warning(format!(
                            "Ignoring invalid MAIL FROM parameter {:?}",
                            parm
                        ));
                    }
                } else if !RX_MAIL_BODY_PARM.is_match(parm) {
                    add_warning(format!(
                        "Ignoring unknown MAIL FROM parameter {:?}",
                        parm
                    ));
                }
            }

            Ok(Command::MailFrom(
                cap.get(1).unwrap().as_str().to_owned(),
                size,
                warnings,
            ))
        } else if let Some(cap) = RX_RCPT.captures(s) {
            if let Some(extra) = cap.get(2).filter(|c| !c.as_str().is_empty())
            {
                add_warning(format!(
                    "Ignoring extraneous RCPT TO parameters: {:?}",
                    extra.as_str().trim()
                ));
            }

            Ok(Command::Recipient(
                cap.get(1).unwrap().as_str().to_owned(),
                warnings,
            ))
        } else if let Some(cap) = RX_AUTH.captures(s) {
            Ok(Command::Auth(
                cap.get(1).unwrap().as_str().to_uppercase(),
                cap.get(2).map(|data| data.as_str().to_owned()),
            ))
        } else if let Some(cap) = RX_VRFY.captures(s) {
            Ok(Command::Verify(cap.get(1).unwrap().as_str().to_owned()))
        } else {
            Err(())
        }
    }
}

/// A parsed envelope address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    pub fn address(&self) -> String {
        format!("{}@{}", self.local, self.domain)
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

/// Parses an envelope address as it appears in MAIL FROM / RCPT TO / VRFY.
///
/// One layer of surrounding angle brackets is stripped, whitespace around
/// and inside the brackets is tolerated, and an RFC 5321 source route
/// (`<@relay:user@domain>`) is discarded. `Ok(None)` is the distinguished
/// null sender `<>`. Anything else must be `local@domain` with both parts
/// non-empty and no further `@`.
pub fn parse_address(s: &str) -> Result<Option<EmailAddress>, ()> {
    let mut s = s.trim();

    if let Some(inner) =
        s.strip_prefix('<').and_then(|s| s.strip_suffix('>'))
    {
        s = inner.trim();
    }

    // Source route: @a,@b:user@domain
    if s.starts_with('@') {
        match s.split_once(':') {
            Some((_, rest)) => s = rest,
            None => return Err(()),
        }
    }

    if s.is_empty() {
        return Ok(None);
    }

    let (local, domain) = s.split_once('@').ok_or(())?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(());
    }

    Ok(Some(EmailAddress {
        local: local.to_owned(),
        domain: domain.to_ascii_lowercase(),
    }))
}

/// Encodes message content for transmission inside a DATA payload or a
/// POP3 multi-line response.
///
/// Lines are split on LF with any preceding CR dropped, re-terminated with
/// CRLF, and any line beginning with `.` gets another `.` prepended so that
/// the bare `.` terminator stays unambiguous. The terminator itself is NOT
/// included.
pub fn dot_stuff(content: &[u8]) -> Vec<u8> {
    if content.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(content.len() + 16);

    for line in content.split(|&b| b == b'\n') {
        let line = match line.last() {
            Some(&b'\r') => &line[..line.len() - 1],
            _ => line,
        };

        if line.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }

    // A trailing newline in the input would otherwise emit a spurious
    // empty line.
    if content.ends_with(b"\n") {
        out.truncate(out.len() - 2);
    }

    out
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(local: &str, domain: &str) -> Option<EmailAddress> {
        Some(EmailAddress {
            local: local.to_owned(),
            domain: domain.to_owned(),
        })
    }

    #[test]
    fn command_parsing() {
        assert_eq!(
            Ok(Command::Helo(
                "HELO".to_owned(),
                "foo.example.com".to_owned()
            )),
            "HELO foo.example.com".parse()
        );
        assert_eq!(
            Ok(Command::Helo(
                "EHLO".to_owned(),
                "foo.example.com".to_owned()
            )),
            "ehlo foo.example.com some client".parse()
        );

        assert_eq!(
            Ok(Command::MailFrom("<foo@bar.com>".to_owned(), None, vec![])),
            "MAIL FROM:<foo@bar.com>".parse()
        );
        assert_eq!(
            Ok(Command::MailFrom("<>".to_owned(), None, vec![])),
            "mail from:<>".parse()
        );
        assert_eq!(
            Ok(Command::MailFrom(
                "<foo@bar.com>".to_owned(),
                Some(42),
                vec![]
            )),
            "MAIL FROM:<foo@bar.com> SIZE=42".parse()
        );
        assert_eq!(
            Ok(Command::MailFrom(
                "<foo@bar.com>".to_owned(),
                None,
                vec![]
            )),
            "MAIL FROM:<foo@bar.com> body=8bitmime".parse()
        );
        assert_eq!(
            Ok(Command::MailFrom(
                "<foo@bar.com>".to_owned(),
                None,
                vec!["Ignoring unknown MAIL FROM parameter \"FOO=BAR\""
                    .to_owned()],
            )),
            "MAIL FROM:<foo@bar.com> FOO=BAR".parse()
        );

        assert_eq!(
            Ok(Command::Recipient("<userc@d.bar.org>".to_owned(), vec![])),
            "RCPT TO:<userc@d.bar.org>".parse()
        );
        assert_eq!(
            Ok(Command::Recipient(
                "<userc@d.bar.org>".to_owned(),
                vec!["Ignoring extraneous RCPT TO parameters: \"FOO=BAR\""
                    .to_owned()],
            )),
            "RCPT TO:<userc@d.bar.org> FOO=BAR".parse()
        );

        assert_eq!(Ok(Command::Data), "DATA".parse());
        assert_eq!(Err(()), "DATABASE".parse::<Command>());
        assert_eq!(Ok(Command::Reset), "RSET".parse());
        assert_eq!(Err(()), "RSET FOO".parse::<Command>());
        assert_eq!(Ok(Command::Noop), "NOOP".parse());
        assert_eq!(Ok(Command::Quit), "QUIT".parse());
        assert_eq!(Ok(Command::StartTls), "STARTTLS".parse());
        assert_eq!(Err(()), "STARTTLS 1.3".parse::<Command>());
        assert_eq!(Ok(Command::Help), "HELP me".parse());

        assert_eq!(
            Ok(Command::Verify("<foo@bar.com>".to_owned())),
            "VRFY <foo@bar.com>".parse()
        );
        assert_eq!(Err(()), "VRFY".parse::<Command>());

        assert_eq!(
            Ok(Command::Auth(
                "PLAIN".to_owned(),
                Some("AGJvYgBodW50ZXIy".to_owned()),
            )),
            "AUTH PLAIN AGJvYgBodW50ZXIy".parse::<Command>()
        );
        assert_eq!(
            Ok(Command::Auth("LOGIN".to_owned(), None)),
            "auth login".parse::<Command>()
        );
    }

    #[test]
    fn known_command_detection() {
        assert!(looks_like_known_command("MAIL FROM:"));
        assert!(looks_like_known_command("rcpt to:"));
        assert!(!looks_like_known_command("XYZZY"));
    }

    #[test]
    fn address_parsing() {
        assert_eq!(
            Ok(addr("bob", "example.com")),
            parse_address("<bob@example.com>")
        );
        assert_eq!(
            Ok(addr("bob", "example.com")),
            parse_address("bob@example.com")
        );
        assert_eq!(
            Ok(addr("bob", "example.com")),
            parse_address("  < bob@Example.Com > ")
        );
        assert_eq!(
            Ok(addr("userc", "d.bar.org")),
            parse_address("<@hosta.int,@jkl.org:userc@d.bar.org>")
        );

        // The distinguished null sender.
        assert_eq!(Ok(None), parse_address("<>"));
        assert_eq!(Ok(None), parse_address(""));

        assert_eq!(Err(()), parse_address("bob"));
        assert_eq!(Err(()), parse_address("@example.com"));
        assert_eq!(Err(()), parse_address("bob@"));
        assert_eq!(Err(()), parse_address("a@b@c"));
    }

    #[test]
    fn address_formatting() {
        let parsed = parse_address("<Bob@Example.Com>").unwrap().unwrap();
        assert_eq!("Bob@example.com", parsed.address());
    }

    #[test]
    fn dot_stuffing_encoder() {
        assert_eq!(Vec::<u8>::new(), dot_stuff(b""));
        assert_eq!(b"abc\r\n".to_vec(), dot_stuff(b"abc\r\n"));
        assert_eq!(b"abc\r\n".to_vec(), dot_stuff(b"abc\n"));
        assert_eq!(b"abc\r\n".to_vec(), dot_stuff(b"abc"));
        assert_eq!(b"..hello\r\n".to_vec(), dot_stuff(b".hello\r\n"));
        assert_eq!(b"...x\r\n".to_vec(), dot_stuff(b"..x\r\n"));
        assert_eq!(b"..\r\n".to_vec(), dot_stuff(b".\r\n"));
        assert_eq!(
            b"a\r\n\r\n..b\r\n".to_vec(),
            dot_stuff(b"a\r\n\r\n.b\r\n")
        );
    }
}
