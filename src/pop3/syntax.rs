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

use std::str::FromStr;

/// A parsed POP3 command. Message numbers are 1-based.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    User(String),
    Pass(String),
    Stat,
    List(Option<usize>),
    Retr(usize),
    Dele(usize),
    Noop,
    Rset,
    Quit,
    Top(usize, usize),
    Uidl(Option<usize>),
    Capa,
    Stls,
    /// AUTH [mechanism]
    Auth(Option<String>),
}

impl FromStr for Command {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        let s = s.trim_start_matches(' ');
        let mut words = s.split(' ').filter(|w| !w.is_empty());
        let verb = words.next().ok_or(())?.to_uppercase();

        // USER and PASS take the whole remainder verbatim; passwords may
        // contain spaces.
        let remainder = s
            .get(verb.len()..)
            .map(|r| r.trim_start_matches(' '))
            .unwrap_or("");

        let number = |w: Option<&str>| w.and_then(|w| w.parse::<usize>().ok());

        match &*verb {
            "USER" if !remainder.is_empty() => {
                Ok(Command::User(remainder.to_owned()))
            },
            "PASS" if !remainder.is_empty() => {
                Ok(Command::Pass(remainder.to_owned()))
            },
            "STAT" => Ok(Command::Stat),
            "LIST" => match (words.next(), words.next()) {
                (None, _) => Ok(Command::List(None)),
                (w @ Some(_), None) => {
                    number(w).map(|n| Command::List(Some(n))).ok_or(())
                },
                _ => Err(()),
            },
            "RETR" => number(words.next()).map(Command::Retr).ok_or(()),
            "DELE" => number(words.next()).map(Command::Dele).ok_or(()),
            "NOOP" => Ok(Command::Noop),
            "RSET" => Ok(Command::Rset),
            "QUIT" => Ok(Command::Quit),
            "TOP" => match (number(words.next()), number(words.next())) {
                (Some(n), Some(k)) => Ok(Command::Top(n, k)),
                _ => Err(()),
            },
            "UIDL" => match (words.next(), words.next()) {
                (None, _) => Ok(Command::Uidl(None)),
                (w @ Some(_), None) => {
                    number(w).map(|n| Command::Uidl(Some(n))).ok_or(())
                },
                _ => Err(()),
            },
            "CAPA" => Ok(Command::Capa),
            "STLS" => Ok(Command::Stls),
            "AUTH" => Ok(Command::Auth(
                words.next().map(|m| m.to_uppercase()),
            )),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_parsing() {
        assert_eq!(
            Ok(Command::User("bob@example.com".to_owned())),
            "USER bob@example.com".parse()
        );
        assert_eq!(
            Ok(Command::Pass("pass with spaces".to_owned())),
            "pass pass with spaces".parse()
        );
        assert_eq!(Err(()), "USER".parse::<Command>());
        assert_eq!(Err(()), "PASS".parse::<Command>());

        assert_eq!(Ok(Command::Stat), "STAT".parse());
        assert_eq!(Ok(Command::Stat), "stat".parse());

        assert_eq!(Ok(Command::List(None)), "LIST".parse());
        assert_eq!(Ok(Command::List(Some(3))), "LIST 3".parse());
        assert_eq!(Err(()), "LIST x".parse::<Command>());
        assert_eq!(Err(()), "LIST 1 2".parse::<Command>());

        assert_eq!(Ok(Command::Retr(1)), "RETR 1".parse());
        assert_eq!(Err(()), "RETR".parse::<Command>());
        assert_eq!(Ok(Command::Dele(9)), "dele 9".parse());

        assert_eq!(Ok(Command::Top(2, 5)), "TOP 2 5".parse());
        assert_eq!(Err(()), "TOP 2".parse::<Command>());

        assert_eq!(Ok(Command::Uidl(None)), "UIDL".parse());
        assert_eq!(Ok(Command::Uidl(Some(7))), "UIDL 7".parse());

        assert_eq!(Ok(Command::Noop), "NOOP".parse());
        assert_eq!(Ok(Command::Rset), "RSET".parse());
        assert_eq!(Ok(Command::Quit), "QUIT".parse());
        assert_eq!(Ok(Command::Capa), "CAPA".parse());
        assert_eq!(Ok(Command::Stls), "STLS".parse());

        assert_eq!(Ok(Command::Auth(None)), "AUTH".parse());
        assert_eq!(
            Ok(Command::Auth(Some("PLAIN".to_owned()))),
            "AUTH plain".parse()
        );

        assert_eq!(Err(()), "XYZZY".parse::<Command>());
        assert_eq!(Err(()), "".parse::<Command>());
    }
}
