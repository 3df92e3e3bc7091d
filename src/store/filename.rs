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

//! Maildir leaf-name handling.
//!
//! A message file is named `<base>[:2,<flag-letters>]`. `<base>` is globally
//! unique and doubles as the message's `unique_id`; the optional suffix
//! carries the flag letters in ascending ASCII order. A name without the
//! `:2,` marker is a flagless message.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use rand::Rng;

/// A message flag, stored as a single letter in the file name.
///
/// `\Recent` is deliberately absent: recency is derived from whether the
/// file sits in `new/`, never stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Flag {
    Seen,
    Answered,
    Flagged,
    Deleted,
    Draft,
}

impl Flag {
    pub fn letter(self) -> char {
        match self {
            Flag::Seen => 'S',
            Flag::Answered => 'R',
            Flag::Flagged => 'F',
            Flag::Deleted => 'T',
            Flag::Draft => 'D',
        }
    }

    pub fn from_letter(letter: char) -> Option<Self> {
        match letter {
            'S' => Some(Flag::Seen),
            'R' => Some(Flag::Answered),
            'F' => Some(Flag::Flagged),
            'T' => Some(Flag::Deleted),
            'D' => Some(Flag::Draft),
            _ => None,
        }
    }

    /// The IMAP system flag name, e.g. `\Seen`.
    pub fn system_name(self) -> &'static str {
        match self {
            Flag::Seen => "\\Seen",
            Flag::Answered => "\\Answered",
            Flag::Flagged => "\\Flagged",
            Flag::Deleted => "\\Deleted",
            Flag::Draft => "\\Draft",
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.system_name())
    }
}

impl FromStr for Flag {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        if "\\Seen".eq_ignore_ascii_case(s) {
            Ok(Flag::Seen)
        } else if "\\Answered".eq_ignore_ascii_case(s) {
            Ok(Flag::Answered)
        } else if "\\Flagged".eq_ignore_ascii_case(s) {
            Ok(Flag::Flagged)
        } else if "\\Deleted".eq_ignore_ascii_case(s) {
            Ok(Flag::Deleted)
        } else if "\\Draft".eq_ignore_ascii_case(s) {
            Ok(Flag::Draft)
        } else {
            Err(())
        }
    }
}

pub type FlagSet = BTreeSet<Flag>;

/// Generates a globally unique Maildir base name.
///
/// The name combines the clock (seconds and microseconds), the process id, a
/// random component, and the host name, so concurrent deliveries from
/// independent processes cannot collide.
pub fn generate_unique(hostname: &str) -> String {
    let now = Utc::now();
    format!(
        "{}.M{}P{}R{}.{}",
        now.timestamp(),
        now.timestamp_subsec_micros(),
        std::process::id(),
        rand::thread_rng().gen_range(0u32..1_000_000),
        hostname,
    )
}

/// The result of parsing a message file name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedName {
    pub unique_id: String,
    pub flags: FlagSet,
}

/// Parses a message leaf name into its unique id and flag set.
///
/// Flags are only recognised after a `:2,` marker; any other suffix after a
/// colon leaves the message flagless. Letters outside the known set are
/// dropped.
pub fn parse(name: &str) -> ParsedName {
    let unique_id = name.split(':').next().unwrap_or(name).to_owned();

    let flags = match name.split_once(":2,") {
        Some((_, letters)) => {
            letters.chars().filter_map(Flag::from_letter).collect()
        },
        None => FlagSet::new(),
    };

    ParsedName { unique_id, flags }
}

/// Encodes a unique id and flag set back into a leaf name.
///
/// The flag letters appear in ascending ASCII order regardless of insertion
/// order, so the name is stable under permutation of the input set.
pub fn encode(unique_id: &str, flags: &FlagSet) -> String {
    if flags.is_empty() {
        return unique_id.to_owned();
    }

    let mut letters: Vec<char> = flags.iter().map(|f| f.letter()).collect();
    letters.sort_unstable();

    let mut name = String::with_capacity(unique_id.len() + 3 + letters.len());
    name.push_str(unique_id);
    name.push_str(":2,");
    name.extend(letters);
    name
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn flags(letters: &str) -> FlagSet {
        letters.chars().filter_map(Flag::from_letter).collect()
    }

    #[test]
    fn parse_flagless() {
        let parsed = parse("1700000000.M42P100R7.mail.example.com");
        assert_eq!("1700000000.M42P100R7.mail.example.com", parsed.unique_id);
        assert!(parsed.flags.is_empty());
    }

    #[test]
    fn parse_with_flags() {
        let parsed = parse("1700000000.M42P100R7.host:2,FS");
        assert_eq!("1700000000.M42P100R7.host", parsed.unique_id);
        assert_eq!(flags("FS"), parsed.flags);
    }

    #[test]
    fn parse_empty_flag_suffix() {
        let parsed = parse("base:2,");
        assert_eq!("base", parsed.unique_id);
        assert!(parsed.flags.is_empty());
    }

    #[test]
    fn parse_unknown_suffix_is_flagless() {
        let parsed = parse("base:1,X");
        assert_eq!("base", parsed.unique_id);
        assert!(parsed.flags.is_empty());
    }

    #[test]
    fn parse_drops_unknown_letters() {
        let parsed = parse("base:2,SXab");
        assert_eq!(flags("S"), parsed.flags);
    }

    #[test]
    fn encode_sorts_letters() {
        let mut set = FlagSet::new();
        set.insert(Flag::Deleted);
        set.insert(Flag::Seen);
        set.insert(Flag::Draft);
        assert_eq!("base:2,DST", encode("base", &set));
    }

    #[test]
    fn encode_empty_set_has_no_suffix() {
        assert_eq!("base", encode("base", &FlagSet::new()));
    }

    #[test]
    fn system_flag_names_round_trip() {
        for flag in [
            Flag::Seen,
            Flag::Answered,
            Flag::Flagged,
            Flag::Deleted,
            Flag::Draft,
        ] {
            assert_eq!(Ok(flag), flag.system_name().parse());
            assert_eq!(Some(flag), Flag::from_letter(flag.letter()));
        }
    }

    #[test]
    fn unique_names_have_expected_shape() {
        let name = generate_unique("mail.example.com");
        assert!(name.ends_with(".mail.example.com"));
        let parsed = parse(&name);
        assert_eq!(name, parsed.unique_id);

        let stem = name.strip_suffix(".mail.example.com").unwrap();
        let (secs, rest) = stem.split_once(".M").unwrap();
        assert!(secs.parse::<i64>().is_ok());
        let (micros, rest) = rest.split_once('P').unwrap();
        assert!(micros.parse::<u32>().is_ok());
        let (pid, random) = rest.split_once('R').unwrap();
        assert!(pid.parse::<u32>().is_ok());
        assert!(random.parse::<u32>().is_ok());
    }

    proptest! {
        #[test]
        fn encode_parse_round_trip(letters in "[SRFTD]{0,5}") {
            let set = flags(&letters);
            let name = encode("1700000000.M1P2R3.host", &set);
            let parsed = parse(&name);
            prop_assert_eq!("1700000000.M1P2R3.host", &*parsed.unique_id);
            prop_assert_eq!(set, parsed.flags);
        }

        #[test]
        fn encode_is_permutation_stable(letters in "[SRFTD]{1,5}") {
            let forward = flags(&letters);
            let reversed: FlagSet =
                letters.chars().rev().filter_map(Flag::from_letter).collect();
            prop_assert_eq!(
                encode("base", &forward),
                encode("base", &reversed)
            );
        }
    }
}
