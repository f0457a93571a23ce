//! Human-typable peer ids for P2P connections.

use std::fmt;
use std::str::FromStr;

use crate::{ParseError, Result};

/// Symbols used by connection ids. Look-alike letters are left out.
const ALPHABET: &[u8; 24] = b"0W8N4Y1HP5DF9K6JM3C2XA7R";

/// Symbols generated before truncation to three groups.
const ENCODED_LEN: usize = 16;

/// A P2P peer id such as `N4Y1-HP5D-F9K6`.
///
/// Groups of four alphabet symbols joined by `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConnectionUid(String);

impl ConnectionUid {
    /// Normalises user input and validates it.
    ///
    /// Input is upper-cased and look-alike letters are mapped onto the
    /// alphabet (`O` to `0`, `S` to `5`, ...).
    pub fn parse(input: &str) -> Result<Self> {
        let normalised: String = input.trim().chars().map(normalise).collect();
        if is_well_formed(&normalised) {
            Ok(Self(normalised))
        } else {
            Err(ParseError::ConnectionId(input.to_owned()))
        }
    }

    /// Generates a fresh id of three groups.
    pub fn random() -> Self {
        let symbols = base24(random_bits(), ENCODED_LEN);
        Self(format!("{}-{}-{}", &symbols[0..4], &symbols[4..8], &symbols[8..12]))
    }

    /// The id in canonical form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Maps one input character onto the alphabet where a look-alike exists.
fn normalise(c: char) -> char {
    match c.to_ascii_uppercase() {
        'B' => '8',
        'E' => 'F',
        'G' => '6',
        'I' | 'L' => '1',
        'O' | 'Q' => '0',
        'S' => '5',
        other => other,
    }
}

/// `^([A]{4}-)*[A]{4}$` over the alphabet `A`.
fn is_well_formed(s: &str) -> bool {
    !s.is_empty()
        && s.split('-')
            .all(|g| g.len() == 4 && g.bytes().all(|b| ALPHABET.contains(&b)))
}

/// 80 random bits.
fn random_bits() -> u128 {
    rand::random::<u128>() & ((1 << 80) - 1)
}

/// Little-endian base-24 digits of `n`; a digit equal to its predecessor is
/// replaced by the one computed from `n + 1`.
fn base24(mut n: u128, len: usize) -> String {
    let mut out = String::with_capacity(len);
    let mut prev = None;
    while out.len() < len {
        let mut c = ALPHABET[(n % 24) as usize];
        if prev == Some(c) {
            c = ALPHABET[((n + 1) % 24) as usize];
        }
        prev = Some(c);
        out.push(char::from(c));
        n /= 24;
    }
    out
}

impl fmt::Display for ConnectionUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ConnectionUid {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ConnectionUid {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<ConnectionUid> for String {
    fn from(uid: ConnectionUid) -> Self {
        uid.0
    }
}
