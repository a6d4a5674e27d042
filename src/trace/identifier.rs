//! Trace and span identifiers.
//!
//! Identifiers are fixed-length byte strings with a cached lowercase hex
//! rendering. Two schemes are built in: `single` uses 8-byte trace and span
//! identifiers, `double` widens trace identifiers to 16 bytes.

use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use once_cell::sync::Lazy;
use rand::{rngs, Rng, SeedableRng};

use crate::error::{Error, Result};

const MAX_WIDTH: usize = 16;

thread_local! {
    /// Store random number generator for each thread
    static CURRENT_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_entropy());
}

static EMPTY_IDENTIFIER: Lazy<Identifier> = Lazy::new(|| Identifier {
    bytes: [0; MAX_WIDTH],
    len: 0,
    hex: Arc::from(""),
});

/// A fixed-length identifier with a cached hex rendering.
///
/// The empty identifier is a first-class sentinel: it has zero length, renders
/// as the empty string and answers `true` to [`Identifier::is_empty`].
#[derive(Clone)]
pub struct Identifier {
    bytes: [u8; MAX_WIDTH],
    len: u8,
    hex: Arc<str>,
}

impl Identifier {
    /// The empty identifier sentinel.
    pub fn empty() -> Identifier {
        EMPTY_IDENTIFIER.clone()
    }

    /// Builds an identifier from raw bytes. At most 16 bytes are accepted.
    pub fn from_bytes(bytes: &[u8]) -> Result<Identifier> {
        if bytes.is_empty() || bytes.len() > MAX_WIDTH {
            return Err(Error::InvalidIdentifier(format!("{} bytes", bytes.len())));
        }
        let mut data = [0u8; MAX_WIDTH];
        data[..bytes.len()].copy_from_slice(bytes);
        Ok(Identifier {
            bytes: data,
            len: bytes.len() as u8,
            hex: Arc::from(render_hex(bytes)),
        })
    }

    /// Parses an identifier from a hex string. Both upper and lower case
    /// digits are accepted; the cached rendering is always lowercase.
    pub fn from_hex(hex: &str) -> Result<Identifier> {
        if hex.is_empty() || hex.len() % 2 != 0 || hex.len() > MAX_WIDTH * 2 {
            return Err(Error::InvalidIdentifier(hex.to_owned()));
        }
        let mut bytes = [0u8; MAX_WIDTH];
        for (idx, pair) in hex.as_bytes().chunks_exact(2).enumerate() {
            let high = hex_digit(pair[0]).ok_or_else(|| Error::InvalidIdentifier(hex.to_owned()))?;
            let low = hex_digit(pair[1]).ok_or_else(|| Error::InvalidIdentifier(hex.to_owned()))?;
            bytes[idx] = (high << 4) | low;
        }
        let len = hex.len() / 2;
        Ok(Identifier {
            bytes,
            len: len as u8,
            hex: Arc::from(render_hex(&bytes[..len])),
        })
    }

    /// Whether this is the empty sentinel.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The identifier bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Width in bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// The cached lowercase hex rendering.
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl PartialEq for Identifier {
    fn eq(&self, other: &Self) -> bool {
        self.bytes() == other.bytes()
    }
}

impl Eq for Identifier {}

impl Hash for Identifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes().hash(state)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("Identifier(empty)")
        } else {
            write!(f, "Identifier({})", self.hex)
        }
    }
}

fn render_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from_digit((byte >> 4) as u32, 16).unwrap_or('0'));
        out.push(char::from_digit((byte & 0x0f) as u32, 16).unwrap_or('0'));
    }
    out
}

fn hex_digit(ascii: u8) -> Option<u8> {
    (ascii as char).to_digit(16).map(|d| d as u8)
}

/// Generates identifiers of a fixed width from a thread-local random source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdFactory {
    width: usize,
}

impl IdFactory {
    /// A factory producing identifiers of `width` bytes (1..=16).
    pub fn new(width: usize) -> IdFactory {
        IdFactory {
            width: width.clamp(1, MAX_WIDTH),
        }
    }

    /// Generates a new non-empty identifier.
    pub fn generate(&self) -> Identifier {
        let mut bytes = [0u8; MAX_WIDTH];
        CURRENT_RNG.with(|rng| {
            let mut rng = rng.borrow_mut();
            loop {
                rng.fill(&mut bytes[..self.width]);
                // An all-zero draw would collide with what remote peers treat
                // as absent identifiers.
                if bytes[..self.width].iter().any(|b| *b != 0) {
                    break;
                }
            }
        });
        Identifier::from_bytes(&bytes[..self.width]).expect("width is always within range")
    }

    /// Width of the produced identifiers, in bytes.
    pub fn width(&self) -> usize {
        self.width
    }
}

/// The pair of factories used to mint trace and span identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdentifierScheme {
    /// Factory for trace identifiers.
    pub trace_ids: IdFactory,
    /// Factory for span identifiers.
    pub span_ids: IdFactory,
}

impl IdentifierScheme {
    /// 8-byte trace identifiers and 8-byte span identifiers.
    pub fn single() -> IdentifierScheme {
        IdentifierScheme {
            trace_ids: IdFactory::new(8),
            span_ids: IdFactory::new(8),
        }
    }

    /// 16-byte trace identifiers and 8-byte span identifiers.
    pub fn double() -> IdentifierScheme {
        IdentifierScheme {
            trace_ids: IdFactory::new(16),
            span_ids: IdFactory::new(8),
        }
    }
}

impl Default for IdentifierScheme {
    fn default() -> Self {
        IdentifierScheme::single()
    }
}
