//! Streaming decoder for the controller text protocol.
//!
//! Frame grammar:
//! ```text
//! <HEADER> <ARGUMENT> [ -> <VALUE> ... ] END
//! ```
//!
//! The decoder is stateless: [`decode_next`] takes an accumulated text buffer
//! and returns the first complete frame plus the unconsumed remainder.
//! [`FrameBuffer`] carries that remainder between socket reads.
//!
//! # How a frame is found (for beginners)
//!
//! 1. Look for `END` as a whole whitespace-delimited token.  No `END` means the
//!    frame is incomplete: wait for more bytes.
//! 2. Inside the text up to and including `END`, look for every known header
//!    keyword.  The one at the lowest offset wins; anything before it is noise
//!    and is ignored.
//! 3. Tokenize the rest by whitespace: the first token is the argument, then
//!    either `END` or `->` followed by values up to `END`.
//!
//! Values are parsed tolerantly: numbers are pulled out of each token with a
//! numeric pattern, so `2:10:0.850`, `2:10=0.850V` and `2:10 0.850` all read
//! as "pin 2:10 at 0.850".

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use tracing::warn;

use crate::domain::board::{IoBoardInternalParameters, INTERNAL_PARAMETERS_COUNT};
use crate::domain::connection::{Connection, Reading};
use crate::domain::pin::{validate_board_address, PinAffinityAndId, PinError};
use crate::protocol::messages::{
    ConnectionsDescription, ControllerMessage, HardwareDescription, InternalParameters,
    MessageHeader, PIN_FIELD_SEPARATOR, TERMINATOR, VALUES_SEPARATOR,
};

/// Pending text above this size without a terminator is dropped.
pub const MAX_PENDING_BYTES: usize = 64 * 1024;

/// Errors that make a single frame unusable.  The stream always continues.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecodeError {
    /// No known header keyword in the frame text.
    #[error("no known header in frame")]
    UnknownHeader,

    /// The header is followed directly by the terminator or nothing.
    #[error("{header} frame has an empty body")]
    EmptyBody { header: MessageHeader },

    /// The token stream ended before `END`.
    #[error("{header} frame is missing the END terminator")]
    MissingTerminator { header: MessageHeader },

    /// Something other than `->` or `END` follows the argument.
    #[error("{header} frame: expected `->` after the argument, found `{found}`")]
    BadSeparator { header: MessageHeader, found: String },

    /// A pin argument without exactly two numeric `:`-separated fields.
    #[error("malformed pin identity `{0}`: expected <board>:<pin>")]
    MalformedPinIdentity(String),

    /// Board address or pin id out of range.
    #[error(transparent)]
    Pin(#[from] PinError),

    /// A value token without the numbers its header requires.
    #[error("malformed value `{token}`: {reason}")]
    MalformedValue { token: String, reason: &'static str },

    /// An `INTERNALS` frame with fewer than seven values.
    #[error("INTERNALS frame carries {found} values, expected 7")]
    MissingInternals { found: usize },
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Decodes the first complete frame in `buffer`.
///
/// Returns `None` when `buffer` holds no terminator yet.  Otherwise returns the
/// decode result for the first frame and the text following its `END`.
///
/// # Examples
///
/// ```rust
/// use tester_core::protocol::codec::decode_next;
/// use tester_core::protocol::messages::ControllerMessage;
///
/// let (result, rest) = decode_next("CONNECT 5:3 -> 5:3 END HW 1").unwrap();
/// assert!(matches!(result, Ok(ControllerMessage::ConnectionsDescription(_))));
/// assert_eq!(rest, " HW 1");
/// assert!(decode_next(rest).is_none());
/// ```
pub fn decode_next(buffer: &str) -> Option<(Result<ControllerMessage, DecodeError>, &str)> {
    let start = find_terminator(buffer)?;
    let frame_end = start + TERMINATOR.len();
    Some((decode_frame(&buffer[..frame_end]), &buffer[frame_end..]))
}

/// Everything [`decode_all`] could make of a buffer.
#[derive(Debug, Default, PartialEq)]
pub struct DecodedBatch<'a> {
    pub messages: Vec<ControllerMessage>,
    pub errors: Vec<DecodeError>,
    /// Text after the last terminator, to be prefixed to the next read.
    pub remainder: &'a str,
}

/// Decodes every complete frame in `buffer`, in order.
pub fn decode_all(buffer: &str) -> DecodedBatch<'_> {
    let mut batch = DecodedBatch {
        remainder: buffer,
        ..DecodedBatch::default()
    };
    while let Some((result, rest)) = decode_next(batch.remainder) {
        match result {
            Ok(message) => batch.messages.push(message),
            Err(e) => batch.errors.push(e),
        }
        batch.remainder = rest;
    }
    batch
}

/// Decodes one frame of text.  The text should end with `END`; anything after
/// the first `END` token is ignored.
///
/// # Errors
///
/// Returns [`DecodeError`] describing why the frame is unusable.
pub fn decode_frame(frame: &str) -> Result<ControllerMessage, DecodeError> {
    let (header, body) = select_header(frame).ok_or(DecodeError::UnknownHeader)?;
    let (argument, values) = split_body(header, body)?;

    if header.has_pin_argument() {
        let pin = parse_pin_identity(argument)?;
        let connections = decode_connections(header, &values)?;
        return Ok(ControllerMessage::ConnectionsDescription(ConnectionsDescription {
            pin,
            connections,
        }));
    }

    match header {
        MessageHeader::InternalParameters => decode_internals(argument, &values),
        _ => decode_hardware(&values),
    }
}

// ── FrameBuffer ───────────────────────────────────────────────────────────────

/// Accumulates socket bytes between reads and yields complete frames.
///
/// Invalid UTF-8 is replaced, not rejected; the protocol is ASCII.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: String,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes read from the socket.
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.push_str(&String::from_utf8_lossy(bytes));
    }

    /// Decodes every complete frame and keeps the incomplete tail.
    pub fn drain(&mut self) -> Vec<Result<ControllerMessage, DecodeError>> {
        let mut results = Vec::new();
        let mut consumed = 0;
        while let Some((result, rest)) = decode_next(&self.pending[consumed..]) {
            consumed = self.pending.len() - rest.len();
            results.push(result);
        }
        self.pending.drain(..consumed);

        if self.pending.len() > MAX_PENDING_BYTES {
            warn!(
                pending = self.pending.len(),
                "no frame terminator within {MAX_PENDING_BYTES} bytes, discarding pending text"
            );
            self.pending.clear();
        }
        results
    }

    /// Text received but not yet part of a complete frame.
    pub fn pending(&self) -> &str {
        &self.pending
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

// ── Framing ───────────────────────────────────────────────────────────────────

/// Byte offset of the first `END` that stands alone as a token.
fn find_terminator(buffer: &str) -> Option<usize> {
    buffer
        .match_indices(TERMINATOR)
        .map(|(start, _)| start)
        .find(|&start| {
            let before = buffer[..start].chars().next_back();
            let after = buffer[start + TERMINATOR.len()..].chars().next();
            before.map_or(true, char::is_whitespace) && after.map_or(true, char::is_whitespace)
        })
}

/// The keyword at the lowest offset and the text after it.
fn select_header(frame: &str) -> Option<(MessageHeader, &str)> {
    MessageHeader::ALL
        .iter()
        .filter_map(|header| frame.find(header.keyword()).map(|at| (at, *header)))
        .min_by_key(|(at, _)| *at)
        .map(|(at, header)| (header, &frame[at + header.keyword().len()..]))
}

/// Splits the body into the argument and the value tokens before `END`.
fn split_body(header: MessageHeader, body: &str) -> Result<(&str, Vec<&str>), DecodeError> {
    let mut tokens = body.split_whitespace();

    let argument = match tokens.next() {
        Some(token) if token != TERMINATOR => token,
        _ => return Err(DecodeError::EmptyBody { header }),
    };

    match tokens.next() {
        None => Err(DecodeError::MissingTerminator { header }),
        Some(TERMINATOR) => Ok((argument, Vec::new())),
        Some(VALUES_SEPARATOR) => {
            let mut values = Vec::new();
            for token in tokens {
                if token == TERMINATOR {
                    return Ok((argument, values));
                }
                values.push(token);
            }
            Err(DecodeError::MissingTerminator { header })
        }
        Some(other) => Err(DecodeError::BadSeparator {
            header,
            found: other.to_string(),
        }),
    }
}

// ── Value parsing ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum Number {
    Integer(i64),
    Decimal(f64),
}

impl Number {
    fn as_f32(self) -> f32 {
        match self {
            Number::Integer(n) => n as f32,
            Number::Decimal(x) => x as f32,
        }
    }
}

fn number_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("number pattern is a valid regex"))
}

/// Every number in `token`, in order of appearance.
fn extract_numbers(token: &str) -> Result<Vec<Number>, DecodeError> {
    number_pattern()
        .find_iter(token)
        .map(|m| {
            let text = m.as_str();
            let parsed = if text.contains('.') {
                text.parse().map(Number::Decimal).ok()
            } else {
                text.parse().map(Number::Integer).ok()
            };
            parsed.ok_or_else(|| DecodeError::MalformedValue {
                token: token.to_string(),
                reason: "number does not fit",
            })
        })
        .collect()
}

fn first_number(token: &str) -> Result<Number, DecodeError> {
    extract_numbers(token)?
        .first()
        .copied()
        .ok_or_else(|| DecodeError::MalformedValue {
            token: token.to_string(),
            reason: "expected a number",
        })
}

fn first_integer(token: &str) -> Result<i64, DecodeError> {
    match extract_numbers(token)?.first() {
        Some(Number::Integer(n)) => Ok(*n),
        _ => Err(DecodeError::MalformedValue {
            token: token.to_string(),
            reason: "expected an integer",
        }),
    }
}

/// `<board>:<pin>` with exactly two integer fields.
fn parse_pin_identity(argument: &str) -> Result<PinAffinityAndId, DecodeError> {
    let fields: Vec<&str> = argument.split(PIN_FIELD_SEPARATOR).collect();
    let [board, pin] = fields.as_slice() else {
        return Err(DecodeError::MalformedPinIdentity(argument.to_string()));
    };
    let malformed = || DecodeError::MalformedPinIdentity(argument.to_string());
    let board = board.trim().parse::<i64>().map_err(|_| malformed())?;
    let pin = pin.trim().parse::<i64>().map_err(|_| malformed())?;
    Ok(PinAffinityAndId::from_raw(board, pin)?)
}

/// A lone reading such as `0.850`, `12.5Ohm` or `-3`.
fn is_bare_reading(token: &str) -> bool {
    !token.contains(PIN_FIELD_SEPARATOR)
        && extract_numbers(token).map_or(false, |numbers| numbers.len() == 1)
}

fn to_reading(header: MessageHeader, value: Number, token: &str) -> Result<Reading, DecodeError> {
    match header {
        MessageHeader::PinConnectivityVoltage => Ok(Reading::Voltage(value.as_f32())),
        MessageHeader::PinConnectivityResistance => Ok(Reading::Resistance(value.as_f32())),
        _ => match value {
            Number::Integer(code) => i32::try_from(code).map(Reading::Raw).map_err(|_| {
                DecodeError::MalformedValue {
                    token: token.to_string(),
                    reason: "raw code does not fit 32 bits",
                }
            }),
            Number::Decimal(_) => Err(DecodeError::MalformedValue {
                token: token.to_string(),
                reason: "raw code must be an integer",
            }),
        },
    }
}

fn decode_connections(header: MessageHeader, values: &[&str]) -> Result<Vec<Connection>, DecodeError> {
    let mut connections = Vec::with_capacity(values.len());
    let mut tokens = values.iter().copied().peekable();

    while let Some(token) = tokens.next() {
        let numbers = extract_numbers(token)?;
        let (to_pin, embedded) = match numbers.as_slice() {
            [Number::Integer(board), Number::Integer(pin), rest @ ..] => {
                (PinAffinityAndId::from_raw(*board, *pin)?, rest.first().copied())
            }
            _ => {
                return Err(DecodeError::MalformedValue {
                    token: token.to_string(),
                    reason: "expected <board>:<pin>",
                })
            }
        };

        if header == MessageHeader::PinConnectivityBoolean {
            connections.push(Connection::flag(to_pin));
            continue;
        }

        let (value, value_token) = match embedded {
            Some(value) => (value, token),
            None => match tokens.next_if(|next| is_bare_reading(next)) {
                Some(next) => (first_number(next)?, next),
                None => {
                    return Err(DecodeError::MalformedValue {
                        token: token.to_string(),
                        reason: "missing reading",
                    })
                }
            },
        };
        connections.push(Connection::with_reading(to_pin, to_reading(header, value, value_token)?));
    }
    Ok(connections)
}

fn decode_hardware(values: &[&str]) -> Result<ControllerMessage, DecodeError> {
    let boards_online = values
        .iter()
        .map(|token| Ok(validate_board_address(first_integer(token)?)?))
        .collect::<Result<Vec<_>, DecodeError>>()?;
    Ok(ControllerMessage::HardwareDescription(HardwareDescription { boards_online }))
}

fn decode_internals(argument: &str, values: &[&str]) -> Result<ControllerMessage, DecodeError> {
    let board_address = validate_board_address(first_integer(argument)?)?;

    let mut parsed = [0.0_f32; INTERNAL_PARAMETERS_COUNT];
    let mut found = 0;
    for token in values {
        let number = first_number(token)?;
        if found < INTERNAL_PARAMETERS_COUNT {
            parsed[found] = number.as_f32();
        }
        found += 1;
    }
    if found < INTERNAL_PARAMETERS_COUNT {
        return Err(DecodeError::MissingInternals { found });
    }

    Ok(ControllerMessage::InternalParameters(InternalParameters {
        board_address,
        parameters: IoBoardInternalParameters::from_wire(parsed),
    }))
}
