//! Agency wire protocol parser and response generator.
//!
//! Text protocol with three delimiter levels:
//!
//! ```text
//! frame    := request (';' request)* '\n'
//! request  := action ('|' field)*
//! ```
//!
//! The transport strips the `\n`. A frame may batch several requests,
//! each one parsed independently so a malformed request never takes its
//! siblings down with it.
//!
//! Requests:
//! - `APUESTA|<agency>|<document>|<name>|<birthdate>|<number>`
//! - `APUESTA|<agency>|<first name>|<last name>|<document>|<birthdate>|<number>`
//! - `FINAPUESTA`
//! - `GANADORES|<agency>`
//!
//! Responses:
//! - `CONFIRMARAPUESTA|OK`
//! - `GANADORES|<document>|<document>|...`

use crate::storage::{Bet, BIRTHDATE_FORMAT};
use bytes::{BufMut, BytesMut};
use chrono::NaiveDate;
use std::str::FromStr;
use thiserror::Error;

/// Marks the end of a transport frame
pub const MESSAGE_DELIMITER: u8 = b'\n';
/// Separates requests batched in one frame
pub const REQUEST_DELIMITER: char = ';';
/// Separates a request's action from its arguments
pub const FIELD_DELIMITER: char = '|';

pub const ACTION_BET: &str = "APUESTA";
pub const ACTION_END_OF_BATCH: &str = "FINAPUESTA";
pub const ACTION_WINNERS: &str = "GANADORES";
pub const ACTION_CONFIRM_BET: &str = "CONFIRMARAPUESTA";

/// Fixed acknowledgment carried by every batch confirmation
pub const CONFIRMATION_ACK: &str = "OK";

/// Parsed agency request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Store a bet
    Bet(Bet),
    /// Close the current batch and ask for a confirmation
    EndOfBatch,
    /// Wait for the draw and ask for this agency's winners
    Winners { agency: u32 },
}

/// Reply sent back to an agency
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Batch received
    BetConfirmation,
    /// Winning documents of the requesting agency
    Winners(Vec<String>),
}

/// Protocol parsing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error("{action} expects {expected} fields, got {found}")]
    FieldCount {
        action: &'static str,
        expected: &'static str,
        found: usize,
    },
    #[error("invalid {field} '{value}'")]
    InvalidField { field: &'static str, value: String },
}

/// Split a frame into its requests.
///
/// Empty requests (a trailing `;`, stray whitespace) are skipped.
pub fn parse_frame(frame: &str) -> impl Iterator<Item = Result<Request, ParseError>> + '_ {
    frame
        .split(REQUEST_DELIMITER)
        .map(str::trim)
        .filter(|request| !request.is_empty())
        .map(parse_request)
}

/// Parse a single request (no request or frame delimiters).
pub fn parse_request(request: &str) -> Result<Request, ParseError> {
    let mut fields = request.split(FIELD_DELIMITER).map(str::trim);
    // split always yields at least one item
    let action = fields.next().unwrap_or_default();
    let args: Vec<&str> = fields.collect();

    match action {
        ACTION_BET => parse_bet(&args).map(Request::Bet),
        ACTION_END_OF_BATCH => {
            if args.is_empty() {
                Ok(Request::EndOfBatch)
            } else {
                Err(ParseError::FieldCount {
                    action: ACTION_END_OF_BATCH,
                    expected: "0",
                    found: args.len(),
                })
            }
        }
        ACTION_WINNERS => match args.as_slice() {
            [agency] => Ok(Request::Winners {
                agency: parse_field("agency", agency)?,
            }),
            _ => Err(ParseError::FieldCount {
                action: ACTION_WINNERS,
                expected: "1",
                found: args.len(),
            }),
        },
        other => Err(ParseError::UnknownAction(other.to_string())),
    }
}

fn parse_bet(args: &[&str]) -> Result<Bet, ParseError> {
    let (agency, document, name, birthdate, number) = match *args {
        [agency, document, name, birthdate, number] => {
            (agency, document, name.to_string(), birthdate, number)
        }
        // Split-name form sent by the agency client
        [agency, first_name, last_name, document, birthdate, number] => (
            agency,
            document,
            format!("{first_name} {last_name}"),
            birthdate,
            number,
        ),
        _ => {
            return Err(ParseError::FieldCount {
                action: ACTION_BET,
                expected: "5 or 6",
                found: args.len(),
            })
        }
    };

    if document.is_empty() {
        return Err(ParseError::InvalidField {
            field: "document",
            value: String::new(),
        });
    }

    let birthdate = NaiveDate::parse_from_str(birthdate, BIRTHDATE_FORMAT).map_err(|_| {
        ParseError::InvalidField {
            field: "birthdate",
            value: birthdate.to_string(),
        }
    })?;

    Ok(Bet {
        agency: parse_field("agency", agency)?,
        document: document.to_string(),
        name,
        birthdate,
        number: parse_field("number", number)?,
    })
}

fn parse_field<T: FromStr>(field: &'static str, value: &str) -> Result<T, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidField {
        field,
        value: value.to_string(),
    })
}

impl Response {
    /// Encode the response payload. The transport adds the frame delimiter.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            Response::BetConfirmation => {
                buf.put_slice(ACTION_CONFIRM_BET.as_bytes());
                buf.put_u8(FIELD_DELIMITER as u8);
                buf.put_slice(CONFIRMATION_ACK.as_bytes());
            }
            Response::Winners(documents) => {
                buf.put_slice(ACTION_WINNERS.as_bytes());
                buf.put_u8(FIELD_DELIMITER as u8);
                for (i, document) in documents.iter().enumerate() {
                    if i > 0 {
                        buf.put_u8(FIELD_DELIMITER as u8);
                    }
                    buf.put_slice(document.as_bytes());
                }
            }
        }
        buf
    }
}
