//! Reader enumeration and badge identity extraction

use crate::domain::{DriverError, DriverOp};
use crate::io::driver::{CardConnection, CardContext, Protocols, ShareMode};
use tracing::debug;

/// PC/SC pseudo-APDU: GET DATA, UID of the card in the field
pub const GET_UID_APDU: [u8; 5] = [0xFF, 0xCA, 0x00, 0x00, 0x00];

/// ISO 7816 success status word
const SW_SUCCESS: [u8; 2] = [0x90, 0x00];

/// List the readers currently attached
pub fn enumerate_readers<C: CardContext>(ctx: &C) -> Result<Vec<String>, DriverError> {
    let readers = ctx.list_readers()?;
    debug!(count = readers.len(), readers = ?readers, "readers_enumerated");
    Ok(readers)
}

/// Open the card on `reader` for exclusive use, letting the reader pick
/// the protocol
pub fn connect_exclusive<C: CardContext>(ctx: &C, reader: &str) -> Result<C::Card, DriverError> {
    ctx.connect(reader, ShareMode::Exclusive, Protocols::Any)
}

/// How the raw UID response is turned into a badge identifier
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityExtractor {
    strip_status_word: bool,
}

impl IdentityExtractor {
    pub fn new(strip_status_word: bool) -> Self {
        Self { strip_status_word }
    }

    /// Send GET UID and hex-encode the answer (lowercase, no separators).
    ///
    /// The response is trusted as-is unless status word stripping is on, in
    /// which case a trailing `90 00` is removed and any other status word is
    /// an error. An empty identifier is always an error.
    pub fn extract<K: CardConnection>(&self, card: &mut K) -> Result<String, DriverError> {
        let rsp = card.transmit(&GET_UID_APDU)?;

        let uid = if self.strip_status_word { strip_status_word(&rsp)? } else { &rsp[..] };
        if uid.is_empty() {
            return Err(DriverError::new(DriverOp::Transmit, "card returned an empty UID"));
        }

        Ok(hex::encode(uid))
    }
}

/// Extract the badge identifier using the raw response
pub fn extract_identity<K: CardConnection>(card: &mut K) -> Result<String, DriverError> {
    IdentityExtractor::default().extract(card)
}

fn strip_status_word(rsp: &[u8]) -> Result<&[u8], DriverError> {
    match rsp.len().checked_sub(2).map(|n| rsp.split_at(n)) {
        Some((data, sw)) if sw == SW_SUCCESS => Ok(data),
        Some((_, sw)) => Err(DriverError::new(
            DriverOp::Transmit,
            format!("GET UID failed with status {:02X}{:02X}", sw[0], sw[1]),
        )),
        None => Err(DriverError::new(DriverOp::Transmit, "response shorter than a status word")),
    }
}
