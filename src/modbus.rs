use tokio_util::bytes::{Buf, BufMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Exception code returned when the addressed register does not exist on the unit.
pub const ILLEGAL_DATA_ADDRESS: u8 = 2;
/// Exception code returned by devices and proxies that are still working on another request.
pub const SERVER_DEVICE_BUSY: u8 = 6;

/// Length of the MBAP header up to and including the length field.
const HEADER_LENGTH: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub device_id: u8,
    pub transaction_id: u16,
    pub operation: Operation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Function 4.
    GetInputs { address: u16, count: u16 },
    /// Function 3.
    GetHoldings { address: u16, count: u16 },
    /// Function 6.
    SetHolding { address: u16, value: u16 },
}

impl Operation {
    pub const fn function_code(&self) -> u8 {
        match self {
            Operation::GetInputs { .. } => 4,
            Operation::GetHoldings { .. } => 3,
            Operation::SetHolding { .. } => 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub device_id: u8,
    pub transaction_id: u16,
    pub kind: ResponseKind,
}

impl Response {
    pub fn exception_code(&self) -> Option<u8> {
        match &self.kind {
            ResponseKind::ErrorCode(c) => Some(*c),
            ResponseKind::Registers { values: _ } => None,
            ResponseKind::SetHolding { .. } => None,
        }
    }

    pub fn is_server_busy(&self) -> bool {
        self.exception_code() == Some(SERVER_DEVICE_BUSY)
    }

    pub fn is_illegal_address(&self) -> bool {
        self.exception_code() == Some(ILLEGAL_DATA_ADDRESS)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    ErrorCode(u8),
    /// Response to either of the register read functions.
    Registers { values: Vec<u16> },
    /// Echo of a single register write.
    SetHolding { address: u16, value: u16 },
}

pub struct ModbusTCPCodec {}

impl Encoder<&Request> for ModbusTCPCodec {
    type Error = std::io::Error;
    fn encode(
        &mut self,
        req: &Request,
        dst: &mut tokio_util::bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        let (address, word) = match req.operation {
            Operation::GetInputs { address, count } => (address, count),
            Operation::GetHoldings { address, count } => (address, count),
            Operation::SetHolding { address, value } => (address, value),
        };
        dst.reserve(HEADER_LENGTH + 6);
        dst.put_u16(req.transaction_id);
        // Protocol identifier, then the length of everything after the length field.
        dst.put_u16(0);
        dst.put_u16(6);
        dst.put_u8(req.device_id);
        dst.put_u8(req.operation.function_code());
        dst.put_u16(address);
        dst.put_u16(word);
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for ModbusTCPCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(
        &mut self,
        src: &mut tokio_util::bytes::BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(message = "attempt at decoding", buffer = ?src);
            let Some((header, _)) = src.split_first_chunk::<{ HEADER_LENGTH }>() else {
                return Ok(None);
            };
            let transaction_id = u16::from_be_bytes([header[0], header[1]]);
            let proto = u16::from_be_bytes([header[2], header[3]]);
            let required_length = usize::from(u16::from_be_bytes([header[4], header[5]]));
            // Unit identifier and function code are the bare minimum of any frame.
            if proto != 0 || required_length < 2 {
                src.advance(1);
                continue;
            }
            if src.len() < HEADER_LENGTH + required_length {
                src.reserve(HEADER_LENGTH + required_length - src.len());
                return Ok(None);
            }
            let frame = src.split_to(HEADER_LENGTH + required_length);
            let [device_id, function_code, pdu @ ..] = &frame[HEADER_LENGTH..] else {
                unreachable!("frame length was checked above");
            };
            let (device_id, function_code) = (*device_id, *function_code);
            let kind = if function_code & 0x80 != 0 {
                let [code, ..] = pdu else {
                    trace!(message = "exception response without a code", function_code);
                    continue;
                };
                ResponseKind::ErrorCode(*code)
            } else {
                match function_code {
                    3 | 4 => {
                        // The byte count is redundant with the MBAP length, so trust the latter.
                        let [_byte_count, words @ ..] = pdu else { continue };
                        let values = words
                            .chunks_exact(2)
                            .map(|w| u16::from_be_bytes([w[0], w[1]]))
                            .collect();
                        ResponseKind::Registers { values }
                    }
                    6 => {
                        let [a0, a1, v0, v1] = pdu else { continue };
                        ResponseKind::SetHolding {
                            address: u16::from_be_bytes([*a0, *a1]),
                            value: u16::from_be_bytes([*v0, *v1]),
                        }
                    }
                    _ => {
                        trace!(message = "skipping unsupported function", function_code);
                        continue;
                    }
                }
            };
            return Ok(Some(Response { device_id, transaction_id, kind }));
        }
    }
}
