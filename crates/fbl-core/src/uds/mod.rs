//! UDS (ISO 14229) protocol constants and response framing

mod nrc;

pub use nrc::NegativeResponseCode;

/// Positive responses echo the request SID with this bit set.
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// Bit 7 of a sub-function byte: suppress positive response.
pub const SUPPRESS_POSITIVE_RESPONSE: u8 = 0x80;

/// UDS Service IDs handled by the bootloader
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const COMMUNICATION_CONTROL: u8 = 0x28;
    pub const WRITE_DATA_BY_ID: u8 = 0x2E;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const CONTROL_DTC_SETTING: u8 = 0x85;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// DiagnosticSessionControl (0x10) sub-functions
pub mod session_type {
    pub const DEFAULT: u8 = 0x01;
    pub const PROGRAMMING: u8 = 0x02;
    pub const EXTENDED: u8 = 0x03;
}

/// ECUReset (0x11) sub-functions
pub mod reset_type {
    /// Hard reset - complete shutdown and restart of ECU
    pub const HARD_RESET: u8 = 0x01;
    /// Soft reset - application-level restart
    pub const SOFT_RESET: u8 = 0x03;
}

/// SecurityAccess (0x27) sub-functions
pub mod security_sub_function {
    pub const REQUEST_SEED: u8 = 0x01;
    pub const SEND_KEY: u8 = 0x02;
}

/// RoutineControl (0x31) sub-functions
pub mod routine_sub_function {
    /// Start routine
    pub const START_ROUTINE: u8 = 0x01;
    /// Request routine results
    pub const REQUEST_ROUTINE_RESULTS: u8 = 0x03;
}

/// Routine identifiers of the reprogramming sequence
pub mod routine_id {
    /// Erase memory: `ALFID address size`
    pub const ERASE_MEMORY: u16 = 0xFF00;
    /// Check programming dependencies across all logical blocks
    pub const CHECK_PROGRAMMING_DEPENDENCIES: u16 = 0xFF01;
    /// Check memory: compare the transferred data against the tester's value
    pub const CHECK_MEMORY: u16 = 0x0202;
    /// Check programming preconditions (voltage, vehicle state, ...)
    pub const CHECK_PROGRAMMING_PRECONDITIONS: u16 = 0x0203;
}

/// Data identifiers served by ReadDataByIdentifier / WriteDataByIdentifier
pub mod data_id {
    /// Fingerprint staged for the next programmed block (write)
    pub const FINGERPRINT: u16 = 0xF15A;
    /// Stored fingerprints of all logical blocks (read)
    pub const BLOCK_FINGERPRINTS: u16 = 0xF15B;
    /// Programming counters and attempts of all logical blocks (read)
    pub const PROGRAMMING_COUNTERS: u16 = 0xF15C;
    /// Active diagnostic session (read)
    pub const ACTIVE_DIAGNOSTIC_SESSION: u16 = 0xF186;
}

/// Create a positive response for a service
pub fn positive_response(service_id: u8, data: &[u8]) -> Vec<u8> {
    let mut response = Vec::with_capacity(1 + data.len());
    response.push(service_id | POSITIVE_RESPONSE_OFFSET);
    response.extend_from_slice(data);
    response
}

/// Create a negative response
pub fn negative_response(service_id: u8, nrc: NegativeResponseCode) -> Vec<u8> {
    vec![service_id::NEGATIVE_RESPONSE, service_id, nrc.into()]
}

/// Decoded `addressAndLengthFormatIdentifier` followed by its address and size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub address: u32,
    pub length: u32,
}

/// Parse `ALFID address size` starting at `data[0]`.
///
/// Returns the range and the number of bytes consumed. Address and size
/// fields wider than four bytes cannot address this ECU and are rejected
/// with `RequestOutOfRange`, as is a zero-width field.
pub fn parse_memory_range(data: &[u8]) -> Result<(MemoryRange, usize), NegativeResponseCode> {
    let alfid = *data
        .first()
        .ok_or(NegativeResponseCode::IncorrectMessageLengthOrFormat)?;
    let size_len = ((alfid >> 4) & 0x0F) as usize;
    let addr_len = (alfid & 0x0F) as usize;

    if size_len == 0 || addr_len == 0 || size_len > 4 || addr_len > 4 {
        return Err(NegativeResponseCode::RequestOutOfRange);
    }

    let consumed = 1 + addr_len + size_len;
    if data.len() < consumed {
        return Err(NegativeResponseCode::IncorrectMessageLengthOrFormat);
    }

    let address = be_u32(&data[1..1 + addr_len]);
    let length = be_u32(&data[1 + addr_len..consumed]);

    Ok((MemoryRange { address, length }, consumed))
}

fn be_u32(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |acc, byte| (acc << 8) | *byte as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_response_framing() {
        assert_eq!(positive_response(0x36, &[0x01]), vec![0x76, 0x01]);
        assert_eq!(
            negative_response(0x36, NegativeResponseCode::WrongBlockSequenceCounter),
            vec![0x7F, 0x36, 0x73]
        );
    }

    #[test]
    fn test_parse_memory_range() {
        let data = [0x44, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0xAA];
        let (range, consumed) = parse_memory_range(&data).unwrap();
        assert_eq!(range.address, 0x0001_0000);
        assert_eq!(range.length, 0x1000);
        assert_eq!(consumed, 9);
    }

    #[test]
    fn test_parse_memory_range_short_fields() {
        let data = [0x12, 0x80, 0x00, 0x40];
        let (range, consumed) = parse_memory_range(&data).unwrap();
        assert_eq!(range.address, 0x8000);
        assert_eq!(range.length, 0x40);
        assert_eq!(consumed, 4);
    }

    #[test]
    fn test_parse_memory_range_rejects_bad_format() {
        assert_eq!(
            parse_memory_range(&[0x50, 0x00]),
            Err(NegativeResponseCode::RequestOutOfRange)
        );
        assert_eq!(
            parse_memory_range(&[0x44, 0x00, 0x01]),
            Err(NegativeResponseCode::IncorrectMessageLengthOrFormat)
        );
        assert_eq!(
            parse_memory_range(&[]),
            Err(NegativeResponseCode::IncorrectMessageLengthOrFormat)
        );
    }
}
