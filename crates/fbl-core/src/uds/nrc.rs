//! UDS Negative Response Codes (NRC)

use std::fmt;

/// UDS Negative Response Codes (NRC)
///
/// Only the codes a flash bootloader can emit are named; anything else a
/// caller hands in survives as [`NegativeResponseCode::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegativeResponseCode {
    // General NRCs
    GeneralReject,
    ServiceNotSupported,
    SubFunctionNotSupported,
    IncorrectMessageLengthOrFormat,
    ResponseTooLong,

    // Condition NRCs
    BusyRepeatRequest,
    ConditionsNotCorrect,

    // Sequence NRCs
    RequestSequenceError,

    // Request NRCs
    RequestOutOfRange,
    SecurityAccessDenied,
    InvalidKey,
    ExceededNumberOfAttempts,
    RequiredTimeDelayNotExpired,

    // Upload/Download NRCs
    UploadDownloadNotAccepted,
    TransferDataSuspended,
    GeneralProgrammingFailure,
    WrongBlockSequenceCounter,

    /// RCRRP: request correctly received, response pending
    ResponsePending,

    // Session NRCs
    SubFunctionNotSupportedInActiveSession,
    ServiceNotSupportedInActiveSession,

    // Vehicle conditions reported by the programming preconditions hook
    VoltageTooHigh,
    VoltageTooLow,

    /// Unknown/reserved NRC
    Unknown(u8),
}

impl From<u8> for NegativeResponseCode {
    fn from(value: u8) -> Self {
        match value {
            0x10 => Self::GeneralReject,
            0x11 => Self::ServiceNotSupported,
            0x12 => Self::SubFunctionNotSupported,
            0x13 => Self::IncorrectMessageLengthOrFormat,
            0x14 => Self::ResponseTooLong,
            0x21 => Self::BusyRepeatRequest,
            0x22 => Self::ConditionsNotCorrect,
            0x24 => Self::RequestSequenceError,
            0x31 => Self::RequestOutOfRange,
            0x33 => Self::SecurityAccessDenied,
            0x35 => Self::InvalidKey,
            0x36 => Self::ExceededNumberOfAttempts,
            0x37 => Self::RequiredTimeDelayNotExpired,
            0x70 => Self::UploadDownloadNotAccepted,
            0x71 => Self::TransferDataSuspended,
            0x72 => Self::GeneralProgrammingFailure,
            0x73 => Self::WrongBlockSequenceCounter,
            0x78 => Self::ResponsePending,
            0x7E => Self::SubFunctionNotSupportedInActiveSession,
            0x7F => Self::ServiceNotSupportedInActiveSession,
            0x92 => Self::VoltageTooHigh,
            0x93 => Self::VoltageTooLow,
            other => Self::Unknown(other),
        }
    }
}

impl From<NegativeResponseCode> for u8 {
    fn from(nrc: NegativeResponseCode) -> Self {
        match nrc {
            NegativeResponseCode::GeneralReject => 0x10,
            NegativeResponseCode::ServiceNotSupported => 0x11,
            NegativeResponseCode::SubFunctionNotSupported => 0x12,
            NegativeResponseCode::IncorrectMessageLengthOrFormat => 0x13,
            NegativeResponseCode::ResponseTooLong => 0x14,
            NegativeResponseCode::BusyRepeatRequest => 0x21,
            NegativeResponseCode::ConditionsNotCorrect => 0x22,
            NegativeResponseCode::RequestSequenceError => 0x24,
            NegativeResponseCode::RequestOutOfRange => 0x31,
            NegativeResponseCode::SecurityAccessDenied => 0x33,
            NegativeResponseCode::InvalidKey => 0x35,
            NegativeResponseCode::ExceededNumberOfAttempts => 0x36,
            NegativeResponseCode::RequiredTimeDelayNotExpired => 0x37,
            NegativeResponseCode::UploadDownloadNotAccepted => 0x70,
            NegativeResponseCode::TransferDataSuspended => 0x71,
            NegativeResponseCode::GeneralProgrammingFailure => 0x72,
            NegativeResponseCode::WrongBlockSequenceCounter => 0x73,
            NegativeResponseCode::ResponsePending => 0x78,
            NegativeResponseCode::SubFunctionNotSupportedInActiveSession => 0x7E,
            NegativeResponseCode::ServiceNotSupportedInActiveSession => 0x7F,
            NegativeResponseCode::VoltageTooHigh => 0x92,
            NegativeResponseCode::VoltageTooLow => 0x93,
            NegativeResponseCode::Unknown(v) => v,
        }
    }
}

impl fmt::UpperHex for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value: u8 = (*self).into();
        fmt::UpperHex::fmt(&value, f)
    }
}

impl fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(v) => write!(f, "Unknown(0x{:02X})", v),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0x13, NegativeResponseCode::IncorrectMessageLengthOrFormat)]
    #[case(0x24, NegativeResponseCode::RequestSequenceError)]
    #[case(0x33, NegativeResponseCode::SecurityAccessDenied)]
    #[case(0x37, NegativeResponseCode::RequiredTimeDelayNotExpired)]
    #[case(0x71, NegativeResponseCode::TransferDataSuspended)]
    #[case(0x73, NegativeResponseCode::WrongBlockSequenceCounter)]
    #[case(0x78, NegativeResponseCode::ResponsePending)]
    #[case(0x7F, NegativeResponseCode::ServiceNotSupportedInActiveSession)]
    fn test_known_codes(#[case] byte: u8, #[case] nrc: NegativeResponseCode) {
        assert_eq!(NegativeResponseCode::from(byte), nrc);
        assert_eq!(u8::from(nrc), byte);
    }

    #[test]
    fn test_unknown_code_is_preserved() {
        let nrc = NegativeResponseCode::from(0x99);
        assert_eq!(nrc, NegativeResponseCode::Unknown(0x99));
        assert_eq!(u8::from(nrc), 0x99);
        assert_eq!(nrc.to_string(), "Unknown(0x99)");
    }

    #[test]
    fn test_display_and_hex() {
        let nrc = NegativeResponseCode::WrongBlockSequenceCounter;
        assert_eq!(nrc.to_string(), "WrongBlockSequenceCounter");
        assert_eq!(format!("0x{:02X}", nrc), "0x73");
    }
}
