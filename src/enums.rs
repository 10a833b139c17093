/// SDO abort codes, carried little-endian in the data bytes of an abort frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum AbortCode {
    ToggleBitNotAlternated = 0x0503_0000,
    SdoProtocolTimedOut = 0x0504_0000,
    InvalidClientServerCommandSpecifier = 0x0504_0001,
    InvalidBlockSize = 0x0504_0002,
    InvalidSequenceNumber = 0x0504_0003,
    CrcError = 0x0504_0004,
    OutOfMemory = 0x0504_0005,
    UnsupportedAccessToObject = 0x0601_0000,
    AttemptToReadWriteOnlyObject = 0x0601_0001,
    AttemptToWriteReadOnlyObject = 0x0601_0002,
    ObjectNotInDictionary = 0x0602_0000,
    ObjectCannotBeMappedToPdo = 0x0604_0041,
    ExceedPdoLength = 0x0604_0042,
    GeneralParameterIncompatibility = 0x0604_0043,
    GeneralInternalIncompatibility = 0x0604_0047,
    HardwareError = 0x0606_0000,
    DataTypeMismatchLengthMismatch = 0x0607_0010,
    DataTypeMismatchLengthTooHigh = 0x0607_0012,
    DataTypeMismatchLengthTooLow = 0x0607_0013,
    SubIndexDoesNotExist = 0x0609_0011,
    InvalidValueForParameter = 0x0609_0030,
    ValueTooHigh = 0x0609_0031,
    ValueTooLow = 0x0609_0032,
    MaxLessThanMin = 0x0609_0036,
    ResourceNotAvailable = 0x060A_0023,
    GeneralError = 0x0800_0000,
    DataTransferOrStorageFailed = 0x0800_0020,
    LocalControlPreventsDataTransfer = 0x0800_0021,
    DeviceStatePreventsDataTransfer = 0x0800_0022,
    ObjectDictionaryGenerationFailed = 0x0800_0023,
    NoDataAvailable = 0x0800_0024,
}

impl AbortCode {
    const ALL: [AbortCode; 31] = [
        Self::ToggleBitNotAlternated,
        Self::SdoProtocolTimedOut,
        Self::InvalidClientServerCommandSpecifier,
        Self::InvalidBlockSize,
        Self::InvalidSequenceNumber,
        Self::CrcError,
        Self::OutOfMemory,
        Self::UnsupportedAccessToObject,
        Self::AttemptToReadWriteOnlyObject,
        Self::AttemptToWriteReadOnlyObject,
        Self::ObjectNotInDictionary,
        Self::ObjectCannotBeMappedToPdo,
        Self::ExceedPdoLength,
        Self::GeneralParameterIncompatibility,
        Self::GeneralInternalIncompatibility,
        Self::HardwareError,
        Self::DataTypeMismatchLengthMismatch,
        Self::DataTypeMismatchLengthTooHigh,
        Self::DataTypeMismatchLengthTooLow,
        Self::SubIndexDoesNotExist,
        Self::InvalidValueForParameter,
        Self::ValueTooHigh,
        Self::ValueTooLow,
        Self::MaxLessThanMin,
        Self::ResourceNotAvailable,
        Self::GeneralError,
        Self::DataTransferOrStorageFailed,
        Self::LocalControlPreventsDataTransfer,
        Self::DeviceStatePreventsDataTransfer,
        Self::ObjectDictionaryGenerationFailed,
        Self::NoDataAvailable,
    ];

    pub fn decode(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|abort| abort.encode() == code)
    }

    pub fn encode(self) -> u32 {
        self as u32
    }

    /// Human readable text for a raw abort code, including unknown ones.
    pub fn describe(code: u32) -> &'static str {
        Self::decode(code).map_or("Unknown abort code", Self::description)
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::ToggleBitNotAlternated => "Toggle bit not alternated",
            Self::SdoProtocolTimedOut => "SDO protocol timed out",
            Self::InvalidClientServerCommandSpecifier => {
                "Client/server command specifier not valid or unknown"
            }
            Self::InvalidBlockSize => "Invalid block size",
            Self::InvalidSequenceNumber => "Invalid sequence number",
            Self::CrcError => "CRC error",
            Self::OutOfMemory => "Out of memory",
            Self::UnsupportedAccessToObject => "Unsupported access to an object",
            Self::AttemptToReadWriteOnlyObject => "Attempt to read a write only object",
            Self::AttemptToWriteReadOnlyObject => "Attempt to write a read only object",
            Self::ObjectNotInDictionary => "Object does not exist in the object dictionary",
            Self::ObjectCannotBeMappedToPdo => "Object cannot be mapped to the PDO",
            Self::ExceedPdoLength => "Number and length of mapped objects would exceed PDO length",
            Self::GeneralParameterIncompatibility => "General parameter incompatibility",
            Self::GeneralInternalIncompatibility => "General internal incompatibility in the device",
            Self::HardwareError => "Access failed due to a hardware error",
            Self::DataTypeMismatchLengthMismatch => "Data type does not match, length does not match",
            Self::DataTypeMismatchLengthTooHigh => "Data type does not match, length too high",
            Self::DataTypeMismatchLengthTooLow => "Data type does not match, length too low",
            Self::SubIndexDoesNotExist => "Sub-index does not exist",
            Self::InvalidValueForParameter => "Invalid value for parameter",
            Self::ValueTooHigh => "Value of parameter written too high",
            Self::ValueTooLow => "Value of parameter written too low",
            Self::MaxLessThanMin => "Maximum value is less than minimum value",
            Self::ResourceNotAvailable => "Resource not available: SDO connection",
            Self::GeneralError => "General error",
            Self::DataTransferOrStorageFailed => "Data cannot be transferred or stored",
            Self::LocalControlPreventsDataTransfer => {
                "Data cannot be transferred or stored because of local control"
            }
            Self::DeviceStatePreventsDataTransfer => {
                "Data cannot be transferred or stored because of the present device state"
            }
            Self::ObjectDictionaryGenerationFailed => {
                "Object dictionary dynamic generation failed or no object dictionary present"
            }
            Self::NoDataAvailable => "No data available",
        }
    }
}

/// Error class of an emergency error code, taken from its upper byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmergencyErrorCode {
    ErrorResetOrNoError,
    GenericError,
    Current,
    Voltage,
    Temperature,
    DeviceHardware,
    DeviceSoftware,
    AdditionalModules,
    Monitoring,
    Communication,
    ProtocolError,
    ExternalError,
    AdditionalFunctions,
    DeviceSpecific,
    Reserved,
}

impl EmergencyErrorCode {
    pub fn decode(code: u16) -> Self {
        match code >> 8 {
            0x00 => Self::ErrorResetOrNoError,
            0x10 => Self::GenericError,
            0x20..=0x2F => Self::Current,
            0x30..=0x3F => Self::Voltage,
            0x40..=0x4F => Self::Temperature,
            0x50..=0x5F => Self::DeviceHardware,
            0x60..=0x6F => Self::DeviceSoftware,
            0x70..=0x7F => Self::AdditionalModules,
            0x81 => Self::Communication,
            0x82 => Self::ProtocolError,
            0x80..=0x8F => Self::Monitoring,
            0x90..=0x9F => Self::ExternalError,
            0xF0 => Self::AdditionalFunctions,
            0xFF => Self::DeviceSpecific,
            _ => Self::Reserved,
        }
    }
}

/// Bits of the error register (object 0x1001) echoed in every emergency.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmergencyErrorRegister {
    GenericError,
    Current,
    Voltage,
    Temperature,
    CommunicationError,
    DeviceProfileSpecific,
    Reserved,
    ManufacturerSpecific,
}

impl EmergencyErrorRegister {
    const BITS: [(u8, EmergencyErrorRegister); 8] = [
        (0x01, Self::GenericError),
        (0x02, Self::Current),
        (0x04, Self::Voltage),
        (0x08, Self::Temperature),
        (0x10, Self::CommunicationError),
        (0x20, Self::DeviceProfileSpecific),
        (0x40, Self::Reserved),
        (0x80, Self::ManufacturerSpecific),
    ];

    pub fn decode(register: u8) -> Vec<Self> {
        Self::BITS
            .iter()
            .filter(|(bit, _)| register & bit != 0)
            .map(|(_, error)| *error)
            .collect()
    }

    pub fn encode(errors: &[EmergencyErrorRegister]) -> u8 {
        Self::BITS
            .iter()
            .filter(|(_, error)| errors.contains(error))
            .fold(0, |register, (bit, _)| register | bit)
    }
}
