/// The closed set of wire message kinds.
///
/// `Unknown` is not emitted by this implementation; it exists so that an
/// out-of-range `kind` value read off the wire can be mapped to something
/// before being rejected as a [`crate::ProtocolError::UnknownKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    Unknown = 0,
    SendAndWaitRequest = 1,
    SendAndWaitResponse = 2,
    CreateCommandRequest = 3,
    CreateCommandResponse = 4,
    DisposeCommand = 5,
    CreateCommandException = 6,
    ExecuteNonQueryRequest = 7,
    ExecuteNonQueryResponse = 8,
    ExecuteNonQueryException = 9,
    ExecuteReaderRequest = 10,
    ExecuteReaderReadRequest = 11,
    ExecuteReaderGetOrdinalRequest = 12,
    ExecuteReaderGetStringRequest = 13,
    ExecuteReaderGetInt16Request = 14,
    ExecuteReaderGetInt32Request = 15,
    ExecuteReaderGetInt64Request = 16,
    ExecuteReaderGetFieldTypeRequest = 17,
    ExecuteReaderResponse = 18,
    ExecuteReaderException = 19,
}

impl MessageKind {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Unknown,
            1 => Self::SendAndWaitRequest,
            2 => Self::SendAndWaitResponse,
            3 => Self::CreateCommandRequest,
            4 => Self::CreateCommandResponse,
            5 => Self::DisposeCommand,
            6 => Self::CreateCommandException,
            7 => Self::ExecuteNonQueryRequest,
            8 => Self::ExecuteNonQueryResponse,
            9 => Self::ExecuteNonQueryException,
            10 => Self::ExecuteReaderRequest,
            11 => Self::ExecuteReaderReadRequest,
            12 => Self::ExecuteReaderGetOrdinalRequest,
            13 => Self::ExecuteReaderGetStringRequest,
            14 => Self::ExecuteReaderGetInt16Request,
            15 => Self::ExecuteReaderGetInt32Request,
            16 => Self::ExecuteReaderGetInt64Request,
            17 => Self::ExecuteReaderGetFieldTypeRequest,
            18 => Self::ExecuteReaderResponse,
            19 => Self::ExecuteReaderException,
            _ => return None,
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}
