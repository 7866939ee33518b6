//! Entry-type and error code tables.
//!
//! Odd entry-type codes are requests or packets, the following even code is
//! the matching response. Codes below 500 may be used before a session is
//! established.

use std::fmt;

/// Operation code carried by a `MessageEntry`.
///
/// Kept as an open newtype so codes this crate does not know about still
/// pass through to the transport parent untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageEntryType(pub u16);

impl MessageEntryType {
    pub const NULL: Self = Self(0);

    // Transport-only
    pub const STREAM_OP: Self = Self(1);
    pub const STREAM_OP_RET: Self = Self(2);
    pub const STREAM_CHECK_CAPABILITY: Self = Self(3);
    pub const STREAM_CHECK_CAPABILITY_RET: Self = Self(4);
    pub const STRING_TABLE_OP: Self = Self(5);
    pub const STRING_TABLE_OP_RET: Self = Self(6);

    // Node level
    pub const GET_SERVICE_DESC: Self = Self(101);
    pub const GET_SERVICE_DESC_RET: Self = Self(102);
    pub const OBJECT_TYPE_NAME: Self = Self(103);
    pub const OBJECT_TYPE_NAME_RET: Self = Self(104);
    pub const SERVICE_CLOSED: Self = Self(105);
    pub const SERVICE_CLOSED_RET: Self = Self(106);
    pub const CONNECT_CLIENT: Self = Self(107);
    pub const CONNECT_CLIENT_RET: Self = Self(108);
    pub const DISCONNECT_CLIENT: Self = Self(109);
    pub const DISCONNECT_CLIENT_RET: Self = Self(110);
    pub const CONNECTION_TEST: Self = Self(111);
    pub const CONNECTION_TEST_RET: Self = Self(112);
    pub const GET_NODE_INFO: Self = Self(113);
    pub const GET_NODE_INFO_RET: Self = Self(114);
    pub const RECONNECT_CLIENT: Self = Self(115);
    pub const RECONNECT_CLIENT_RET: Self = Self(116);
    pub const NODE_CHECK_CAPABILITY: Self = Self(117);
    pub const NODE_CHECK_CAPABILITY_RET: Self = Self(118);
    pub const GET_SERVICE_ATTRIBUTES: Self = Self(119);
    pub const GET_SERVICE_ATTRIBUTES_RET: Self = Self(120);
    pub const CONNECT_CLIENT_COMBINED: Self = Self(121);
    pub const CONNECT_CLIENT_COMBINED_RET: Self = Self(122);

    // Endpoint / session level
    pub const ENDPOINT_CHECK_CAPABILITY: Self = Self(501);
    pub const ENDPOINT_CHECK_CAPABILITY_RET: Self = Self(502);
    pub const SERVICE_CHECK_CAPABILITY_REQ: Self = Self(1101);
    pub const SERVICE_CHECK_CAPABILITY_RET: Self = Self(1102);
    pub const CLIENT_KEEP_ALIVE_REQ: Self = Self(1105);
    pub const CLIENT_KEEP_ALIVE_RET: Self = Self(1106);
    pub const CLIENT_SESSION_OP_REQ: Self = Self(1107);
    pub const CLIENT_SESSION_OP_RET: Self = Self(1108);
    pub const SERVICE_PATH_RELEASED_REQ: Self = Self(1109);
    pub const SERVICE_PATH_RELEASED_RET: Self = Self(1110);

    // Member level
    pub const PROPERTY_GET_REQ: Self = Self(1111);
    pub const PROPERTY_GET_RES: Self = Self(1112);
    pub const PROPERTY_SET_REQ: Self = Self(1113);
    pub const PROPERTY_SET_RES: Self = Self(1114);
    pub const FUNCTION_CALL_REQ: Self = Self(1121);
    pub const FUNCTION_CALL_RES: Self = Self(1122);
    pub const GENERATOR_NEXT_REQ: Self = Self(1123);
    pub const GENERATOR_NEXT_RES: Self = Self(1124);
    pub const EVENT_REQ: Self = Self(1131);
    pub const EVENT_RES: Self = Self(1132);
    pub const PIPE_PACKET: Self = Self(1141);
    pub const PIPE_PACKET_RET: Self = Self(1142);
    pub const PIPE_CONNECT_REQ: Self = Self(1143);
    pub const PIPE_CONNECT_RET: Self = Self(1144);
    pub const PIPE_DISCONNECT_REQ: Self = Self(1145);
    pub const PIPE_DISCONNECT_RET: Self = Self(1146);
    pub const PIPE_CLOSED: Self = Self(1147);
    pub const PIPE_CLOSED_RET: Self = Self(1148);
    pub const CALLBACK_CALL_REQ: Self = Self(1151);
    pub const CALLBACK_CALL_RET: Self = Self(1152);
    pub const WIRE_PACKET: Self = Self(1161);
    pub const WIRE_PACKET_RET: Self = Self(1162);
    pub const WIRE_CONNECT_REQ: Self = Self(1163);
    pub const WIRE_CONNECT_RET: Self = Self(1164);
    pub const WIRE_DISCONNECT_REQ: Self = Self(1165);
    pub const WIRE_DISCONNECT_RET: Self = Self(1166);
    pub const WIRE_CLOSED: Self = Self(1167);
    pub const WIRE_CLOSED_RET: Self = Self(1168);
    pub const MEMORY_READ: Self = Self(1171);
    pub const MEMORY_READ_RET: Self = Self(1172);
    pub const MEMORY_WRITE: Self = Self(1173);
    pub const MEMORY_WRITE_RET: Self = Self(1174);
    pub const MEMORY_GET_PARAM: Self = Self(1175);
    pub const MEMORY_GET_PARAM_RET: Self = Self(1176);
    pub const WIRE_PEEK_IN_VALUE_REQ: Self = Self(1181);
    pub const WIRE_PEEK_IN_VALUE_RET: Self = Self(1182);
    pub const WIRE_PEEK_OUT_VALUE_REQ: Self = Self(1183);
    pub const WIRE_PEEK_OUT_VALUE_RET: Self = Self(1184);
    pub const WIRE_POKE_OUT_VALUE_REQ: Self = Self(1185);
    pub const WIRE_POKE_OUT_VALUE_RET: Self = Self(1186);

    /// Raw wire code.
    #[inline]
    pub fn code(self) -> u16 {
        self.0
    }

    /// Odd codes are requests or packets.
    #[inline]
    pub fn is_request(self) -> bool {
        self.0 % 2 == 1
    }

    /// Matching response code (`type + 1`).
    #[inline]
    pub fn response_type(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Usable before a session is established.
    #[inline]
    pub fn is_pre_session(self) -> bool {
        self.0 < 500
    }
}

impl fmt::Display for MessageEntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error code carried by a `MessageEntry` (0 = success).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u16)]
pub enum MessageErrorType {
    #[default]
    None = 0,
    ConnectionError = 1,
    ProtocolError = 2,
    ServiceNotFound = 3,
    ObjectNotFound = 4,
    InvalidEndpoint = 5,
    EndpointCommunicationFatalError = 6,
    NodeNotFound = 7,
    ServiceError = 8,
    MemberNotFound = 9,
    MemberFormatMismatch = 10,
    DataTypeMismatch = 11,
    DataTypeError = 12,
    DataSerializationError = 13,
    MessageEntryNotFound = 14,
    MessageElementNotFound = 15,
    UnknownError = 16,
    InvalidOperation = 17,
    InvalidArgument = 18,
    OperationFailed = 19,
    NullValue = 20,
    InternalError = 21,
    SystemResourcePermissionDenied = 22,
    OutOfSystemResource = 23,
    SystemResourceError = 24,
    ResourceNotFound = 25,
    IoError = 26,
    BufferLimitViolation = 27,
    ServiceDefinitionError = 28,
    OutOfRange = 29,
    KeyNotFound = 30,
    InvalidConfiguration = 31,
    InvalidState = 32,
    RemoteError = 100,
    RequestTimeout = 101,
    ReadOnlyMember = 102,
    WriteOnlyMember = 103,
    NotImplementedError = 104,
    MemberBusy = 105,
    ValueNotSet = 106,
    AbortOperation = 107,
    OperationAborted = 108,
    StopIteration = 109,
    OperationTimeout = 110,
    OperationCancelled = 111,
    AuthenticationError = 150,
    ObjectLockedError = 151,
    PermissionDenied = 152,
}

impl MessageErrorType {
    /// Decode a wire error code; unknown codes map to `UnknownError`.
    pub fn from_code(code: u16) -> Self {
        use MessageErrorType::*;
        match code {
            0 => None,
            1 => ConnectionError,
            2 => ProtocolError,
            3 => ServiceNotFound,
            4 => ObjectNotFound,
            5 => InvalidEndpoint,
            6 => EndpointCommunicationFatalError,
            7 => NodeNotFound,
            8 => ServiceError,
            9 => MemberNotFound,
            10 => MemberFormatMismatch,
            11 => DataTypeMismatch,
            12 => DataTypeError,
            13 => DataSerializationError,
            14 => MessageEntryNotFound,
            15 => MessageElementNotFound,
            17 => InvalidOperation,
            18 => InvalidArgument,
            19 => OperationFailed,
            20 => NullValue,
            21 => InternalError,
            22 => SystemResourcePermissionDenied,
            23 => OutOfSystemResource,
            24 => SystemResourceError,
            25 => ResourceNotFound,
            26 => IoError,
            27 => BufferLimitViolation,
            28 => ServiceDefinitionError,
            29 => OutOfRange,
            30 => KeyNotFound,
            31 => InvalidConfiguration,
            32 => InvalidState,
            100 => RemoteError,
            101 => RequestTimeout,
            102 => ReadOnlyMember,
            103 => WriteOnlyMember,
            104 => NotImplementedError,
            105 => MemberBusy,
            106 => ValueNotSet,
            107 => AbortOperation,
            108 => OperationAborted,
            109 => StopIteration,
            110 => OperationTimeout,
            111 => OperationCancelled,
            150 => AuthenticationError,
            151 => ObjectLockedError,
            152 => PermissionDenied,
            _ => UnknownError,
        }
    }

    /// Wire code.
    #[inline]
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Qualified error name sent in the `errorname` element of error replies.
    pub fn name(self) -> &'static str {
        use MessageErrorType::*;
        match self {
            None => "RobotRaconteur.None",
            ConnectionError => "RobotRaconteur.ConnectionError",
            ProtocolError => "RobotRaconteur.ProtocolError",
            ServiceNotFound => "RobotRaconteur.ServiceNotFound",
            ObjectNotFound => "RobotRaconteur.ObjectNotFound",
            InvalidEndpoint => "RobotRaconteur.InvalidEndpoint",
            EndpointCommunicationFatalError => "RobotRaconteur.EndpointCommunicationFatalError",
            NodeNotFound => "RobotRaconteur.NodeNotFound",
            ServiceError => "RobotRaconteur.ServiceError",
            MemberNotFound => "RobotRaconteur.MemberNotFound",
            MemberFormatMismatch => "RobotRaconteur.MemberFormatMismatch",
            DataTypeMismatch => "RobotRaconteur.DataTypeMismatch",
            DataTypeError => "RobotRaconteur.DataTypeError",
            DataSerializationError => "RobotRaconteur.DataSerializationError",
            MessageEntryNotFound => "RobotRaconteur.MessageEntryNotFound",
            MessageElementNotFound => "RobotRaconteur.MessageElementNotFound",
            UnknownError => "RobotRaconteur.UnknownError",
            InvalidOperation => "RobotRaconteur.InvalidOperation",
            InvalidArgument => "RobotRaconteur.InvalidArgument",
            OperationFailed => "RobotRaconteur.OperationFailed",
            NullValue => "RobotRaconteur.NullValue",
            InternalError => "RobotRaconteur.InternalError",
            SystemResourcePermissionDenied => "RobotRaconteur.SystemResourcePermissionDenied",
            OutOfSystemResource => "RobotRaconteur.OutOfSystemResource",
            SystemResourceError => "RobotRaconteur.SystemResourceError",
            ResourceNotFound => "RobotRaconteur.ResourceNotFound",
            IoError => "RobotRaconteur.IOError",
            BufferLimitViolation => "RobotRaconteur.BufferLimitViolation",
            ServiceDefinitionError => "RobotRaconteur.ServiceDefinitionError",
            OutOfRange => "RobotRaconteur.OutOfRange",
            KeyNotFound => "RobotRaconteur.KeyNotFound",
            InvalidConfiguration => "RobotRaconteur.InvalidConfiguration",
            InvalidState => "RobotRaconteur.InvalidState",
            RemoteError => "RobotRaconteur.RemoteError",
            RequestTimeout => "RobotRaconteur.RequestTimeout",
            ReadOnlyMember => "RobotRaconteur.ReadOnlyMember",
            WriteOnlyMember => "RobotRaconteur.WriteOnlyMember",
            NotImplementedError => "RobotRaconteur.NotImplementedError",
            MemberBusy => "RobotRaconteur.MemberBusy",
            ValueNotSet => "RobotRaconteur.ValueNotSet",
            AbortOperation => "RobotRaconteur.AbortOperation",
            OperationAborted => "RobotRaconteur.OperationAborted",
            StopIteration => "RobotRaconteur.StopIteration",
            OperationTimeout => "RobotRaconteur.OperationTimeout",
            OperationCancelled => "RobotRaconteur.OperationCancelled",
            AuthenticationError => "RobotRaconteur.AuthenticationError",
            ObjectLockedError => "RobotRaconteur.ObjectLockedError",
            PermissionDenied => "RobotRaconteur.PermissionDenied",
        }
    }
}
