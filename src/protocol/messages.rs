// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire messages.
//!
//! Every frame carries exactly one [`SatMessage`]. The variant is the
//! discriminant; [`MessageType`] is the fixed code table used on the wire.
//! Decode sites match exhaustively on the variant, so adding a message kind
//! is a compile error everywhere it is not handled.

use crate::error::{ErrorCode, Result, SyncError};

/// Declares a wire enum with a `u32` code and a fallible `from_code`.
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $code:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn code(&self) -> u32 {
                match self {
                    $(Self::$variant => $code),+
                }
            }

            pub fn from_code(code: u32) -> Result<Self> {
                match code {
                    $($code => Ok(Self::$variant),)+
                    other => Err(SyncError::protocol_violation(format!(
                        concat!("unknown ", stringify!($name), " code {}"),
                        other
                    ))),
                }
            }
        }
    };
}

// =============================================================================
// Type code table
// =============================================================================

wire_enum!(
    /// One-byte frame tag preceding every message body.
    MessageType {
        ErrorResp = 0,
        AuthReq = 1,
        AuthResp = 2,
        PingReq = 3,
        PingResp = 4,
        InStartReplicationReq = 5,
        InStartReplicationResp = 6,
        InStopReplicationReq = 7,
        InStopReplicationResp = 8,
        OpLog = 9,
        Relation = 10,
        MigrationNotification = 11,
        SubsReq = 12,
        SubsResp = 13,
        SubsDataError = 14,
        SubsDataBegin = 15,
        SubsDataEnd = 16,
        ShapeDataBegin = 17,
        ShapeDataEnd = 18,
        UnsubsReq = 19,
        UnsubsResp = 20,
        RpcRequest = 21,
        RpcResponse = 22,
        OpLogAck = 23,
    }
);

impl MessageType {
    pub fn from_byte(byte: u8) -> Result<Self> {
        Self::from_code(u32::from(byte)).map_err(|_| {
            SyncError::new(
                ErrorCode::UnexpectedMessageType,
                format!("unknown message type code {byte}"),
            )
        })
    }

    pub fn as_byte(&self) -> u8 {
        // Codes are below 24.
        self.code() as u8
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ErrorResp => "SatErrorResp",
            Self::AuthReq => "SatAuthReq",
            Self::AuthResp => "SatAuthResp",
            Self::PingReq => "SatPingReq",
            Self::PingResp => "SatPingResp",
            Self::InStartReplicationReq => "SatInStartReplicationReq",
            Self::InStartReplicationResp => "SatInStartReplicationResp",
            Self::InStopReplicationReq => "SatInStopReplicationReq",
            Self::InStopReplicationResp => "SatInStopReplicationResp",
            Self::OpLog => "SatOpLog",
            Self::Relation => "SatRelation",
            Self::MigrationNotification => "SatMigrationNotification",
            Self::SubsReq => "SatSubsReq",
            Self::SubsResp => "SatSubsResp",
            Self::SubsDataError => "SatSubsDataError",
            Self::SubsDataBegin => "SatSubsDataBegin",
            Self::SubsDataEnd => "SatSubsDataEnd",
            Self::ShapeDataBegin => "SatShapeDataBegin",
            Self::ShapeDataEnd => "SatShapeDataEnd",
            Self::UnsubsReq => "SatUnsubsReq",
            Self::UnsubsResp => "SatUnsubsResp",
            Self::RpcRequest => "SatRpcRequest",
            Self::RpcResponse => "SatRpcResponse",
            Self::OpLogAck => "SatOpLogAck",
        }
    }
}

// =============================================================================
// Error codes carried by messages
// =============================================================================

wire_enum!(
    ErrorRespCode {
        Internal = 0,
        AuthRequired = 1,
        AuthFailed = 2,
        ReplicationFailed = 3,
        InvalidRequest = 4,
        ProtoVsnMismatch = 5,
        SchemaVsnMismatch = 6,
    }
);

impl ErrorRespCode {
    pub fn to_error_code(self) -> ErrorCode {
        match self {
            Self::Internal => ErrorCode::Internal,
            Self::AuthRequired => ErrorCode::AuthRequired,
            Self::AuthFailed => ErrorCode::AuthFailed,
            Self::ReplicationFailed => ErrorCode::ReplicationFailed,
            Self::InvalidRequest => ErrorCode::InvalidRequest,
            Self::ProtoVsnMismatch => ErrorCode::ProtoVsnMismatch,
            Self::SchemaVsnMismatch => ErrorCode::UnknownSchemaVsn,
        }
    }
}

wire_enum!(
    StartReplicationErrorCode {
        Unspecified = 0,
        BehindWindow = 1,
        InvalidPosition = 2,
        SubscriptionNotFound = 3,
        MalformedLsn = 4,
        UnknownSchemaVsn = 5,
    }
);

impl StartReplicationErrorCode {
    pub fn to_error_code(self) -> ErrorCode {
        match self {
            Self::Unspecified => ErrorCode::Internal,
            Self::BehindWindow => ErrorCode::BehindWindow,
            Self::InvalidPosition => ErrorCode::InvalidPosition,
            Self::SubscriptionNotFound => ErrorCode::SubscriptionNotFound,
            Self::MalformedLsn => ErrorCode::MalformedLsn,
            Self::UnknownSchemaVsn => ErrorCode::UnknownSchemaVsn,
        }
    }
}

wire_enum!(
    SubsRespErrorCode {
        Unspecified = 0,
        SubscriptionIdAlreadyExists = 1,
        ShapeRequestError = 2,
    }
);

impl SubsRespErrorCode {
    pub fn to_error_code(self) -> ErrorCode {
        match self {
            Self::Unspecified => ErrorCode::SubscriptionError,
            Self::SubscriptionIdAlreadyExists => ErrorCode::SubscriptionIdAlreadyExists,
            Self::ShapeRequestError => ErrorCode::ShapeRequestError,
        }
    }
}

wire_enum!(
    ShapeReqErrorCode {
        Unspecified = 0,
        TableNotFound = 1,
        ReferentialIntegrityViolation = 2,
        EmptyShapeDefinition = 3,
        DuplicateTableInShapeDefinition = 4,
        InvalidWhereClause = 5,
        InvalidIncludeTree = 6,
    }
);

impl ShapeReqErrorCode {
    pub fn to_error_code(self) -> ErrorCode {
        match self {
            Self::TableNotFound => ErrorCode::TableNotFound,
            Self::ReferentialIntegrityViolation => ErrorCode::ReferentialIntegrityViolation,
            Self::EmptyShapeDefinition => ErrorCode::EmptyShapeDefinition,
            Self::DuplicateTableInShapeDefinition => ErrorCode::DuplicateTableInShapeDefinition,
            Self::Unspecified | Self::InvalidWhereClause | Self::InvalidIncludeTree => {
                ErrorCode::ShapeRequestError
            }
        }
    }
}

wire_enum!(
    SubsDataErrorCode {
        Unspecified = 0,
        ShapeDeliveryError = 1,
    }
);

wire_enum!(
    ShapeDataErrorCode {
        Unspecified = 0,
        ShapeSizeLimitExceeded = 1,
    }
);

wire_enum!(
    MigrationOpType {
        CreateTable = 0,
        CreateIndex = 1,
        AlterAddColumn = 6,
    }
);

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SatErrorResp {
    pub error_type: ErrorRespCode,
    pub lsn: Option<Vec<u8>>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatAuthHeader {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatAuthReq {
    pub id: String,
    pub token: String,
    pub headers: Vec<SatAuthHeader>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatAuthResp {
    pub id: String,
    pub headers: Vec<SatAuthHeader>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatPingResp {
    pub lsn: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatInStartReplicationReq {
    pub lsn: Vec<u8>,
    pub subscription_ids: Vec<String>,
    pub schema_version: Option<String>,
    pub observed_transaction_data: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReplicationError {
    pub code: StartReplicationErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatInStartReplicationResp {
    pub err: Option<StartReplicationError>,
    pub unacked_window_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatRelationColumn {
    pub name: String,
    pub type_name: String,
    /// 1-based position in the primary key.
    pub primary_key: Option<u32>,
    pub is_nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatRelation {
    pub schema_name: String,
    pub table_name: String,
    pub relation_id: u32,
    pub columns: Vec<SatRelationColumn>,
}

/// Encoded row: null bitmask plus one byte string per column.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatOpRow {
    pub nulls_bitmask: Vec<u8>,
    pub values: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatOpBegin {
    pub commit_timestamp: i64,
    pub lsn: Vec<u8>,
    pub origin: Option<String>,
    pub is_migration: bool,
    pub transaction_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatOpCommit {
    pub commit_timestamp: i64,
    pub lsn: Vec<u8>,
    pub transaction_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatOpInsert {
    pub relation_id: u32,
    pub row_data: SatOpRow,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatOpUpdate {
    pub relation_id: u32,
    pub row_data: SatOpRow,
    pub old_row_data: Option<SatOpRow>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatOpDelete {
    pub relation_id: u32,
    pub old_row_data: Option<SatOpRow>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatMigrationStmt {
    pub op_type: MigrationOpType,
    pub sql: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatMigrationColumn {
    pub name: String,
    pub sqlite_type: String,
    pub pg_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatMigrationForeignKey {
    pub fk_cols: Vec<String>,
    pub pk_table: String,
    pub pk_cols: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatMigrationTable {
    pub name: String,
    pub columns: Vec<SatMigrationColumn>,
    pub fks: Vec<SatMigrationForeignKey>,
    pub pks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatOpMigrate {
    pub version: String,
    pub stmts: Vec<SatMigrationStmt>,
    pub table: Option<SatMigrationTable>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatOpGone {
    pub relation_id: u32,
    pub pk_data: SatOpRow,
}

/// One operation inside an [`SatOpLog`] batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SatTransOp {
    Begin(SatOpBegin),
    Commit(SatOpCommit),
    Insert(SatOpInsert),
    Update(SatOpUpdate),
    Delete(SatOpDelete),
    Migrate(SatOpMigrate),
    Gone(SatOpGone),
    AdditionalBegin { reference: u64 },
    AdditionalCommit { reference: u64 },
}

impl SatTransOp {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Begin(_) => "begin",
            Self::Commit(_) => "commit",
            Self::Insert(_) => "insert",
            Self::Update(_) => "update",
            Self::Delete(_) => "delete",
            Self::Migrate(_) => "migrate",
            Self::Gone(_) => "gone",
            Self::AdditionalBegin { .. } => "additionalBegin",
            Self::AdditionalCommit { .. } => "additionalCommit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatOpLog {
    pub ops: Vec<SatTransOp>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatMigrationNotification {
    pub old_schema_version: String,
    pub new_schema_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatShapeSelect {
    pub tablename: String,
    pub where_clause: Option<String>,
    pub include: Vec<SatChildRelation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatChildRelation {
    pub foreign_key: Vec<String>,
    pub select: SatShapeSelect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatShapeRequest {
    pub request_id: String,
    pub selects: Vec<SatShapeSelect>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatSubsReq {
    pub subscription_id: String,
    pub shape_requests: Vec<SatShapeRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeRequestError {
    pub code: ShapeReqErrorCode,
    pub message: String,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsRespError {
    pub code: SubsRespErrorCode,
    pub message: String,
    pub shape_request_errors: Vec<ShapeRequestError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatSubsResp {
    pub subscription_id: String,
    pub err: Option<SubsRespError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeDataError {
    pub code: ShapeDataErrorCode,
    pub message: String,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatSubsDataError {
    pub code: SubsDataErrorCode,
    pub message: String,
    pub subscription_id: String,
    pub shape_request_errors: Vec<ShapeDataError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatSubsDataBegin {
    pub subscription_id: String,
    pub lsn: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatShapeDataBegin {
    pub request_id: String,
    pub uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatUnsubsReq {
    pub subscription_ids: Vec<String>,
}

/// Generic RPC envelope. `message` is a complete encoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatRpcRequest {
    pub method: String,
    pub request_id: u32,
    pub message: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RpcResult {
    Message(Vec<u8>),
    Error(SatErrorResp),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SatRpcResponse {
    pub method: String,
    pub request_id: u32,
    pub result: Option<RpcResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatOpLogAck {
    pub ack_timestamp: u64,
    pub lsn: Vec<u8>,
    pub transaction_id: u64,
    pub subscription_ids: Vec<String>,
    pub additional_data_source_ids: Vec<u64>,
    pub gone_subscription_ids: Vec<String>,
}

// =============================================================================
// SatMessage
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum SatMessage {
    ErrorResp(SatErrorResp),
    AuthReq(SatAuthReq),
    AuthResp(SatAuthResp),
    PingReq,
    PingResp(SatPingResp),
    InStartReplicationReq(SatInStartReplicationReq),
    InStartReplicationResp(SatInStartReplicationResp),
    InStopReplicationReq,
    InStopReplicationResp,
    OpLog(SatOpLog),
    Relation(SatRelation),
    MigrationNotification(SatMigrationNotification),
    SubsReq(SatSubsReq),
    SubsResp(SatSubsResp),
    SubsDataError(SatSubsDataError),
    SubsDataBegin(SatSubsDataBegin),
    SubsDataEnd,
    ShapeDataBegin(SatShapeDataBegin),
    ShapeDataEnd,
    UnsubsReq(SatUnsubsReq),
    UnsubsResp,
    RpcRequest(SatRpcRequest),
    RpcResponse(SatRpcResponse),
    OpLogAck(SatOpLogAck),
}

impl SatMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ErrorResp(_) => MessageType::ErrorResp,
            Self::AuthReq(_) => MessageType::AuthReq,
            Self::AuthResp(_) => MessageType::AuthResp,
            Self::PingReq => MessageType::PingReq,
            Self::PingResp(_) => MessageType::PingResp,
            Self::InStartReplicationReq(_) => MessageType::InStartReplicationReq,
            Self::InStartReplicationResp(_) => MessageType::InStartReplicationResp,
            Self::InStopReplicationReq => MessageType::InStopReplicationReq,
            Self::InStopReplicationResp => MessageType::InStopReplicationResp,
            Self::OpLog(_) => MessageType::OpLog,
            Self::Relation(_) => MessageType::Relation,
            Self::MigrationNotification(_) => MessageType::MigrationNotification,
            Self::SubsReq(_) => MessageType::SubsReq,
            Self::SubsResp(_) => MessageType::SubsResp,
            Self::SubsDataError(_) => MessageType::SubsDataError,
            Self::SubsDataBegin(_) => MessageType::SubsDataBegin,
            Self::SubsDataEnd => MessageType::SubsDataEnd,
            Self::ShapeDataBegin(_) => MessageType::ShapeDataBegin,
            Self::ShapeDataEnd => MessageType::ShapeDataEnd,
            Self::UnsubsReq(_) => MessageType::UnsubsReq,
            Self::UnsubsResp => MessageType::UnsubsResp,
            Self::RpcRequest(_) => MessageType::RpcRequest,
            Self::RpcResponse(_) => MessageType::RpcResponse,
            Self::OpLogAck(_) => MessageType::OpLogAck,
        }
    }

    pub fn name(&self) -> &'static str {
        self.message_type().name()
    }
}

impl SatErrorResp {
    pub fn new(error_type: ErrorRespCode, message: impl Into<String>) -> Self {
        Self {
            error_type,
            lsn: None,
            message: Some(message.into()),
        }
    }

    pub fn into_error(self) -> SyncError {
        SyncError::new(
            self.error_type.to_error_code(),
            self.message
                .unwrap_or_else(|| format!("server error {:?}", self.error_type)),
        )
    }
}

impl StartReplicationError {
    pub fn into_error(self) -> SyncError {
        SyncError::new(self.code.to_error_code(), self.message)
    }
}

impl SubsRespError {
    /// Collapse a subscription failure into one error, shape request
    /// details appended to the message.
    pub fn into_error(self) -> SyncError {
        let details: Vec<String> = self
            .shape_request_errors
            .iter()
            .map(|e| format!("{} ({}): {}", e.request_id, e.code.to_error_code(), e.message))
            .collect();
        let message = if details.is_empty() {
            self.message
        } else {
            format!("{}: {}", self.message, details.join("; "))
        };
        SyncError::new(self.code.to_error_code(), message)
    }
}

impl SatSubsDataError {
    pub fn into_error(self) -> SyncError {
        let details: Vec<String> = self
            .shape_request_errors
            .iter()
            .map(|e| format!("{}: {}", e.request_id, e.message))
            .collect();
        let message = if details.is_empty() {
            self.message
        } else {
            format!("{}: {}", self.message, details.join("; "))
        };
        SyncError::new(ErrorCode::ShapeDeliveryError, message)
    }
}
