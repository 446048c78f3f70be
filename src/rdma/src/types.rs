//! Provider independent verbs and connection-management types.
use std::fmt;

use bitflags::bitflags;

/// Port space
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PortSpace {
    IPOIB,
    TCP,
    UDP,
    IB,
}

/// The type of QP used for communciation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpType {
    /// reliable connection
    RC,
    /// unreliable datagram
    UD,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCapability {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

/// Attributes of a new queue pair. Both directions complete on the same CQ.
#[derive(Debug, Clone)]
pub struct QpInitAttr {
    pub cap: QpCapability,
    pub qp_type: QpType,
    pub sq_sig_all: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ConnParam {
    pub private_data: Option<Vec<u8>>,
    pub responder_resources: u8,
    pub initiator_depth: u8,
    pub flow_control: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
}

bitflags! {
    /// Memory region access flags.
    #[derive(Default)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 0b00000001;
        const REMOTE_WRITE = 0b00000010;
        const REMOTE_READ = 0b00000100;
        const REMOTE_ATOMIC = 0b00001000;
    }

    /// Flags of the completed WR.
    #[derive(Default)]
    pub struct WcFlags: u32 {
        /// GRH is present (valid only for UD QPs).
        const GRH = 0b00000001;
        /// Immediate data value is valid.
        const WITH_IMM = 0b00000010;
    }

    /// Flags of the WR properties.
    #[derive(Default)]
    pub struct SendFlags: u32 {
        /// Set the fence indicator. Valid only for QPs with Transport Service Type RC.
        const FENCE = 0b00000001;
        /// Set the completion notification indicator. Relevant only if QP was created with
        /// sq_sig_all=0.
        const SIGNALED = 0b00000010;
        /// Set the solicited event indicator. Valid only for Send and RDMA Write with immediate.
        const SOLICITED = 0b00000100;
        /// Send data in given gather list as inline data in a send WQE.  Valid only for Send and
        /// RDMA Write.  The L_Key will not be checked.
        const INLINE = 0b00001000;
    }
}

/// Status of a work completion. The numeric codes follow `enum ibv_wc_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    LocLenErr,
    LocQpOpErr,
    LocProtErr,
    WrFlushErr,
    RemInvReqErr,
    RemAccessErr,
    RemOpErr,
    RetryExcErr,
    RnrRetryExcErr,
    GeneralErr,
    Other(u32),
}

impl WcStatus {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => WcStatus::Success,
            1 => WcStatus::LocLenErr,
            2 => WcStatus::LocQpOpErr,
            4 => WcStatus::LocProtErr,
            5 => WcStatus::WrFlushErr,
            9 => WcStatus::RemInvReqErr,
            10 => WcStatus::RemAccessErr,
            11 => WcStatus::RemOpErr,
            12 => WcStatus::RetryExcErr,
            13 => WcStatus::RnrRetryExcErr,
            21 => WcStatus::GeneralErr,
            other => WcStatus::Other(other),
        }
    }

    pub fn code(&self) -> u32 {
        match *self {
            WcStatus::Success => 0,
            WcStatus::LocLenErr => 1,
            WcStatus::LocQpOpErr => 2,
            WcStatus::LocProtErr => 4,
            WcStatus::WrFlushErr => 5,
            WcStatus::RemInvReqErr => 9,
            WcStatus::RemAccessErr => 10,
            WcStatus::RemOpErr => 11,
            WcStatus::RetryExcErr => 12,
            WcStatus::RnrRetryExcErr => 13,
            WcStatus::GeneralErr => 21,
            WcStatus::Other(code) => code,
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        *self == WcStatus::Success
    }
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            WcStatus::Success => "success",
            WcStatus::LocLenErr => "local length error",
            WcStatus::LocQpOpErr => "local QP operation error",
            WcStatus::LocProtErr => "local protection error",
            WcStatus::WrFlushErr => "Work Request Flushed Error",
            WcStatus::RemInvReqErr => "remote invalid request error",
            WcStatus::RemAccessErr => "remote access error",
            WcStatus::RemOpErr => "remote operation error",
            WcStatus::RetryExcErr => "transport retry counter exceeded",
            WcStatus::RnrRetryExcErr => "RNR retry counter exceeded",
            WcStatus::GeneralErr => "general error",
            WcStatus::Other(code) => return write!(f, "unknown status ({})", code),
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    Recv,
    RecvRdmaWithImm,
    Invalid,
}

/// A structure represent completion of some work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub vendor_err: u32,
    pub byte_len: u32,
    pub imm_data: u32,
    pub wc_flags: WcFlags,
}

impl Default for WorkCompletion {
    fn default() -> Self {
        WorkCompletion {
            wr_id: 0,
            status: WcStatus::Success,
            opcode: WcOpcode::Invalid,
            vendor_err: 0,
            byte_len: 0,
            imm_data: 0,
            wc_flags: WcFlags::empty(),
        }
    }
}

impl WorkCompletion {
    pub fn new(wr_id: u64, opcode: WcOpcode, status: WcStatus, byte_len: u32) -> Self {
        WorkCompletion {
            wr_id,
            status,
            opcode,
            byte_len,
            ..Default::default()
        }
    }
}

/// Connection-management event kinds (`enum rdma_cm_event_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEventType {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectResponse,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    DeviceRemoval,
    MulticastJoin,
    MulticastError,
    AddrChange,
    TimewaitExit,
    Unknown(u32),
}

impl CmEventType {
    pub fn from_raw(v: u32) -> Self {
        match v {
            0 => CmEventType::AddrResolved,
            1 => CmEventType::AddrError,
            2 => CmEventType::RouteResolved,
            3 => CmEventType::RouteError,
            4 => CmEventType::ConnectRequest,
            5 => CmEventType::ConnectResponse,
            6 => CmEventType::ConnectError,
            7 => CmEventType::Unreachable,
            8 => CmEventType::Rejected,
            9 => CmEventType::Established,
            10 => CmEventType::Disconnected,
            11 => CmEventType::DeviceRemoval,
            12 => CmEventType::MulticastJoin,
            13 => CmEventType::MulticastError,
            14 => CmEventType::AddrChange,
            15 => CmEventType::TimewaitExit,
            other => CmEventType::Unknown(other),
        }
    }
}

impl fmt::Display for CmEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            CmEventType::AddrResolved => "RDMA_CM_EVENT_ADDR_RESOLVED",
            CmEventType::AddrError => "RDMA_CM_EVENT_ADDR_ERROR",
            CmEventType::RouteResolved => "RDMA_CM_EVENT_ROUTE_RESOLVED",
            CmEventType::RouteError => "RDMA_CM_EVENT_ROUTE_ERROR",
            CmEventType::ConnectRequest => "RDMA_CM_EVENT_CONNECT_REQUEST",
            CmEventType::ConnectResponse => "RDMA_CM_EVENT_CONNECT_RESPONSE",
            CmEventType::ConnectError => "RDMA_CM_EVENT_CONNECT_ERROR",
            CmEventType::Unreachable => "RDMA_CM_EVENT_UNREACHABLE",
            CmEventType::Rejected => "RDMA_CM_EVENT_REJECTED",
            CmEventType::Established => "RDMA_CM_EVENT_ESTABLISHED",
            CmEventType::Disconnected => "RDMA_CM_EVENT_DISCONNECTED",
            CmEventType::DeviceRemoval => "RDMA_CM_EVENT_DEVICE_REMOVAL",
            CmEventType::MulticastJoin => "RDMA_CM_EVENT_MULTICAST_JOIN",
            CmEventType::MulticastError => "RDMA_CM_EVENT_MULTICAST_ERROR",
            CmEventType::AddrChange => "RDMA_CM_EVENT_ADDR_CHANGE",
            CmEventType::TimewaitExit => "RDMA_CM_EVENT_TIMEWAIT_EXIT",
            CmEventType::Unknown(v) => return write!(f, "UNKNOWN EVENT ({})", v),
        };
        f.write_str(s)
    }
}
