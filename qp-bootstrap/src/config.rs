use crate::descriptor::Role;
use crate::error::{RdmaError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use std::{fmt, fs};

/// Message the initiator sends in send/receive mode, terminator included.
pub const CLIENT_MESSAGE: &[u8] = b"Hello from Client\0";
/// Contents the responder exposes in remote-read mode, terminator included.
pub const SERVER_MESSAGE: &[u8] = b"Hello from Server via RDMA READ\0";

pub const DEFAULT_BUFFER_LEN: usize = 1024;

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Two-sided: the responder posts a receive, the initiator sends.
    #[default]
    SendRecv,
    /// One-sided: the initiator reads a region the responder exposes.
    RemoteRead,
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SendRecv => "send-recv",
            Self::RemoteRead => "remote-read",
        })
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingMode {
    /// No global route header; the peer is addressed by `dlid`.
    #[value(name = "local")]
    LocalOnly,
    /// Global route header towards the peer's GID.
    #[default]
    #[value(name = "global")]
    GlobalRouted,
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LocalOnly => "local",
            Self::GlobalRouted => "global",
        })
    }
}

/// Path MTU, serialized as its byte count.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(try_from = "u32", into = "u32")]
pub enum Mtu {
    Mtu256,
    Mtu512,
    #[default]
    Mtu1024,
    Mtu2048,
    Mtu4096,
}

impl Mtu {
    pub fn bytes(self) -> u32 {
        match self {
            Self::Mtu256 => 256,
            Self::Mtu512 => 512,
            Self::Mtu1024 => 1024,
            Self::Mtu2048 => 2048,
            Self::Mtu4096 => 4096,
        }
    }
}

impl TryFrom<u32> for Mtu {
    type Error = String;

    fn try_from(bytes: u32) -> Result<Self, Self::Error> {
        Ok(match bytes {
            256 => Self::Mtu256,
            512 => Self::Mtu512,
            1024 => Self::Mtu1024,
            2048 => Self::Mtu2048,
            4096 => Self::Mtu4096,
            other => return Err(format!("unsupported path MTU {other}")),
        })
    }
}

impl From<Mtu> for u32 {
    fn from(mtu: Mtu) -> Self {
        mtu.bytes()
    }
}

impl fmt::Display for Mtu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bytes())
    }
}

/// Every queue pair attribute the bootstrap programs.
///
/// Missing JSON fields fall back to the values two RoCE hosts on one
/// subnet usually agree on.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConnectionTuning {
    #[serde(default = "default_port_num")]
    pub port_num: u8,
    #[serde(default)]
    pub pkey_index: u16,
    #[serde(default = "default_gid_index")]
    pub gid_index: u8,
    #[serde(default = "default_hop_limit")]
    pub hop_limit: u8,
    #[serde(default)]
    pub traffic_class: u8,
    #[serde(default)]
    pub service_level: u8,
    #[serde(default)]
    pub dlid: u16,
    #[serde(default)]
    pub path_mtu: Mtu,
    #[serde(default)]
    pub start_psn: u32,
    #[serde(default = "default_rd_atomic")]
    pub max_dest_rd_atomic: u8,
    #[serde(default = "default_min_rnr_timer")]
    pub min_rnr_timer: u8,
    #[serde(default = "default_timeout")]
    pub timeout: u8,
    #[serde(default = "default_retry")]
    pub retry_cnt: u8,
    #[serde(default = "default_retry")]
    pub rnr_retry: u8,
    #[serde(default = "default_rd_atomic")]
    pub max_rd_atomic: u8,
    #[serde(default = "default_queue_depth")]
    pub cq_depth: u32,
    #[serde(default = "default_queue_depth")]
    pub max_send_wr: u32,
    #[serde(default = "default_queue_depth")]
    pub max_recv_wr: u32,
    #[serde(default = "default_max_sge")]
    pub max_sge: u32,
}

fn default_port_num() -> u8 {
    1
}

fn default_gid_index() -> u8 {
    1
}

fn default_hop_limit() -> u8 {
    64
}

fn default_rd_atomic() -> u8 {
    1
}

fn default_min_rnr_timer() -> u8 {
    12
}

fn default_timeout() -> u8 {
    14
}

fn default_retry() -> u8 {
    7
}

fn default_queue_depth() -> u32 {
    16
}

fn default_max_sge() -> u32 {
    1
}

impl Default for ConnectionTuning {
    fn default() -> Self {
        Self {
            port_num: default_port_num(),
            pkey_index: 0,
            gid_index: default_gid_index(),
            hop_limit: default_hop_limit(),
            traffic_class: 0,
            service_level: 0,
            dlid: 0,
            path_mtu: Mtu::default(),
            start_psn: 0,
            max_dest_rd_atomic: default_rd_atomic(),
            min_rnr_timer: default_min_rnr_timer(),
            timeout: default_timeout(),
            retry_cnt: default_retry(),
            rnr_retry: default_retry(),
            max_rd_atomic: default_rd_atomic(),
            cq_depth: default_queue_depth(),
            max_send_wr: default_queue_depth(),
            max_recv_wr: default_queue_depth(),
            max_sge: default_max_sge(),
        }
    }
}

impl ConnectionTuning {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| RdmaError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let tuning: Self =
            serde_json::from_str(text).map_err(|e| RdmaError::Config(format!("tuning: {e}")))?;
        tuning.validate()?;
        Ok(tuning)
    }

    /// Rejects values outside the ranges the transport encodes.
    pub fn validate(&self) -> Result<()> {
        let check = |ok: bool, what: &str| {
            if ok {
                Ok(())
            } else {
                Err(RdmaError::Config(what.to_string()))
            }
        };
        check(self.port_num != 0, "port_num starts at 1")?;
        check(self.timeout <= 31, "timeout is a 5-bit exponent")?;
        check(self.min_rnr_timer <= 31, "min_rnr_timer is a 5-bit code")?;
        check(self.retry_cnt <= 7, "retry_cnt is at most 7")?;
        check(self.rnr_retry <= 7, "rnr_retry is at most 7 (7 retries forever)")?;
        check(self.service_level <= 15, "service_level is at most 15")?;
        check(self.start_psn < 1 << 24, "start_psn is a 24-bit sequence number")?;
        check(self.cq_depth > 0, "cq_depth must be positive")?;
        check(
            self.max_send_wr > 0 && self.max_recv_wr > 0,
            "work request queues must hold at least one entry",
        )?;
        check(self.max_sge > 0, "max_sge must be positive")
    }
}

/// How the responder learns that a remote read has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadNotify {
    /// Keep the region registered for a fixed time; no completion is observed.
    Delay(Duration),
    /// Wait for a short "read done" message from the initiator.
    #[default]
    Message,
}

/// Everything one side of a session needs besides the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub transfer: TransferMode,
    pub routing: RoutingMode,
    /// Length of the receive buffer, the exposed region and the read target.
    pub buffer_len: usize,
    /// Outbound message in send/receive mode, exposed contents in read mode.
    pub payload: Vec<u8>,
    /// Bytes the initiator reads in remote-read mode.
    pub read_len: usize,
    pub completion_timeout: Option<Duration>,
    pub handshake_timeout: Option<Duration>,
    pub read_notify: ReadNotify,
    pub tuning: ConnectionTuning,
}

impl SessionConfig {
    pub fn new(transfer: TransferMode) -> Self {
        let payload = match transfer {
            TransferMode::SendRecv => CLIENT_MESSAGE,
            TransferMode::RemoteRead => SERVER_MESSAGE,
        };
        Self {
            transfer,
            routing: RoutingMode::default(),
            buffer_len: DEFAULT_BUFFER_LEN,
            payload: payload.to_vec(),
            read_len: SERVER_MESSAGE.len(),
            completion_timeout: None,
            handshake_timeout: None,
            read_notify: ReadNotify::default(),
            tuning: ConnectionTuning::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.tuning.validate()?;
        if self.buffer_len == 0 {
            return Err(RdmaError::Config("buffer_len must be positive".into()));
        }
        if self.transfer == TransferMode::RemoteRead {
            if self.read_len == 0 || self.read_len > self.buffer_len {
                return Err(RdmaError::Config(format!(
                    "read_len {} must be within 1..={}",
                    self.read_len, self.buffer_len
                )));
            }
            if self.tuning.max_rd_atomic == 0 || self.tuning.max_dest_rd_atomic == 0 {
                return Err(RdmaError::Config(
                    "remote reads need max_rd_atomic and max_dest_rd_atomic of at least 1".into(),
                ));
            }
        }
        Ok(())
    }
}

impl SessionConfig {
    /// Checks the settings one side of the session depends on.
    ///
    /// Only the side that sends or exposes `payload` needs it to fit the buffer.
    pub fn validate_for(&self, role: Role) -> Result<()> {
        self.validate()?;
        let carries_payload = match self.transfer {
            TransferMode::SendRecv => role == Role::Initiator,
            TransferMode::RemoteRead => role == Role::Responder,
        };
        if carries_payload && self.payload.len() > self.buffer_len {
            return Err(RdmaError::Config(format!(
                "payload of {} bytes does not fit a {} byte buffer",
                self.payload.len(),
                self.buffer_len
            )));
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(TransferMode::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_connection_constants() {
        let tuning = ConnectionTuning::default();
        assert_eq!(tuning.port_num, 1);
        assert_eq!(tuning.gid_index, 1);
        assert_eq!(tuning.hop_limit, 64);
        assert_eq!(tuning.path_mtu, Mtu::Mtu1024);
        assert_eq!(tuning.min_rnr_timer, 12);
        assert_eq!(tuning.timeout, 14);
        assert_eq!((tuning.retry_cnt, tuning.rnr_retry), (7, 7));
        assert_eq!((tuning.max_rd_atomic, tuning.max_dest_rd_atomic), (1, 1));
        tuning.validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let tuning = ConnectionTuning::from_json(r#"{ "gid_index": 0, "hop_limit": 1 }"#).unwrap();
        assert_eq!(tuning.gid_index, 0);
        assert_eq!(tuning.hop_limit, 1);
        assert_eq!(tuning.timeout, 14);
        assert_eq!(tuning.cq_depth, 16);
    }

    #[test]
    fn mtu_is_written_as_bytes() {
        let json = serde_json::to_value(ConnectionTuning::default()).unwrap();
        assert_eq!(json["path_mtu"], 1024);

        let err = ConnectionTuning::from_json(r#"{ "path_mtu": 1500 }"#).unwrap_err();
        assert!(matches!(err, RdmaError::Config(msg) if msg.contains("1500")));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for json in [
            r#"{ "retry_cnt": 8 }"#,
            r#"{ "timeout": 32 }"#,
            r#"{ "port_num": 0 }"#,
            r#"{ "cq_depth": 0 }"#,
            r#"{ "unknown_knob": 1 }"#,
        ] {
            assert!(ConnectionTuning::from_json(json).is_err(), "{json} accepted");
        }
    }

    #[test]
    fn loads_tuning_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "path_mtu": 4096, "rnr_retry": 3 }}"#).unwrap();

        let tuning = ConnectionTuning::from_json_file(file.path()).unwrap();
        assert_eq!(tuning.path_mtu, Mtu::Mtu4096);
        assert_eq!(tuning.rnr_retry, 3);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConnectionTuning::from_json_file(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, RdmaError::Config(_)));
    }

    #[test]
    fn session_defaults_follow_the_mode() {
        let send = SessionConfig::new(TransferMode::SendRecv);
        assert_eq!(send.payload, CLIENT_MESSAGE);
        assert_eq!(send.payload.len(), 18);
        assert_eq!(send.buffer_len, 1024);

        let read = SessionConfig::new(TransferMode::RemoteRead);
        assert_eq!(read.payload, SERVER_MESSAGE);
        assert_eq!(read.read_len, 32);
        assert_eq!(read.read_notify, ReadNotify::Message);
    }

    #[test]
    fn session_rejects_oversized_payload() {
        let mut config = SessionConfig::new(TransferMode::RemoteRead);
        config.buffer_len = 8;
        config.read_len = 8;
        assert!(config.validate_for(Role::Responder).is_err());
    }

    #[test]
    fn payload_only_binds_the_side_that_carries_it() {
        let mut send = SessionConfig::new(TransferMode::SendRecv);
        send.buffer_len = 8;
        send.validate_for(Role::Responder).unwrap();
        assert!(send.validate_for(Role::Initiator).is_err());

        let mut read = SessionConfig::new(TransferMode::RemoteRead);
        read.buffer_len = 8;
        read.read_len = 8;
        read.validate_for(Role::Initiator).unwrap();
        assert!(read.validate_for(Role::Responder).is_err());
    }

    #[test]
    fn mode_names_match_the_command_line() {
        use clap::ValueEnum;

        for mode in TransferMode::value_variants() {
            assert_eq!(TransferMode::from_str(&mode.to_string(), false), Ok(*mode));
        }
        for routing in RoutingMode::value_variants() {
            assert_eq!(RoutingMode::from_str(&routing.to_string(), false), Ok(*routing));
        }
    }
}
