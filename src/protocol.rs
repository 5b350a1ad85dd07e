//! Shared protocol constants for the otagent control channel

// Length prefix is a little-endian u32 covering itself plus the JSON body
pub const LENGTH_PREFIX_LEN: usize = 4;

// Maximum JSON payload size (1MB) - control messages are small, anything
// larger is a desynchronised stream
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

// Suffix every firmware archive URL must carry
pub const FIRMWARE_SUFFIX: &str = ".tar.gz";

// Message sets (high byte of the opcode)
pub mod msg_set {
    pub const UPDATE: u8 = 0;
    pub const OTHER: u8 = 1;
}

// Acknowledgment flag
pub mod ack {
    pub const NOT_ACK: u8 = 0;
    pub const ACK: u8 = 1;
}

// Opcodes: (msg set << 8) | msg id. Keep numeric stable, the management
// server matches on these.
pub mod opcode {
    pub const REPORT_IDENTITY: u16 = 0x0000;
    pub const REPORT_VERSION: u16 = 0x0002;
    pub const REPORT_DEVICE_STATUS: u16 = 0x0004;
    pub const REPORT_UPDATE_CONFIG: u16 = 0x0006;
    pub const SET_UPDATE_CONFIG: u16 = 0x0008;
    pub const UPDATE_FIRMWARE: u16 = 0x000A;
    pub const REPORT_UPDATE_PROGRESS: u16 = 0x000B;
    // Reboot is handled by the system updater now; accepted and ignored
    pub const REBOOT: u16 = 0x000C;
    pub const REPORT_UPDATE_STATUS: u16 = 0x000D;
    pub const HEARTBEAT: u16 = 0x000F;

    pub const LOG_TREE: u16 = 0x0100;
    pub const UPLOAD_FILE: u16 = 0x0102;
    // Retired by the server; accepted and ignored
    pub const CLEAR_LOG: u16 = 0x0104;
    pub const CHANGE_ID: u16 = 0x0106;

    /// Compose an opcode from its message set and message id.
    pub fn compose(msg_set: u8, msg_id: u8) -> u16 {
        (u16::from(msg_set) << 8) | u16::from(msg_id)
    }

    /// Split an opcode back into (message set, message id).
    pub fn split(op: u16) -> (u8, u8) {
        ((op >> 8) as u8, (op & 0xFF) as u8)
    }
}

// "Return Code" values carried in acknowledgments
pub mod return_code {
    // 0x0008 / 0x0106
    pub const SUCCESS: i64 = 0;
    pub const FAIL: i64 = 1;

    // 0x000A
    pub const FIRMWARE_ACCEPTED: i64 = 0;
    pub const FIRMWARE_PARAM_ERROR: i64 = 1;

    // 0x0102 (values predate the generic codes above)
    pub const UPLOAD_FAILED: i64 = 2;
    pub const UPLOADED: i64 = 3;
}

// "Status" values in 0x000D update status reports
pub mod update_status {
    pub const DOWNLOADING: i64 = 0;
    pub const DOWNLOAD_SUCCEEDED: i64 = 1;
    pub const DOWNLOAD_FAILED: i64 = 2;
}

// Keys used inside "msg data"
pub mod field {
    pub const MODEL: &str = "Model";
    pub const PLATFORM: &str = "Platform";
    pub const VERSION: &str = "Version";
    pub const STATUS: &str = "Status";
    pub const POLICY: &str = "Policy";
    pub const OPEN_TIME: &str = "Open Time";
    pub const CLOSE_TIME: &str = "Close Time";
    pub const RETURN_CODE: &str = "Return Code";
    pub const FIRMWARE_SIZE: &str = "Firmware Size";
    pub const URL: &str = "URL";
    pub const PERCENT: &str = "Percent";
    pub const DOWNLOAD_SPEED: &str = "Download Speed";
    pub const TREE: &str = "Tree";
    pub const FILENAME: &str = "Filename";
    pub const NEW_ID: &str = "New ID";
}

// Centralized timing defaults
pub mod timeouts {
    // Heartbeat period (ms)
    pub const HEARTBEAT_MS: u64 = 1000;

    // Minimum spacing between two progress reports (ms)
    pub const PROGRESS_INTERVAL_MS: u64 = 2000;

    // Reconnect backoff bounds (ms)
    pub const RECONNECT_INITIAL_MS: u64 = 500;
    pub const RECONNECT_MAX_MS: u64 = 30_000;

    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 5000;

    // Grace period between acking an id change and rebooting (ms)
    pub const REBOOT_DELAY_MS: u64 = 2000;

    // Next reconnect delay: double the previous one, capped at max
    pub fn next_backoff_ms(prev_ms: u64, max_ms: u64) -> u64 {
        prev_ms.saturating_mul(2).min(max_ms).max(1)
    }
}
