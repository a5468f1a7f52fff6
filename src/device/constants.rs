use uuid::Uuid;

/**
 * How long (milliseconds) a single scan session may run before it is stopped.
 */
pub const SCAN_TIMEOUT: u64 = 10_000;

/**
 * How many times a failed connection attempt is retried before falling back to rescanning.
 */
pub const CONNECT_RETRIES: u32 = 3;

/**
 * How long (milliseconds) to wait between two connection attempts to the same peripheral.
 */
pub const RETRY_DELAY: u64 = 100;

/**
 * How long (milliseconds) to wait before the first rescan after the connection was lost.
 */
pub const RESCAN_INITIAL_DELAY: u64 = 5_000;

/**
 * How often (milliseconds) to rescan while still disconnected.
 */
pub const RESCAN_INTERVAL: u64 = 1_500;

/**
 * How long (milliseconds) a single connection attempt (link + service discovery + subscribe) may take.
 */
pub const CONNECT_DEADLINE: u64 = 10_000;

/**
 * How often (milliseconds) to check the connection status of a connected peripheral.
 */
pub const LINK_POLL_DELAY: u64 = 500;

/**
 * How long (milliseconds) a write to a characteristic may take.
 */
pub const WRITE_DEADLINE: u64 = 2000;

/**
 * How long (milliseconds) checking if the peripheral is still connected may take
 */
pub const IS_CONNECTED_DEADLINE: u64 = 2000;

/**
 * How long (milliseconds) disconnecting a link may take before it is abandoned
 */
pub const DISCONNECT_DEADLINE: u64 = 2000;

/**
 * The advertised name (or part of it) of the cuff controller board.
 */
pub const DEFAULT_NAME_FILTER: &str = "XIAO-BLE";

/**
 * The range of pressure values reported by current cuff firmware.
 * Early firmware reported 0..=10; see `TelemetryRange` in the config.
 */
pub const DEFAULT_PRESSURE_MIN: i32 = 0;
pub const DEFAULT_PRESSURE_MAX: i32 = 100;

/**
 * The UUID of the Bluetooth BLE service exposed by the cuff firmware
 */
pub const CUFF_SERVICE_UUID: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);

/**
 * The UUID of the characteristic that accepts commands and notifies pressure values.
 */
pub const CUFF_PRESSURE_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a8);

/**
 * Client Characteristic Configuration Descriptor, written to enable notifications.
 */
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);
