//! 系统时钟换算.
//!
//! 所有 PTS/DTS/SCR 内部统一以 27MHz 时钟刻度 (`ClockTicks`) 表示.
//! 写入码流时再拆分为 90kHz 基准 (33 位) 与 9 位扩展.

/// 27MHz 时钟刻度
pub type ClockTicks = i64;

/// 每秒时钟刻度数
pub const CLOCKS: ClockTicks = 27_000_000;

/// MPEG-1 系统时钟 (90kHz) 到 27MHz 的倍数
pub const CLOCKS_PER_90KHZ: ClockTicks = 300;

/// 33 位时钟基准掩码
pub const BASE_MASK: u64 = (1u64 << 33) - 1;

/// 取 90kHz 基准部分 (33 位截断)
pub fn base_90khz(ticks: ClockTicks) -> u64 {
    (ticks.max(0) / CLOCKS_PER_90KHZ) as u64 & BASE_MASK
}

/// 取 9 位扩展部分 (0..300)
pub fn extension(ticks: ClockTicks) -> u32 {
    (ticks.max(0) % CLOCKS_PER_90KHZ) as u32
}

/// 由 90kHz 基准与扩展重建 27MHz 刻度
pub fn from_base_ext(base: u64, ext: u32) -> ClockTicks {
    base as ClockTicks * CLOCKS_PER_90KHZ + ext as ClockTicks
}

/// 以给定字节速率 (字节/秒) 传输 `bytes` 字节所需的时钟刻度
pub fn bytes_to_ticks(bytes: u64, byte_rate: u32) -> ClockTicks {
    if byte_rate == 0 {
        return 0;
    }
    (bytes as i128 * CLOCKS as i128 / byte_rate as i128) as ClockTicks
}

/// 毫秒转时钟刻度
pub fn ms_to_ticks(ms: i64) -> ClockTicks {
    ms * (CLOCKS / 1000)
}

/// 时钟刻度转秒 (仅用于日志)
pub fn ticks_to_secs(ticks: ClockTicks) -> f64 {
    ticks as f64 / CLOCKS as f64
}
