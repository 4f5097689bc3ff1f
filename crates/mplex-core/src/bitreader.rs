//! 流式比特流读取器.
//!
//! 从调用方提供的字节源 (`std::io::Read`) 中按位读取数据, 内部缓冲按需填充.
//! 位置以绝对位偏移表示, 支持按位置丢弃已消费数据、检查点回滚与字节对齐的同步字搜索.
//!
//! 按大端位序读取 (MSB first). 流末尾是粘滞标志而非错误: 越界读取返回 0.

use std::io::{ErrorKind, Read};

use crate::{MuxError, MuxResult};

/// 默认每次向字节源请求的块大小
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// 读取器游标快照, 用于试探性前瞻后回滚
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    bit_pos: u64,
    eos: bool,
}

impl Checkpoint {
    /// 快照所在的绝对位偏移
    pub fn bit_position(&self) -> u64 {
        self.bit_pos
    }
}

/// 流式比特流读取器
///
/// # 示例
/// ```
/// use std::io::Cursor;
/// use mplex_core::bitreader::BitReader;
///
/// let mut br = BitReader::new(Cursor::new(vec![0b1011_0001, 0x55]));
/// assert_eq!(br.read_bits(4).unwrap(), 0b1011);
/// assert_eq!(br.read_bits(12).unwrap(), 0x155);
/// assert_eq!(br.read_bits(8).unwrap(), 0);
/// assert!(br.eos());
/// ```
pub struct BitReader {
    /// 字节源
    source: Box<dyn Read + Send>,
    /// 已读入但尚未丢弃的字节
    buffer: Vec<u8>,
    /// buffer[0] 在流中的绝对字节偏移
    buffer_start: u64,
    /// 绝对位游标
    bit_pos: u64,
    /// 粘滞的流末尾标志
    eos: bool,
    /// 字节源已返回 0
    source_done: bool,
    /// 每次填充请求的字节数
    chunk_size: usize,
    /// 丢弃阈值: 可释放字节占缓冲比例达到 num/den 才真正丢弃
    flush_num: u64,
    flush_den: u64,
}

impl BitReader {
    /// 绑定字节源
    pub fn new<R: Read + Send + 'static>(source: R) -> Self {
        Self::with_chunk_size(source, DEFAULT_CHUNK_SIZE)
    }

    /// 绑定字节源并指定填充块大小
    pub fn with_chunk_size<R: Read + Send + 'static>(source: R, chunk_size: usize) -> Self {
        Self {
            source: Box::new(source),
            buffer: Vec::with_capacity(chunk_size.max(1) * 2),
            buffer_start: 0,
            bit_pos: 0,
            eos: false,
            source_done: false,
            chunk_size: chunk_size.max(1),
            flush_num: 1,
            flush_den: 2,
        }
    }

    /// 设置丢弃阈值比例 (默认 1/2)
    pub fn set_flush_fraction(&mut self, num: u64, den: u64) {
        self.flush_num = num;
        self.flush_den = den.max(1);
    }

    /// 当前绝对位偏移
    pub fn bit_position(&self) -> u64 {
        self.bit_pos
    }

    /// 当前绝对字节偏移 (向下取整)
    pub fn byte_position(&self) -> u64 {
        self.bit_pos / 8
    }

    /// 是否已越过流末尾
    pub fn eos(&self) -> bool {
        self.eos
    }

    /// 当前缓冲中保留的字节数
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// 缓冲中最早仍可访问的绝对字节偏移
    pub fn buffer_start(&self) -> u64 {
        self.buffer_start
    }

    fn buffer_end(&self) -> u64 {
        self.buffer_start + self.buffer.len() as u64
    }

    /// 确保缓冲覆盖到绝对字节偏移 `end_byte` (不含), 返回是否可满足
    fn fill_to(&mut self, end_byte: u64) -> MuxResult<bool> {
        while self.buffer_end() < end_byte {
            if self.source_done {
                return Ok(false);
            }
            let old_len = self.buffer.len();
            self.buffer.resize(old_len + self.chunk_size, 0);
            let read = loop {
                match self.source.read(&mut self.buffer[old_len..]) {
                    Ok(n) => break n,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        self.buffer.truncate(old_len);
                        return Err(e.into());
                    }
                }
            };
            self.buffer.truncate(old_len + read);
            if read == 0 {
                self.source_done = true;
            }
        }
        Ok(true)
    }

    /// 越界: 置粘滞标志, 游标停在数据末尾
    fn hit_end(&mut self) {
        self.eos = true;
        self.bit_pos = self.bit_pos.max(self.buffer_end() * 8);
    }

    /// 读取 N 个位 (最多 32 位)
    ///
    /// 数据不足时返回 0 并置流末尾标志, 之后的读取均为空操作.
    pub fn read_bits(&mut self, n: u32) -> MuxResult<u32> {
        if n > 32 {
            return Err(MuxError::InvalidArgument(format!(
                "read_bits: n={} 超过 32 位",
                n,
            )));
        }
        if n == 0 || self.eos {
            return Ok(0);
        }
        let end_byte = (self.bit_pos + u64::from(n)).div_ceil(8);
        if !self.fill_to(end_byte)? {
            self.hit_end();
            return Ok(0);
        }

        let mut value: u64 = 0;
        let mut remaining = n;
        while remaining > 0 {
            let idx = (self.bit_pos / 8 - self.buffer_start) as usize;
            let available = 8 - (self.bit_pos % 8) as u32;
            let take = remaining.min(available);
            let shift = available - take;
            let bits = (u64::from(self.buffer[idx]) >> shift) & ((1u64 << take) - 1);
            value = (value << take) | bits;
            self.bit_pos += u64::from(take);
            remaining -= take;
        }
        Ok(value as u32)
    }

    /// 读取 1 个位
    pub fn read_bit(&mut self) -> MuxResult<bool> {
        Ok(self.read_bits(1)? != 0)
    }

    /// 窥视 N 个位 (不移动位置, 不改变流末尾标志)
    pub fn peek_bits(&mut self, n: u32) -> MuxResult<u32> {
        let cp = self.checkpoint();
        let value = self.read_bits(n);
        self.bit_pos = cp.bit_pos;
        self.eos = cp.eos;
        value
    }

    /// 跳过 N 个位, 返回跳过后是否仍在流内
    pub fn skip_bits(&mut self, n: u64) -> MuxResult<bool> {
        self.skip_to(self.bit_pos + n)
    }

    /// 前移游标到绝对位偏移 `bit`
    pub fn skip_to(&mut self, bit: u64) -> MuxResult<bool> {
        if bit < self.bit_pos {
            return Err(MuxError::InvalidArgument(format!(
                "skip_to: 目标位 {} 早于当前位置 {}",
                bit, self.bit_pos,
            )));
        }
        if self.eos {
            return Ok(false);
        }
        if !self.fill_to(bit.div_ceil(8))? {
            self.hit_end();
            return Ok(false);
        }
        self.bit_pos = bit;
        Ok(true)
    }

    /// 对齐到下一个字节边界
    pub fn align_to_byte(&mut self) {
        self.bit_pos = self.bit_pos.div_ceil(8) * 8;
    }

    /// 游标 (对齐后) 之后是否已无任何字节, 不消费数据
    pub fn at_end(&mut self) -> MuxResult<bool> {
        if self.eos {
            return Ok(true);
        }
        Ok(!self.fill_to(self.bit_pos.div_ceil(8) + 1)?)
    }

    /// 字节对齐地向前搜索 `width` 位宽的同步字 `pattern`
    ///
    /// 候选起点最多前移 `byte_limit` 字节. 找到时游标停在同步字之后并返回 true;
    /// 超出限制返回 false, 游标停在放弃处; 到达流末尾同时置粘滞标志.
    pub fn seek_sync(&mut self, pattern: u32, width: u32, byte_limit: u64) -> MuxResult<bool> {
        if width == 0 || width > 32 {
            return Err(MuxError::InvalidArgument(format!(
                "seek_sync: 位宽 {} 超出 1..=32",
                width,
            )));
        }
        if self.eos {
            return Ok(false);
        }
        self.align_to_byte();
        let window_bytes = u64::from(width.div_ceil(8));
        let drop_bits = window_bytes as u32 * 8 - width;
        let mask = if width == 32 {
            u32::MAX
        } else {
            (1u32 << width) - 1
        };
        let target = pattern & mask;

        let start = self.bit_pos / 8;
        let mut pos = start;
        while pos - start <= byte_limit {
            if !self.fill_to(pos + window_bytes)? {
                self.bit_pos = pos * 8;
                self.hit_end();
                return Ok(false);
            }
            let idx = (pos - self.buffer_start) as usize;
            let mut window: u64 = 0;
            for &b in &self.buffer[idx..idx + window_bytes as usize] {
                window = (window << 8) | u64::from(b);
            }
            if (window >> drop_bits) as u32 & mask == target {
                self.bit_pos = pos * 8 + u64::from(width);
                return Ok(true);
            }
            pos += 1;
        }
        self.bit_pos = pos * 8;
        Ok(false)
    }

    /// 记录完整游标状态
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            bit_pos: self.bit_pos,
            eos: self.eos,
        }
    }

    /// 恢复到检查点; 检查点所在数据已被丢弃时返回内部错误
    pub fn restore(&mut self, cp: &Checkpoint) -> MuxResult<()> {
        if cp.bit_pos / 8 < self.buffer_start {
            return Err(MuxError::Internal(format!(
                "检查点 (位 {}) 所在数据已被丢弃 (缓冲起点字节 {})",
                cp.bit_pos, self.buffer_start,
            )));
        }
        self.bit_pos = cp.bit_pos;
        self.eos = cp.eos;
        Ok(())
    }

    /// 丢弃绝对位偏移 `upto_bit` 之前的整字节
    ///
    /// 位置会被截断到当前扫描游标. 可释放量低于阈值比例时不做任何事, 以摊薄移动开销.
    pub fn flush(&mut self, upto_bit: u64) {
        let upto_byte = upto_bit.min(self.bit_pos) / 8;
        if upto_byte <= self.buffer_start {
            return;
        }
        let discard = ((upto_byte - self.buffer_start) as usize).min(self.buffer.len());
        if (discard as u64) * self.flush_den < (self.buffer.len() as u64) * self.flush_num {
            return;
        }
        self.buffer.drain(..discard);
        self.buffer_start += discard as u64;
        log::trace!(
            "BitReader 丢弃 {} 字节, 缓冲起点 {}",
            discard,
            self.buffer_start
        );
    }

    /// 从绝对字节偏移 `offset` 复制已缓冲字节到 `dst`, 返回复制数量
    pub fn copy_buffered(&self, offset: u64, dst: &mut [u8]) -> MuxResult<usize> {
        if offset < self.buffer_start {
            return Err(MuxError::Internal(format!(
                "读取已丢弃数据: 偏移 {} < 缓冲起点 {}",
                offset, self.buffer_start,
            )));
        }
        let idx = (offset - self.buffer_start) as usize;
        if idx >= self.buffer.len() {
            return Ok(0);
        }
        let n = dst.len().min(self.buffer.len() - idx);
        dst[..n].copy_from_slice(&self.buffer[idx..idx + n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(data: &[u8], chunk: usize) -> BitReader {
        BitReader::with_chunk_size(Cursor::new(data.to_vec()), chunk)
    }

    #[test]
    fn test_read_bits_across_chunks() {
        let mut br = reader(&[0b1011_0001, 0x55, 0xFF, 0x00, 0xAA], 1);
        assert_eq!(br.read_bits(1).unwrap(), 1);
        assert_eq!(br.read_bits(3).unwrap(), 0b011);
        assert_eq!(br.read_bits(12).unwrap(), 0x155);
        assert_eq!(br.read_bits(24).unwrap(), 0xFF00AA);
        assert_eq!(br.bit_position(), 40);
        assert!(!br.eos());
    }

    #[test]
    fn test_eos_is_sticky() {
        let mut br = reader(&[0xAB], 4);
        assert_eq!(br.read_bits(8).unwrap(), 0xAB);
        assert_eq!(br.read_bits(1).unwrap(), 0);
        assert!(br.eos());
        assert_eq!(br.read_bits(8).unwrap(), 0);
        assert!(br.at_end().unwrap());
    }

    #[test]
    fn test_read_bits_32() {
        let mut br = reader(&[0xFF, 0x00, 0xFF, 0x00], 3);
        assert_eq!(br.read_bits(32).unwrap(), 0xFF00FF00);
        assert!(br.read_bits(33).is_err());
    }

    #[test]
    fn test_peek_keeps_position() {
        let mut br = reader(&[0x12, 0x34], 16);
        assert_eq!(br.peek_bits(8).unwrap(), 0x12);
        assert_eq!(br.peek_bits(32).unwrap(), 0);
        assert!(!br.eos());
        assert_eq!(br.read_bits(16).unwrap(), 0x1234);
    }

    #[test]
    fn test_seek_sync_start_code() {
        let data = [0x12, 0x00, 0x00, 0x01, 0xB3, 0x99, 0x00, 0x00, 0x01, 0x00];
        let mut br = reader(&data, 2);
        br.read_bits(3).unwrap();
        assert!(br.seek_sync(0x00_0001, 24, 16).unwrap());
        assert_eq!(br.bit_position(), 32);
        assert_eq!(br.read_bits(8).unwrap(), 0xB3);
        assert!(br.seek_sync(0x0000_0100, 32, 16).unwrap());
        assert_eq!(br.bit_position(), 80);
        assert!(!br.seek_sync(0x00_0001, 24, 16).unwrap());
        assert!(br.eos());
    }

    #[test]
    fn test_seek_sync_byte_limit() {
        let data = [0u8, 1, 2, 3, 4, 5, 0x0B, 0x77];
        let mut br = reader(&data, 64);
        assert!(!br.seek_sync(0x0B77, 16, 3).unwrap());
        assert!(!br.eos());
        let mut br = reader(&data, 64);
        assert!(br.seek_sync(0x0B77, 16, 6).unwrap());
    }

    #[test]
    fn test_seek_sync_11_bit_pattern() {
        let data = [0x00, 0xFF, 0xFB, 0x90];
        let mut br = reader(&data, 64);
        assert!(br.seek_sync(0x7FF, 11, 8).unwrap());
        assert_eq!(br.bit_position(), 8 + 11);
        assert_eq!(br.read_bits(2).unwrap(), 0b11);
    }

    #[test]
    fn test_checkpoint_restore() {
        let mut br = reader(&[0xDE, 0xAD, 0xBE, 0xEF], 1);
        br.read_bits(8).unwrap();
        let cp = br.checkpoint();
        assert_eq!(br.read_bits(16).unwrap(), 0xADBE);
        br.read_bits(32).unwrap();
        assert!(br.eos());
        br.restore(&cp).unwrap();
        assert!(!br.eos());
        assert_eq!(br.read_bits(8).unwrap(), 0xAD);
    }

    #[test]
    fn test_flush_threshold_and_copy() {
        let data: Vec<u8> = (0..=255).collect();
        let mut br = reader(&data, 256);
        br.skip_bits(200 * 8).unwrap();
        // 10/256 未达到一半阈值, 不丢弃
        br.flush(10 * 8);
        assert_eq!(br.buffer_start(), 0);
        br.flush(150 * 8);
        assert_eq!(br.buffer_start(), 150);

        let mut dst = [0u8; 4];
        assert_eq!(br.copy_buffered(160, &mut dst).unwrap(), 4);
        assert_eq!(dst, [160, 161, 162, 163]);
        assert!(br.copy_buffered(10, &mut dst).is_err());
        assert_eq!(br.copy_buffered(254, &mut dst).unwrap(), 2);
    }

    #[test]
    fn test_restore_after_flush_fails() {
        let data = vec![0u8; 64];
        let mut br = reader(&data, 64);
        let cp = br.checkpoint();
        br.skip_bits(64 * 8).unwrap();
        br.flush(64 * 8);
        assert!(br.restore(&cp).is_err());
    }

    #[test]
    fn test_flush_clamped_to_cursor() {
        let data = vec![0u8; 32];
        let mut br = reader(&data, 32);
        br.skip_bits(8 * 8).unwrap();
        br.set_flush_fraction(0, 1);
        br.flush(1_000_000);
        assert_eq!(br.buffer_start(), 8);
    }

    #[test]
    fn test_skip_past_end() {
        let mut br = reader(&[1, 2, 3], 2);
        assert!(br.skip_bits(16).unwrap());
        assert!(!br.skip_bits(16).unwrap());
        assert!(br.eos());
        assert_eq!(br.bit_position(), 24);
    }
}
