//! 定长缓冲区比特写入器.
//!
//! 在调用方提供的固定大小缓冲区 (通常是一个扇区) 上按位写入, 每次写入都做越界检查.
//! 按大端位序写入 (MSB first), 与 BitReader 对应. 字段按调用顺序逐位落盘, 不做任何重排.

use byteorder::{BigEndian, ByteOrder};

use crate::{MuxError, MuxResult};

/// 定长缓冲区比特写入器
///
/// # 示例
/// ```
/// use mplex_core::bitwriter::BitWriter;
///
/// let mut buf = [0u8; 2];
/// let mut bw = BitWriter::new(&mut buf);
/// bw.write_bits(0b0010, 4).unwrap();
/// bw.write_bits(0b1, 1).unwrap();
/// bw.write_bits(0x7, 3).unwrap();
/// bw.write_u8(0xAB).unwrap();
/// assert!(bw.write_bit(true).is_err());
/// assert_eq!(buf, [0b0010_1111, 0xAB]);
/// ```
pub struct BitWriter<'a> {
    /// 目标缓冲区
    buf: &'a mut [u8],
    /// 绝对位游标
    bit_pos: usize,
}

impl<'a> BitWriter<'a> {
    /// 在缓冲区起始处创建写入器
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, bit_pos: 0 }
    }

    /// 缓冲区容量 (字节)
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// 当前字节位置 (要求已字节对齐时才有意义)
    pub fn position(&self) -> usize {
        self.bit_pos / 8
    }

    /// 当前位位置
    pub fn bit_position(&self) -> usize {
        self.bit_pos
    }

    /// 剩余可写整字节数
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.bit_pos.div_ceil(8))
    }

    /// 是否字节对齐
    pub fn is_aligned(&self) -> bool {
        self.bit_pos % 8 == 0
    }

    fn check_bits(&self, n: usize) -> MuxResult<()> {
        if self.bit_pos + n > self.buf.len() * 8 {
            return Err(MuxError::Internal(format!(
                "BitWriter 越界: 位置 {} + {} 位超出 {} 字节",
                self.bit_pos,
                n,
                self.buf.len(),
            )));
        }
        Ok(())
    }

    fn check_aligned(&self, op: &str) -> MuxResult<()> {
        if !self.is_aligned() {
            return Err(MuxError::Internal(format!("{} 需要字节对齐", op)));
        }
        Ok(())
    }

    /// 写入 1 个位
    pub fn write_bit(&mut self, bit: bool) -> MuxResult<()> {
        self.write_bits(u32::from(bit), 1)
    }

    /// 写入 N 个位 (最多 32 位), 值的低 N 位有效
    pub fn write_bits(&mut self, value: u32, n: u32) -> MuxResult<()> {
        self.write_bits_u64(u64::from(value), n)
    }

    /// 写入 N 个位 (最多 64 位), 用于 33 位时钟字段
    pub fn write_bits_u64(&mut self, value: u64, n: u32) -> MuxResult<()> {
        if n > 64 {
            return Err(MuxError::InvalidArgument(format!(
                "write_bits: n={} 超过 64 位",
                n,
            )));
        }
        self.check_bits(n as usize)?;

        let mut remaining = n;
        while remaining > 0 {
            let idx = self.bit_pos / 8;
            let used = (self.bit_pos % 8) as u32;
            let available = 8 - used;
            let take = remaining.min(available);
            let shift = available - take;
            let mask = (((1u16 << take) - 1) as u8) << shift;
            let bits = ((value >> (remaining - take)) as u8) << shift;
            // 先清除目标位, 缓冲区可能是复用的
            self.buf[idx] = (self.buf[idx] & !mask) | (bits & mask);
            self.bit_pos += take as usize;
            remaining -= take;
        }
        Ok(())
    }

    /// 写入 1 字节
    pub fn write_u8(&mut self, v: u8) -> MuxResult<()> {
        self.write_bits(u32::from(v), 8)
    }

    /// 写入大端 u16
    pub fn write_u16(&mut self, v: u16) -> MuxResult<()> {
        self.check_aligned("write_u16")?;
        self.check_bits(16)?;
        let pos = self.position();
        BigEndian::write_u16(&mut self.buf[pos..pos + 2], v);
        self.bit_pos += 16;
        Ok(())
    }

    /// 写入大端 u32
    pub fn write_u32(&mut self, v: u32) -> MuxResult<()> {
        self.check_aligned("write_u32")?;
        self.check_bits(32)?;
        let pos = self.position();
        BigEndian::write_u32(&mut self.buf[pos..pos + 4], v);
        self.bit_pos += 32;
        Ok(())
    }

    /// 写入字节切片
    pub fn write_bytes(&mut self, data: &[u8]) -> MuxResult<()> {
        self.check_aligned("write_bytes")?;
        self.check_bits(data.len() * 8)?;
        let pos = self.position();
        self.buf[pos..pos + data.len()].copy_from_slice(data);
        self.bit_pos += data.len() * 8;
        Ok(())
    }

    /// 写入 `count` 个相同字节
    pub fn fill(&mut self, byte: u8, count: usize) -> MuxResult<()> {
        self.check_aligned("fill")?;
        self.check_bits(count * 8)?;
        let pos = self.position();
        self.buf[pos..pos + count].fill(byte);
        self.bit_pos += count * 8;
        Ok(())
    }

    /// 回填已写位置的 1 字节 (不移动游标)
    pub fn patch_u8(&mut self, at: usize, v: u8) -> MuxResult<()> {
        if at >= self.buf.len() {
            return Err(MuxError::Internal(format!("patch_u8 越界: {}", at)));
        }
        self.buf[at] = v;
        Ok(())
    }

    /// 回填已写位置的大端 u16 (不移动游标), 用于长度占位字段
    pub fn patch_u16(&mut self, at: usize, v: u16) -> MuxResult<()> {
        if at + 2 > self.buf.len() {
            return Err(MuxError::Internal(format!("patch_u16 越界: {}", at)));
        }
        BigEndian::write_u16(&mut self.buf[at..at + 2], v);
        Ok(())
    }

    /// 移动游标到字节位置
    pub fn set_position(&mut self, at: usize) -> MuxResult<()> {
        if at > self.buf.len() {
            return Err(MuxError::Internal(format!("set_position 越界: {}", at)));
        }
        self.bit_pos = at * 8;
        Ok(())
    }

    /// 访问底层缓冲区 (用于载荷搬移)
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.buf
    }
}
