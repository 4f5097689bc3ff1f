//! 扇区检查工具.
//!
//! 解析已生成扇区中的 Pack 头与分组边界, 供测试与命令行诊断使用.

use std::io::Cursor;

use byteorder::{BigEndian, ByteOrder};
use mplex_core::timestamp::from_base_ext;
use mplex_core::{BitReader, ClockTicks, MuxError, MuxResult};

use crate::encoder::{
    ISO11172_END_CODE, MPEG1_PACK_HEADER_SIZE, MPEG2_PACK_HEADER_SIZE, PACK_START_CODE,
    PACKET_HEADER_SIZE,
};

const PACK_STREAM_ID: u8 = (PACK_START_CODE & 0xFF) as u8;
const END_STREAM_ID: u8 = (ISO11172_END_CODE & 0xFF) as u8;

/// Pack 头内容
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackInfo {
    pub mpeg_version: u8,
    pub scr: ClockTicks,
    /// 50 字节/秒 单位
    pub mux_rate: u32,
    /// Pack 头总长 (含 MPEG-2 填充)
    pub header_len: usize,
}

/// 扇区内的一个结构单元
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    /// 0xBA 表示 Pack 头, 0xB9 表示结束码
    pub stream_id: u8,
    pub offset: usize,
    pub len: usize,
}

fn expect_marker(r: &mut BitReader) -> MuxResult<()> {
    if !r.read_bit()? {
        return Err(MuxError::InvalidData("Pack 头标记位错误".into()));
    }
    Ok(())
}

fn read_clock_base(r: &mut BitReader) -> MuxResult<u64> {
    let hi = u64::from(r.read_bits(3)?);
    expect_marker(r)?;
    let mid = u64::from(r.read_bits(15)?);
    expect_marker(r)?;
    let lo = u64::from(r.read_bits(15)?);
    expect_marker(r)?;
    Ok((hi << 30) | (mid << 15) | lo)
}

/// 解析位于 `bytes` 起始处的 Pack 头
pub fn parse_pack_header(bytes: &[u8]) -> MuxResult<PackInfo> {
    let mut r = BitReader::new(Cursor::new(bytes.to_vec()));
    if r.read_bits(32)? != PACK_START_CODE || r.eos() {
        return Err(MuxError::InvalidData("缺少 Pack 起始码".into()));
    }
    if r.peek_bits(2)? == 0b01 {
        r.read_bits(2)?;
        let base = read_clock_base(&mut r)?;
        let ext = r.read_bits(9)?;
        expect_marker(&mut r)?;
        let mux_rate = r.read_bits(22)?;
        r.read_bits(2)?;
        r.read_bits(5)?;
        let stuffing = r.read_bits(3)? as usize;
        if r.eos() {
            return Err(MuxError::Eof);
        }
        return Ok(PackInfo {
            mpeg_version: 2,
            scr: from_base_ext(base, ext),
            mux_rate,
            header_len: MPEG2_PACK_HEADER_SIZE + stuffing,
        });
    }
    if r.read_bits(4)? != 0b0010 {
        return Err(MuxError::InvalidData("未知的 Pack 头版本".into()));
    }
    let base = read_clock_base(&mut r)?;
    expect_marker(&mut r)?;
    let mux_rate = r.read_bits(22)?;
    expect_marker(&mut r)?;
    if r.eos() {
        return Err(MuxError::Eof);
    }
    Ok(PackInfo {
        mpeg_version: 1,
        scr: from_base_ext(base, 0),
        mux_rate,
        header_len: MPEG1_PACK_HEADER_SIZE,
    })
}

/// 列出扇区中的 Pack 头、系统头、分组与结束码; 末尾的零填充被忽略
pub fn walk_sector(bytes: &[u8]) -> MuxResult<Vec<PacketInfo>> {
    let mut units = Vec::new();
    let mut pos = 0usize;
    while pos + 4 <= bytes.len() {
        if bytes[pos..pos + 3] != [0x00, 0x00, 0x01] {
            if bytes[pos..].iter().all(|&b| b == 0) {
                break;
            }
            return Err(MuxError::InvalidData(format!(
                "扇区偏移 {} 处缺少起始码",
                pos
            )));
        }
        let stream_id = bytes[pos + 3];
        let len = match stream_id {
            PACK_STREAM_ID => parse_pack_header(&bytes[pos..])?.header_len,
            END_STREAM_ID => 4,
            _ => {
                if pos + PACKET_HEADER_SIZE > bytes.len() {
                    return Err(MuxError::InvalidData(format!(
                        "偏移 {} 处的分组头被截断",
                        pos
                    )));
                }
                PACKET_HEADER_SIZE + usize::from(BigEndian::read_u16(&bytes[pos + 4..pos + 6]))
            }
        };
        if pos + len > bytes.len() {
            return Err(MuxError::InvalidData(format!(
                "流 0x{:02X} 的分组 (偏移 {}, 长度 {}) 超出扇区",
                stream_id, pos, len
            )));
        }
        units.push(PacketInfo {
            stream_id,
            offset: pos,
            len,
        });
        pos += len;
    }
    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mpeg1_pack() {
        let bytes = [0x00, 0x00, 0x01, 0xBA, 0x21, 0x00, 0x05, 0xBF, 0x21, 0x80, 0x19, 0xD1];
        let info = parse_pack_header(&bytes).unwrap();
        assert_eq!(info.mpeg_version, 1);
        assert_eq!(info.scr, 27_000_000);
        assert_eq!(info.mux_rate, 3304);
        assert_eq!(info.header_len, 12);
    }

    #[test]
    fn test_parse_mpeg2_pack() {
        let bytes = [
            0x00, 0x00, 0x01, 0xBA, 0x44, 0x00, 0x04, 0x00, 0x04, 0x01, 0x01, 0x89, 0xC3, 0xF8,
        ];
        let info = parse_pack_header(&bytes).unwrap();
        assert_eq!(info.mpeg_version, 2);
        assert_eq!(info.scr, 0);
        assert_eq!(info.mux_rate, 25200);
        assert_eq!(info.header_len, 14);
    }

    #[test]
    fn test_walk_sector_units() {
        let mut sector = vec![0x00, 0x00, 0x01, 0xBA, 0x21, 0x00, 0x01, 0x00, 0x01, 0x80, 0x19, 0xD1];
        sector.extend([0x00, 0x00, 0x01, 0xC0, 0x00, 0x03, 0x0F, 0xAA, 0xBB]);
        sector.extend([0x00, 0x00, 0x01, 0xB9]);
        sector.extend([0u8; 20]);
        let units = walk_sector(&sector).unwrap();
        let ids: Vec<(u8, usize, usize)> =
            units.iter().map(|u| (u.stream_id, u.offset, u.len)).collect();
        assert_eq!(ids, vec![(0xBA, 0, 12), (0xC0, 12, 9), (0xB9, 21, 4)]);
    }

    #[test]
    fn test_walk_sector_rejects_overlong_packet() {
        let sector = [0x00, 0x00, 0x01, 0xE0, 0x01, 0x00, 0x00, 0x00];
        assert!(walk_sector(&sector).is_err());
        assert!(walk_sector(&[0x00, 0x00, 0x02, 0xE0, 0x00]).is_err());
    }
}
